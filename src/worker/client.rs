//! # Coordinator Client — Registration and Heartbeats
//!
//! The worker side of fleet coordination: registers with the coordinator,
//! heartbeats on a fixed interval, and reports terminal results retained
//! across coordinator blackouts. Uses `ureq` (blocking HTTP) on a
//! background thread; the cancellation flag flows from here to the
//! executor thread through a lock-free atomic.
//!
//! ## Blackout Behavior
//!
//! Two consecutive heartbeat failures put the client in disconnected
//! mode: the current operation keeps running locally. The first
//! successful call after a blackout re-registers with the full packet —
//! `current_operation_id` plus the in-memory `completed_operations` list
//! (retained for one hour) — so the reconciler can catch the database up.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use sysinfo::System;
use tracing::{info, warn};

use crate::operation::CompletedOperation;
use crate::progress::ProgressSnapshot;
use crate::reconciler::{Directive, RegistrationAck, RegistrationPacket};
use crate::telemetry;

/// How long terminal results are retained for post-blackout reporting.
fn completed_retention() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// Consecutive heartbeat failures before entering disconnected mode.
const DISCONNECT_THRESHOLD: u32 = 2;

/// Cap for registration retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct CoordinatorClient {
    agent: ureq::Agent,
    coordinator_url: String,
    worker_id: String,
    worker_type: crate::operation::OperationType,
    endpoint_url: String,
    capabilities: Value,
    heartbeat_interval: Duration,
    shutdown: Arc<AtomicBool>,
    /// Set when the coordinator requests cancellation; read by the harness.
    pub cancel_requested: Arc<AtomicBool>,
    /// The operation this worker is currently running.
    pub current: Arc<Mutex<Option<String>>>,
    /// Ownership epoch of the current operation, sent with progress.
    pub run_epoch: Arc<Mutex<Option<i64>>>,
    /// Latest progress snapshot, forwarded on heartbeats.
    pub progress: Arc<Mutex<Option<ProgressSnapshot>>>,
    /// Terminal results retained for post-blackout reporting.
    pub completed: Arc<Mutex<VecDeque<CompletedOperation>>>,
}

impl CoordinatorClient {
    pub fn new(
        coordinator_url: &str,
        worker_id: &str,
        worker_type: crate::operation::OperationType,
        endpoint_url: &str,
        capabilities: Value,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_connect(Some(Duration::from_secs(5)))
                .timeout_send_request(Some(Duration::from_secs(60)))
                .build(),
        );
        Arc::new(CoordinatorClient {
            agent,
            coordinator_url: coordinator_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
            worker_type,
            endpoint_url: endpoint_url.to_string(),
            capabilities,
            heartbeat_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
            run_epoch: Arc::new(Mutex::new(None)),
            progress: Arc::new(Mutex::new(None)),
            completed: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    fn registration_packet(&self) -> RegistrationPacket {
        let current_operation_id = lock(&self.current).clone();
        let completed_operations: Vec<CompletedOperation> =
            lock(&self.completed).iter().cloned().collect();
        RegistrationPacket {
            worker_id: self.worker_id.clone(),
            worker_type: self.worker_type,
            endpoint_url: self.endpoint_url.clone(),
            capabilities: self.capabilities.clone(),
            current_operation_id,
            completed_operations,
        }
    }

    /// Register once. Applies the directive from the reconciled ack.
    fn register(&self) -> Result<RegistrationAck, ureq::Error> {
        let url = format!("{}/api/v1/workers/register", self.coordinator_url);
        let packet = self.registration_packet();
        let ack: RegistrationAck = self
            .agent
            .post(&url)
            .send_json(&packet)
            .and_then(|mut resp| resp.body_mut().read_json())?;
        info!(
            worker_id = %self.worker_id,
            directive = ?ack.directive,
            reconciled = ack.reconciled_current_operation_id.as_deref().unwrap_or("-"),
            "registered with coordinator"
        );
        if ack.directive == Directive::Stop && lock(&self.current).is_some() {
            // The database holds a terminal or foreign-owned state for our
            // claim; the harness observes the flag and abandons cleanly.
            self.cancel_requested.store(true, Ordering::Relaxed);
        }
        Ok(ack)
    }

    /// Register with capped exponential backoff until success or shutdown.
    fn register_with_retry(&self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.register() {
                Ok(_) => return,
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "registration failed; retrying");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Record a terminal result for post-blackout reporting and prune
    /// entries past the retention window.
    pub fn record_completed(&self, completed: CompletedOperation) {
        let mut list = lock(&self.completed);
        list.push_back(completed);
        let cutoff = chrono::Utc::now() - completed_retention();
        while list
            .front()
            .map(|c| c.completed_at < cutoff)
            .unwrap_or(false)
        {
            list.pop_front();
        }
    }

    /// Spawn the registration + heartbeat thread.
    pub fn start(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let client = Arc::clone(self);
        thread::spawn(move || {
            client.register_with_retry();

            let heartbeat_url = format!(
                "{}/api/v1/workers/{}/heartbeat",
                client.coordinator_url, client.worker_id
            );
            let mut sys = System::new();
            let mut consecutive_failures: u32 = 0;
            let mut disconnected = false;

            loop {
                thread::sleep(client.heartbeat_interval);
                if client.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                sys.refresh_cpu_all();
                sys.refresh_memory();
                let metrics = telemetry::collect(&sys);

                let current = lock(&client.current).clone();
                let run_epoch = *lock(&client.run_epoch);
                let progress = lock(&client.progress)
                    .as_ref()
                    .map(super::harness::progress_payload);

                let mut body = serde_json::json!({ "metrics": metrics });
                if let Some(op) = &current {
                    body["current_operation_id"] = Value::String(op.clone());
                    if let Some(epoch) = run_epoch {
                        body["run_epoch"] = Value::Number(epoch.into());
                    }
                    if let Some(progress) = progress {
                        body["progress"] = serde_json::to_value(progress).unwrap_or_default();
                    }
                }

                match client.agent.post(&heartbeat_url).send_json(&body) {
                    Ok(mut resp) => {
                        if disconnected {
                            // First contact after a blackout: the
                            // coordinator may have restarted and lost us.
                            info!("coordinator reachable again; re-registering");
                            client.register_with_retry();
                            disconnected = false;
                        }
                        consecutive_failures = 0;
                        if let Ok(ack) = resp.body_mut().read_json::<Value>() {
                            if ack["cancel_requested"].as_bool() == Some(true) {
                                info!("coordinator requested cancellation");
                                client.cancel_requested.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(ureq::Error::StatusCode(404)) => {
                        // The registry does not know us: re-register with
                        // the full packet immediately.
                        warn!("coordinator lost our registration; re-registering");
                        client.register_with_retry();
                        consecutive_failures = 0;
                        disconnected = false;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(error = %e, consecutive_failures, "heartbeat failed");
                        if consecutive_failures >= DISCONNECT_THRESHOLD && !disconnected {
                            warn!("entering disconnected mode; operation continues locally");
                            disconnected = true;
                        }
                    }
                }
            }
        })
    }

    /// Stop the heartbeat thread and deregister (best-effort).
    pub fn deregister(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let url = format!(
            "{}/api/v1/workers/{}/deregister",
            self.coordinator_url, self.worker_id
        );
        if let Err(e) = self.agent.post(&url).send_json(&serde_json::json!({})) {
            warn!(error = %e, "deregistration failed");
        }
    }
}
