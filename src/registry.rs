//! # Worker Registry — In-Memory Fleet Index
//!
//! Authoritative index of known workers: state, capabilities, the
//! operation each worker claims, and liveness. Every mutation is mirrored
//! to the `workers` table by the caller so a coordinator restart can
//! rebuild the index; the index itself is never authoritative — the
//! database is.
//!
//! ## Data Flow
//!
//! ```text
//! Worker → POST /api/v1/workers/register   → Registry::register()
//! Worker → POST /api/v1/workers/{id}/heartbeat → Registry::heartbeat()
//! Dispatch → Registry::select() → Registry::mark_busy()
//! Background → Registry::sweep_unresponsive(60s)
//! ```
//!
//! ## Selection
//!
//! `select` is deterministic given equal candidates: most satisfied
//! capability filters first, then least-recently-used (earliest heartbeat
//! among AVAILABLE), then lexicographic worker id.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::db::WorkerDbRow;
use crate::operation::OperationType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Known from the durable mirror but not yet heard from this process
    /// lifetime; never selected for dispatch.
    Registered,
    Available,
    Busy,
    /// Missed heartbeats beyond the threshold. A signal to the reconciler,
    /// not a terminal state — a later heartbeat restores the worker.
    Unresponsive,
    Deregistered,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Registered => "REGISTERED",
            WorkerStatus::Available => "AVAILABLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Unresponsive => "UNRESPONSIVE",
            WorkerStatus::Deregistered => "DEREGISTERED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" => Some(WorkerStatus::Registered),
            "AVAILABLE" => Some(WorkerStatus::Available),
            "BUSY" => Some(WorkerStatus::Busy),
            "UNRESPONSIVE" => Some(WorkerStatus::Unresponsive),
            "DEREGISTERED" => Some(WorkerStatus::Deregistered),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub worker_type: OperationType,
    pub endpoint_url: String,
    pub capabilities: Value,
    pub status: WorkerStatus,
    pub current_operation_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            workers: HashMap::new(),
        }
    }

    /// Rebuild the index from the durable mirror at startup. Hydrated
    /// workers come back as REGISTERED regardless of their stored state:
    /// liveness is unknown until they heartbeat again.
    pub fn hydrate(&mut self, rows: Vec<WorkerDbRow>) {
        for row in rows {
            let Some(worker_type) = OperationType::parse(&row.worker_type) else {
                continue;
            };
            self.workers.insert(
                row.worker_id.clone(),
                WorkerEntry {
                    worker_id: row.worker_id,
                    worker_type,
                    endpoint_url: row.endpoint_url,
                    capabilities: row.capabilities,
                    status: WorkerStatus::Registered,
                    current_operation_id: row.current_operation_id,
                    registered_at: row.registered_at,
                    last_heartbeat_at: row.last_heartbeat_at,
                },
            );
        }
    }

    /// Create or update a worker. A re-registration refreshes everything
    /// in place; the claimed operation is recorded as-is — reconciliation
    /// decides whether the claim stands.
    pub fn register(
        &mut self,
        worker_id: &str,
        worker_type: OperationType,
        endpoint_url: &str,
        capabilities: Value,
        current_operation_id: Option<String>,
    ) -> &WorkerEntry {
        let now = Utc::now();
        let status = if current_operation_id.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Available
        };
        let registered_at = self
            .workers
            .get(worker_id)
            .map(|w| w.registered_at)
            .unwrap_or(now);
        self.workers.insert(
            worker_id.to_string(),
            WorkerEntry {
                worker_id: worker_id.to_string(),
                worker_type,
                endpoint_url: endpoint_url.to_string(),
                capabilities,
                status,
                current_operation_id,
                registered_at,
                last_heartbeat_at: now,
            },
        );
        self.workers
            .get(worker_id)
            .expect("entry inserted on the line above")
    }

    /// Refresh liveness. Returns false for unknown workers (the worker
    /// must re-register). An UNRESPONSIVE worker is restored to its prior
    /// state, inferred from whether it still claims an operation.
    pub fn heartbeat(&mut self, worker_id: &str, current_operation_id: Option<&str>) -> bool {
        let Some(w) = self.workers.get_mut(worker_id) else {
            return false;
        };
        w.last_heartbeat_at = Utc::now();
        w.current_operation_id = current_operation_id.map(|s| s.to_string());
        w.status = match (w.status, current_operation_id) {
            (WorkerStatus::Deregistered, _) => WorkerStatus::Deregistered,
            (_, Some(_)) => WorkerStatus::Busy,
            (WorkerStatus::Busy, None) => WorkerStatus::Available,
            (WorkerStatus::Unresponsive, None) => WorkerStatus::Available,
            (WorkerStatus::Registered, None) => WorkerStatus::Available,
            (s, None) => s,
        };
        true
    }

    pub fn deregister(&mut self, worker_id: &str) {
        if let Some(w) = self.workers.get_mut(worker_id) {
            w.status = WorkerStatus::Deregistered;
            w.current_operation_id = None;
        }
    }

    pub fn remove(&mut self, worker_id: &str) {
        self.workers.remove(worker_id);
    }

    /// Pick an AVAILABLE worker for the capability. `filters` are
    /// key-equality checks against the worker's capability document;
    /// workers failing any filter are excluded, and among the rest the
    /// one satisfying the most filter keys wins (all of them, by
    /// construction), then LRU, then lexicographic id.
    pub fn select(
        &self,
        required: OperationType,
        filters: &[(String, Value)],
    ) -> Option<WorkerEntry> {
        let mut candidates: Vec<&WorkerEntry> = self
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Available && w.worker_type == required)
            .filter(|w| {
                filters
                    .iter()
                    .all(|(key, expected)| w.capabilities.get(key) == Some(expected))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.last_heartbeat_at
                .cmp(&b.last_heartbeat_at)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        candidates.first().map(|w| (*w).clone())
    }

    pub fn mark_busy(&mut self, worker_id: &str, operation_id: &str) {
        if let Some(w) = self.workers.get_mut(worker_id) {
            w.status = WorkerStatus::Busy;
            w.current_operation_id = Some(operation_id.to_string());
        }
    }

    pub fn mark_available(&mut self, worker_id: &str) {
        if let Some(w) = self.workers.get_mut(worker_id) {
            w.status = WorkerStatus::Available;
            w.current_operation_id = None;
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerEntry> {
        self.workers.get(worker_id)
    }

    pub fn get_all(&self) -> Vec<WorkerEntry> {
        let mut all: Vec<_> = self.workers.values().cloned().collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    /// Mark AVAILABLE/BUSY workers silent beyond `timeout_secs` as
    /// UNRESPONSIVE. Returns the ids newly marked.
    pub fn sweep_unresponsive(&mut self, timeout_secs: i64) -> Vec<String> {
        let cutoff = Utc::now() - ChronoDuration::seconds(timeout_secs);
        let mut marked = Vec::new();
        for w in self.workers.values_mut() {
            if matches!(w.status, WorkerStatus::Available | WorkerStatus::Busy)
                && w.last_heartbeat_at < cutoff
            {
                w.status = WorkerStatus::Unresponsive;
                marked.push(w.worker_id.clone());
            }
        }
        marked.sort();
        marked
    }

    /// Drop DEREGISTERED entries and UNRESPONSIVE entries older than the
    /// eviction grace. Returns the ids removed.
    pub fn evict(&mut self, unresponsive_grace_secs: i64) -> Vec<String> {
        let cutoff = Utc::now() - ChronoDuration::seconds(unresponsive_grace_secs);
        let mut evicted: Vec<String> = self
            .workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Deregistered
                    || (w.status == WorkerStatus::Unresponsive && w.last_heartbeat_at < cutoff)
            })
            .map(|w| w.worker_id.clone())
            .collect();
        for id in &evicted {
            self.workers.remove(id);
        }
        evicted.sort();
        evicted
    }
}
