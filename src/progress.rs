//! # Progress — Debounced Per-Operation Progress Writes
//!
//! Progress is the hot path: a backtest emits an update per bar batch and
//! a trainer per batch group. Writing each one to the database would turn
//! progress into per-unit traffic, so updates are collapsed per operation
//! and flushed at a short debounce (≈250 ms), latest value wins.
//!
//! ## Epoch Monotonicity
//!
//! Within one ownership epoch, percent never regresses: a stale update is
//! rejected here and again by the conditional UPDATE in the repository.
//! A resume starts a new epoch and may legitimately report a lower
//! percent; consumers must tolerate the drop (the core does not smooth
//! it, since smoothing would lie about the actual resume point).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::db::Database;

/// Default debounce window.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    pub operation_id: String,
    pub run_epoch: i64,
    pub percent: f64,
    pub message: String,
    pub context: Option<Value>,
}

struct Entry {
    run_epoch: i64,
    percent: f64,
    message: String,
    context: Option<Value>,
    dirty: bool,
    last_flushed: Option<Instant>,
}

pub struct ProgressDebouncer {
    entries: Mutex<HashMap<String, Entry>>,
    debounce: Duration,
}

impl ProgressDebouncer {
    pub fn new(debounce: Duration) -> Self {
        ProgressDebouncer {
            entries: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Record an update. Returns false when the update is discarded: an
    /// older epoch, or a percent regression within the current epoch.
    pub fn offer(
        &self,
        operation_id: &str,
        run_epoch: i64,
        percent: f64,
        message: &str,
        context: Option<Value>,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(operation_id) {
            Some(entry) if run_epoch < entry.run_epoch => {
                debug!(operation_id, run_epoch, "discarding stale-epoch progress");
                false
            }
            Some(entry) if run_epoch == entry.run_epoch && percent < entry.percent => {
                debug!(
                    operation_id,
                    percent, entry.percent, "discarding regressing progress"
                );
                false
            }
            Some(entry) => {
                if run_epoch > entry.run_epoch {
                    // New ownership epoch: the monotonic floor resets.
                    entry.run_epoch = run_epoch;
                }
                entry.percent = percent;
                entry.message = message.to_string();
                entry.context = context;
                entry.dirty = true;
                true
            }
            None => {
                entries.insert(
                    operation_id.to_string(),
                    Entry {
                        run_epoch,
                        percent,
                        message: message.to_string(),
                        context,
                        dirty: true,
                        last_flushed: None,
                    },
                );
                true
            }
        }
    }

    /// Latest value for an operation, debounce state aside.
    pub fn snapshot(&self, operation_id: &str) -> Option<ProgressSnapshot> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(operation_id).map(|e| ProgressSnapshot {
            operation_id: operation_id.to_string(),
            run_epoch: e.run_epoch,
            percent: e.percent,
            message: e.message.clone(),
            context: e.context.clone(),
        })
    }

    /// Collect dirty entries whose debounce window has elapsed, marking
    /// them clean. Called by the flusher task.
    fn take_due(&self, force: bool) -> Vec<ProgressSnapshot> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if !entry.dirty {
                continue;
            }
            let elapsed_ok = entry
                .last_flushed
                .map(|t| now.duration_since(t) >= self.debounce)
                .unwrap_or(true);
            if force || elapsed_ok {
                entry.dirty = false;
                entry.last_flushed = Some(now);
                due.push(ProgressSnapshot {
                    operation_id: id.clone(),
                    run_epoch: entry.run_epoch,
                    percent: entry.percent,
                    message: entry.message.clone(),
                    context: entry.context.clone(),
                });
            }
        }
        due
    }

    /// Flush due entries to the database. Write failures warn and leave
    /// the entry clean; the next offer re-dirties it.
    pub async fn flush(&self, db: &Database) {
        for snap in self.take_due(false) {
            self.write(db, &snap).await;
        }
    }

    /// Flush everything dirty immediately (shutdown path).
    pub async fn flush_all(&self, db: &Database) {
        for snap in self.take_due(true) {
            self.write(db, &snap).await;
        }
    }

    async fn write(&self, db: &Database, snap: &ProgressSnapshot) {
        match db
            .update_operation_progress(
                &snap.operation_id,
                snap.run_epoch,
                snap.percent,
                &snap.message,
                snap.context.as_ref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Races with cancellation or a terminal transition.
                warn!(
                    operation_id = %snap.operation_id,
                    "progress write discarded (operation not RUNNING in this epoch)"
                );
            }
            Err(e) => {
                warn!(operation_id = %snap.operation_id, error = %e, "progress write failed");
            }
        }
    }

    /// Drop an operation's entry once it reaches a terminal state.
    pub fn forget(&self, operation_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(operation_id);
    }
}

impl Default for ProgressDebouncer {
    fn default() -> Self {
        ProgressDebouncer::new(DEBOUNCE)
    }
}
