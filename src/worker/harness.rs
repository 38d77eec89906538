//! # Execution Harness — The Unit-Loop Contract
//!
//! Domain executors (training, backtesting) host their inner loop inside
//! this harness. The harness owns the three contract points:
//!
//! 1. **Cancellation check** — `is_cancel_requested()` reads one atomic
//!    refreshed by the heartbeat thread; executors call it at their
//!    cadence points (epoch boundaries and every 50 batches for training,
//!    every checkpoint-policy tick for backtesting).
//! 2. **Progress emission** — `update_progress` feeds the 250 ms debounced
//!    repository write and the snapshot the heartbeat thread forwards.
//! 3. **Checkpoint persistence** — `checkpoint_due`/`save_periodic` fire
//!    on whichever of (unit interval, time interval) triggers first;
//!    terminal saves are forced by [`execute_operation`] on cancellation,
//!    failure, and shutdown.
//!
//! The executor runs on a dedicated blocking thread; database and store
//! calls are bridged with `Handle::block_on`, which is safe because the
//! thread is not a Tokio task.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::checkpoint::{ArtifactFile, CheckpointState, CheckpointStore, CheckpointType};
use crate::db::Database;
use crate::error::CoreResult;
use crate::operation::{
    CompletedOperation, FailureKind, OperationError, OperationStatus, ProgressUpdate,
};
use crate::progress::{ProgressDebouncer, ProgressSnapshot};

/// How an executor's run ended.
pub enum ExecutionOutcome {
    /// Finished normally; the value becomes the operation's `result`.
    Completed(Value),
    /// The executor observed the cancellation flag and stopped at a
    /// consistent point.
    Cancelled,
}

/// A domain executor hosted by the harness. `run` drives the inner loop;
/// `checkpoint` must return a consistent snapshot of in-memory state and
/// is called between units, never concurrently with `run`.
pub trait OperationExecutor: Send {
    fn run(&mut self, harness: &mut Harness<'_>) -> CoreResult<ExecutionOutcome>;
    fn checkpoint(&self) -> (CheckpointState, Vec<ArtifactFile>);
}

/// Per-operation-type checkpoint cadence: fires on whichever of the two
/// intervals triggers first since the last checkpoint.
#[derive(Clone, Copy, Debug)]
pub struct CheckpointPolicy {
    pub unit_interval: u64,
    pub time_interval: Duration,
}

impl CheckpointPolicy {
    pub fn new(unit_interval: u64, time_interval: Duration) -> Self {
        CheckpointPolicy {
            unit_interval: unit_interval.max(1),
            time_interval,
        }
    }
}

/// Everything the harness needs to run one operation.
pub struct ExecutionContext {
    pub operation_id: String,
    pub worker_id: String,
    pub run_epoch: i64,
    pub policy: CheckpointPolicy,
    pub db: Database,
    pub store: CheckpointStore,
    pub rt: tokio::runtime::Handle,
    pub cancel: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
    /// Latest progress, read by the heartbeat thread.
    pub progress_slot: Arc<Mutex<Option<ProgressSnapshot>>>,
}

pub struct Harness<'a> {
    ctx: &'a ExecutionContext,
    debouncer: ProgressDebouncer,
    units_since_checkpoint: u64,
    last_checkpoint_at: Instant,
    last_progress_flush: Instant,
}

impl<'a> Harness<'a> {
    fn new(ctx: &'a ExecutionContext) -> Self {
        Harness {
            ctx,
            debouncer: ProgressDebouncer::default(),
            units_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            last_progress_flush: Instant::now(),
        }
    }

    /// Cheap cancellation probe: one relaxed atomic load.
    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.ctx.cancel.load(Ordering::Relaxed) || self.ctx.shutdown.load(Ordering::Relaxed)
    }

    pub fn operation_id(&self) -> &str {
        &self.ctx.operation_id
    }

    pub fn run_epoch(&self) -> i64 {
        self.ctx.run_epoch
    }

    /// Record progress. Debounced into the repository (≈250 ms, latest
    /// value wins) and mirrored into the heartbeat snapshot.
    pub fn update_progress(
        &mut self,
        unit_index: u64,
        total_units: u64,
        message: &str,
        context: Option<Value>,
    ) {
        let percent = if total_units == 0 {
            0.0
        } else {
            (unit_index as f64 / total_units as f64 * 100.0).min(100.0)
        };
        self.debouncer.offer(
            &self.ctx.operation_id,
            self.ctx.run_epoch,
            percent,
            message,
            context,
        );
        if let Some(snapshot) = self.debouncer.snapshot(&self.ctx.operation_id) {
            *self
                .ctx
                .progress_slot
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        }
        // Piggyback the flush on the progress call: the executor thread is
        // the only writer, so a short elapsed check suffices.
        if self.last_progress_flush.elapsed() >= crate::progress::DEBOUNCE {
            self.last_progress_flush = Instant::now();
            let db = self.ctx.db.clone();
            let debouncer = &self.debouncer;
            self.ctx.rt.block_on(debouncer.flush(&db));
        }
    }

    /// Advance the checkpoint cadence by `units` and report whether a
    /// periodic checkpoint is due.
    pub fn checkpoint_due(&mut self, units: u64) -> bool {
        self.units_since_checkpoint += units;
        self.units_since_checkpoint >= self.ctx.policy.unit_interval
            || self.last_checkpoint_at.elapsed() >= self.ctx.policy.time_interval
    }

    /// Persist a periodic checkpoint. Failures are logged and skipped —
    /// the next tick retries; the run continues either way.
    pub fn save_periodic(&mut self, state: CheckpointState, artifacts: Vec<ArtifactFile>) {
        match self.save(CheckpointType::Periodic, state, artifacts) {
            Ok(()) => {
                self.units_since_checkpoint = 0;
                self.last_checkpoint_at = Instant::now();
            }
            Err(e) => {
                warn!(
                    operation_id = %self.ctx.operation_id,
                    error = %e,
                    "periodic checkpoint failed; will retry on next tick"
                );
            }
        }
    }

    fn save(
        &self,
        checkpoint_type: CheckpointType,
        state: CheckpointState,
        artifacts: Vec<ArtifactFile>,
    ) -> CoreResult<()> {
        self.ctx.rt.block_on(self.ctx.store.save(
            &self.ctx.operation_id,
            checkpoint_type,
            &state,
            &artifacts,
        ))
    }

    fn flush_progress(&self) {
        self.ctx
            .rt
            .block_on(self.debouncer.flush_all(&self.ctx.db));
    }
}

/// Drive one operation to a terminal state. Returns the terminal record
/// the worker retains for post-blackout reporting, or `None` when the
/// database refused the terminal transition (the operation was concluded
/// elsewhere and this run's outcome is abandoned).
pub fn execute_operation(
    ctx: &ExecutionContext,
    executor: &mut dyn OperationExecutor,
) -> Option<CompletedOperation> {
    let mut harness = Harness::new(ctx);
    info!(
        operation_id = %ctx.operation_id,
        run_epoch = ctx.run_epoch,
        "executor starting"
    );

    let outcome = executor.run(&mut harness);
    harness.flush_progress();

    match outcome {
        Ok(ExecutionOutcome::Completed(result)) => {
            match ctx.rt.block_on(ctx.db.complete_operation(&ctx.operation_id, &result)) {
                Ok(()) => {
                    // Completion deletes the checkpoint: a COMPLETED
                    // operation must have none.
                    if let Err(e) = ctx.rt.block_on(ctx.store.delete(&ctx.operation_id)) {
                        warn!(operation_id = %ctx.operation_id, error = %e,
                              "checkpoint cleanup after completion failed");
                    }
                    info!(operation_id = %ctx.operation_id, "operation completed");
                    Some(terminal(ctx, OperationStatus::Completed, Some(result), None))
                }
                Err(e) => {
                    warn!(operation_id = %ctx.operation_id, error = %e,
                          "completion refused; outcome abandoned");
                    None
                }
            }
        }
        Ok(ExecutionOutcome::Cancelled) => {
            let checkpoint_type = if ctx.shutdown.load(Ordering::Relaxed) {
                CheckpointType::Shutdown
            } else {
                CheckpointType::Cancellation
            };
            let (state, artifacts) = executor.checkpoint();
            let save_error = harness
                .save(checkpoint_type, state, artifacts)
                .err()
                .map(|e| e.to_string());
            match ctx.rt.block_on(ctx.db.finalize_cancel(&ctx.operation_id)) {
                Ok(()) => {
                    if let Some(save_error) = &save_error {
                        record_checkpoint_failure(ctx, save_error);
                    }
                    info!(operation_id = %ctx.operation_id, "operation cancelled");
                    Some(terminal(ctx, OperationStatus::Cancelled, None, None))
                }
                Err(e) => {
                    // The coordinator concluded the operation while this
                    // worker was away (STOP path): drop the local outcome.
                    warn!(operation_id = %ctx.operation_id, error = %e,
                          "cancel finalize refused; outcome abandoned");
                    None
                }
            }
        }
        Err(domain_error) => {
            let (state, artifacts) = executor.checkpoint();
            let save_error = harness
                .save(CheckpointType::Failure, state, artifacts)
                .err()
                .map(|e| e.to_string());
            let mut error = OperationError::new(
                FailureKind::DomainException,
                domain_error.to_string(),
            );
            if let Some(save_error) = &save_error {
                error = error.with_context(serde_json::json!({
                    "checkpoint_error": save_error,
                }));
            }
            match ctx.rt.block_on(ctx.db.fail_operation(
                &ctx.operation_id,
                &error,
                &[OperationStatus::Running],
            )) {
                Ok(()) => {
                    warn!(operation_id = %ctx.operation_id, error = %domain_error,
                          "operation failed");
                    Some(terminal(ctx, OperationStatus::Failed, None, Some(error)))
                }
                Err(e) => {
                    warn!(operation_id = %ctx.operation_id, error = %e,
                          "failure transition refused; outcome abandoned");
                    None
                }
            }
        }
    }
}

fn terminal(
    ctx: &ExecutionContext,
    status: OperationStatus,
    result: Option<Value>,
    error: Option<OperationError>,
) -> CompletedOperation {
    CompletedOperation {
        operation_id: ctx.operation_id.clone(),
        status,
        result,
        error,
        completed_at: chrono::Utc::now(),
    }
}

/// The terminal transition succeeded but the checkpoint did not persist:
/// preserve the evidence on the record for forensics.
fn record_checkpoint_failure(ctx: &ExecutionContext, save_error: &str) {
    let error = OperationError::new(
        FailureKind::CheckpointWriteFailedOnTerminal,
        "terminal checkpoint was not persisted",
    )
    .with_context(serde_json::json!({ "checkpoint_error": save_error }));
    if let Ok(error_json) = serde_json::to_value(&error) {
        let result = ctx.rt.block_on(async {
            sqlx::query(
                "UPDATE operations SET error = $2
                  WHERE operation_id = $1 AND status IN ('CANCELLED', 'FAILED')",
            )
            .bind(&ctx.operation_id)
            .bind(&error_json)
            .execute(ctx.db.pool())
            .await
        });
        if let Err(e) = result {
            warn!(operation_id = %ctx.operation_id, error = %e,
                  "failed to record terminal checkpoint failure");
        }
    }
}

/// Build the heartbeat progress body from the latest snapshot.
pub fn progress_payload(snapshot: &ProgressSnapshot) -> ProgressUpdate {
    ProgressUpdate {
        percent: snapshot.percent,
        message: snapshot.message.clone(),
        context: snapshot.context.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_clamps_zero_unit_interval() {
        let p = CheckpointPolicy::new(0, Duration::from_secs(60));
        assert_eq!(p.unit_interval, 1);
    }
}
