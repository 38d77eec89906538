//! # Reconciler — Three-Way Truth Resolution
//!
//! The database, the worker's live report, and the checkpoint are three
//! independent sources of truth that diverge whenever a process crashes or
//! a network partitions. The reconciler resolves divergence and advances
//! stuck operations to terminal states.
//!
//! ## Triggers
//!
//! 1. Worker registration / re-registration (`reconcile_registration`)
//! 2. Coordinator startup (`startup_scan`)
//! 3. Periodic background sweep (`sweep`, default 30 s)
//!
//! ## Policy
//!
//! | DB status | Worker reports | Action |
//! |---|---|---|
//! | RUNNING | RUNNING, same worker | refresh heartbeat, CONTINUE |
//! | RUNNING | terminal (completed list) | apply reported status; drop checkpoint on COMPLETED |
//! | RUNNING | silence | wait for grace, then FAILED `ORPHANED` |
//! | terminal | RUNNING | trust the DB, STOP the worker |
//! | missing | RUNNING | recreate the record under the reporting worker |
//! | RUNNING, backend-local | n/a (startup) | FAILED immediately, checkpoint hint |
//! | RUNNING, worker-owned | backend restart | PENDING_RECONCILIATION, resolve or fail |
//!
//! Within one registration, the completed list is applied before the
//! current operation so stale terminal information can never resurrect a
//! just-completed operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::db::{Database, SystemLogEntry};
use crate::error::{CoreError, CoreResult};
use crate::operation::{
    CompletedOperation, FailureKind, OperationError, OperationStatus, OperationType,
};

// ── Wire types ──────────────────────────────────────────────────

/// The full packet a worker sends at (re-)registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationPacket {
    pub worker_id: String,
    pub worker_type: OperationType,
    pub endpoint_url: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub current_operation_id: Option<String>,
    #[serde(default)]
    pub completed_operations: Vec<CompletedOperation>,
}

/// What the worker should do with its current operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Directive {
    Continue,
    Stop,
    Idle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub reconciled_current_operation_id: Option<String>,
    pub directive: Directive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub orphaned: usize,
    pub reconciliations_expired: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub backend_local_failed: usize,
    pub parked_for_reconciliation: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub operations_deleted: usize,
    pub checkpoints_deleted: usize,
    pub staging_dirs_removed: usize,
}

// ── Reconciler ──────────────────────────────────────────────────

pub struct Reconciler {
    db: Database,
    store: CheckpointStore,
    orphan_timeout_seconds: u64,
    reconciliation_grace_seconds: u64,
    operation_retention_hours: i64,
    checkpoint_retention_hours: i64,
    /// Serializes registration-plus-reconciliation so no two registrations
    /// reconcile the same operation concurrently.
    registration_gate: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(db: Database, store: CheckpointStore, cfg: &Config) -> Self {
        Reconciler {
            db,
            store,
            orphan_timeout_seconds: cfg.orphan_timeout_seconds,
            reconciliation_grace_seconds: cfg.reconciliation_grace_seconds,
            operation_retention_hours: cfg.operation_retention_hours,
            checkpoint_retention_hours: cfg.checkpoint_retention_hours,
            registration_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Reconcile a registration packet and compute the worker's directive.
    /// Ordering is strict: the completed list first, the current claim
    /// second.
    pub async fn reconcile_registration(&self, packet: &RegistrationPacket) -> RegistrationAck {
        let _gate = self.registration_gate.lock().await;

        for completed in &packet.completed_operations {
            self.apply_completed(&packet.worker_id, completed).await;
        }

        let Some(current_id) = packet.current_operation_id.as_deref() else {
            return RegistrationAck {
                reconciled_current_operation_id: None,
                directive: Directive::Idle,
            };
        };

        match self.reconcile_current(packet, current_id).await {
            Ok(directive) => {
                let reconciled = match directive {
                    Directive::Continue => Some(current_id.to_string()),
                    _ => None,
                };
                RegistrationAck {
                    reconciled_current_operation_id: reconciled,
                    directive,
                }
            }
            Err(e) => {
                warn!(
                    worker_id = %packet.worker_id,
                    operation_id = current_id,
                    error = %e,
                    "reconciliation of current operation failed; stopping worker"
                );
                RegistrationAck {
                    reconciled_current_operation_id: None,
                    directive: Directive::Stop,
                }
            }
        }
    }

    /// Apply one worker-reported terminal outcome. Conflicts mean the
    /// database already knows a terminal state — stale info, ignored.
    async fn apply_completed(&self, worker_id: &str, completed: &CompletedOperation) {
        let status = completed.status;
        if !status.is_terminal() {
            warn!(
                worker_id,
                operation_id = %completed.operation_id,
                status = %status,
                "worker reported a non-terminal status in completed_operations; ignoring"
            );
            return;
        }
        let error_json = completed
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok());
        let applied = self
            .db
            .apply_reported_terminal(
                &completed.operation_id,
                status,
                completed.result.as_ref(),
                error_json.as_ref(),
            )
            .await;
        match applied {
            Ok(()) => {
                info!(
                    worker_id,
                    operation_id = %completed.operation_id,
                    status = %status,
                    "applied worker-reported terminal status"
                );
                if status == OperationStatus::Completed {
                    if let Err(e) = self.store.delete(&completed.operation_id).await {
                        warn!(
                            operation_id = %completed.operation_id,
                            error = %e,
                            "failed to delete checkpoint after reported completion"
                        );
                    }
                }
                self.log(
                    "info",
                    format!(
                        "worker {} reported {} for {}",
                        worker_id, status, completed.operation_id
                    ),
                    Some(&completed.operation_id),
                    Some(worker_id),
                )
                .await;
            }
            Err(CoreError::StateConflict { .. }) => {
                // Already terminal in the DB; the report is stale.
            }
            Err(e) => {
                warn!(
                    operation_id = %completed.operation_id,
                    error = %e,
                    "failed to apply reported terminal status"
                );
            }
        }
    }

    async fn reconcile_current(
        &self,
        packet: &RegistrationPacket,
        current_id: &str,
    ) -> CoreResult<Directive> {
        let row = self
            .db
            .get_operation(current_id)
            .await
            .map_err(CoreError::Other)?;

        let Some(row) = row else {
            // The worker survived a coordinator data loss: recreate the
            // record under the reporting owner.
            self.db
                .recreate_running_operation(current_id, packet.worker_type, &packet.worker_id)
                .await?;
            info!(
                worker_id = %packet.worker_id,
                operation_id = current_id,
                "recreated lost operation record from worker report"
            );
            self.log(
                "warn",
                format!(
                    "recreated operation {} from worker {} report (record was missing)",
                    current_id, packet.worker_id
                ),
                Some(current_id),
                Some(&packet.worker_id),
            )
            .await;
            return Ok(Directive::Continue);
        };

        match row.status_enum() {
            Some(OperationStatus::Running) if row.owner == packet.worker_id => {
                self.db
                    .heartbeat_operation(current_id, &packet.worker_id)
                    .await
                    .map_err(CoreError::Other)?;
                Ok(Directive::Continue)
            }
            Some(OperationStatus::Running) => {
                // Another worker owns it. Single-owner invariant: the claim
                // is refused and this worker told to stop.
                warn!(
                    worker_id = %packet.worker_id,
                    operation_id = current_id,
                    owner = %row.owner,
                    "worker claims an operation owned elsewhere"
                );
                Ok(Directive::Stop)
            }
            Some(OperationStatus::PendingReconciliation)
            | Some(OperationStatus::Resuming)
            | Some(OperationStatus::Pending) => {
                // The claim resolves the limbo: new ownership epoch.
                self.db
                    .start_operation(current_id, &packet.worker_id)
                    .await?;
                info!(
                    worker_id = %packet.worker_id,
                    operation_id = current_id,
                    "reconciled operation back to RUNNING"
                );
                Ok(Directive::Continue)
            }
            Some(s) if s.is_terminal() => {
                // The DB decided while the worker was away. Do not resurrect.
                Ok(Directive::Stop)
            }
            _ => Ok(Directive::Stop),
        }
    }

    /// Startup scan: backend-local RUNNING operations died with the
    /// process; worker-owned RUNNING operations get a grace window.
    pub async fn startup_scan(&self) -> anyhow::Result<StartupReport> {
        let mut report = StartupReport::default();

        for (operation_id, checkpoint_present) in self.db.list_backend_local_running().await? {
            let error = OperationError::new(
                FailureKind::Orphaned,
                "backend-local operation did not survive coordinator restart",
            )
            .with_context(serde_json::json!({ "checkpoint_present": checkpoint_present }));
            match self
                .db
                .fail_operation(&operation_id, &error, &[OperationStatus::Running])
                .await
            {
                Ok(()) => {
                    report.backend_local_failed += 1;
                    self.log(
                        "warn",
                        format!("failed backend-local operation {} at startup", operation_id),
                        Some(&operation_id),
                        None,
                    )
                    .await;
                }
                Err(e) => warn!(operation_id = %operation_id, error = %e, "startup fail refused"),
            }
        }

        let parked = self.db.mark_pending_reconciliation().await?;
        report.parked_for_reconciliation = parked.len();
        for operation_id in &parked {
            info!(operation_id, "parked worker-owned operation for reconciliation");
        }
        Ok(report)
    }

    /// Periodic sweep: fail orphans and expired reconciliations.
    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::default();

        for row in self
            .db
            .list_orphan_candidates(self.orphan_timeout_seconds as i64)
            .await?
        {
            let checkpoint_present = self.db.checkpoint_present(&row.operation_id).await?;
            let error = OperationError::new(
                FailureKind::Orphaned,
                format!(
                    "no heartbeat from owner {} for over {}s",
                    row.owner, self.orphan_timeout_seconds
                ),
            )
            .with_context(serde_json::json!({ "checkpoint_present": checkpoint_present }));
            match self
                .db
                .fail_operation(&row.operation_id, &error, &[OperationStatus::Running])
                .await
            {
                Ok(()) => {
                    report.orphaned += 1;
                    warn!(operation_id = %row.operation_id, owner = %row.owner, "operation orphaned");
                    self.log(
                        "warn",
                        format!("operation {} orphaned (owner {})", row.operation_id, row.owner),
                        Some(&row.operation_id),
                        Some(&row.owner),
                    )
                    .await;
                }
                Err(CoreError::StateConflict { .. }) => {
                    // A heartbeat or terminal report won the race. Fine.
                }
                Err(e) => warn!(operation_id = %row.operation_id, error = %e, "orphan fail refused"),
            }
        }

        for operation_id in self
            .db
            .list_expired_reconciliations(self.reconciliation_grace_seconds as i64)
            .await?
        {
            let checkpoint_present = self.db.checkpoint_present(&operation_id).await?;
            let error = OperationError::new(
                FailureKind::Orphaned,
                format!(
                    "no worker reclaimed the operation within the {}s reconciliation grace",
                    self.reconciliation_grace_seconds
                ),
            )
            .with_context(serde_json::json!({ "checkpoint_present": checkpoint_present }));
            match self
                .db
                .fail_operation(
                    &operation_id,
                    &error,
                    &[OperationStatus::PendingReconciliation],
                )
                .await
            {
                Ok(()) => {
                    report.reconciliations_expired += 1;
                    warn!(operation_id = %operation_id, "reconciliation grace expired");
                    self.log(
                        "warn",
                        format!("reconciliation grace expired for {}", operation_id),
                        Some(&operation_id),
                        None,
                    )
                    .await;
                }
                Err(CoreError::StateConflict { .. }) => {}
                Err(e) => {
                    warn!(operation_id = %operation_id, error = %e, "reconciliation expiry refused")
                }
            }
        }

        Ok(report)
    }

    /// Housekeeping: age-based deletion of terminal records and old
    /// checkpoints, plus leftover staging directories.
    pub async fn housekeeping(&self) -> anyhow::Result<HousekeepingReport> {
        let mut report = HousekeepingReport::default();

        for operation_id in self
            .db
            .list_terminal_older_than(self.operation_retention_hours)
            .await?
        {
            // Checkpoint first (row + artifacts), then the record.
            if let Err(e) = self.store.delete(&operation_id).await {
                warn!(operation_id = %operation_id, error = %e, "checkpoint cleanup failed");
                continue;
            }
            if self.db.delete_operation(&operation_id).await? {
                report.operations_deleted += 1;
            }
        }

        for summary in self
            .store
            .list(Some(self.checkpoint_retention_hours), None)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?
        {
            match self.store.delete(&summary.operation_id).await {
                Ok(true) => report.checkpoints_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(operation_id = %summary.operation_id, error = %e, "checkpoint cleanup failed")
                }
            }
        }

        report.staging_dirs_removed = self
            .store
            .sweep_staging(std::time::Duration::from_secs(3600))
            .unwrap_or_else(|e| {
                warn!(error = %e, "staging sweep failed");
                0
            });

        let _ = self.db.prune_system_logs(30).await;
        Ok(report)
    }

    async fn log(
        &self,
        level: &str,
        message: String,
        operation_id: Option<&str>,
        worker_id: Option<&str>,
    ) {
        let entry = SystemLogEntry {
            level: level.to_string(),
            component: "reconciler".to_string(),
            message,
            operation_id: operation_id.map(|s| s.to_string()),
            worker_id: worker_id.map(|s| s.to_string()),
            context: None,
        };
        if let Err(e) = self.db.insert_system_log(&entry).await {
            warn!(error = %e, "failed to write system log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn packet_deserializes_with_optional_fields_absent() {
        let packet: RegistrationPacket = serde_json::from_str(
            r#"{"worker_id":"w1","worker_type":"training","endpoint_url":"http://w:7200"}"#,
        )
        .unwrap();
        assert!(packet.current_operation_id.is_none());
        assert!(packet.completed_operations.is_empty());
        assert_eq!(packet.capabilities, serde_json::Value::Null);
    }

    #[test]
    fn packet_roundtrips_with_completed_operations() {
        let packet = RegistrationPacket {
            worker_id: "w1".to_string(),
            worker_type: OperationType::Backtesting,
            endpoint_url: "http://w:7200".to_string(),
            capabilities: serde_json::json!({"cores": 8}),
            current_operation_id: Some("op_B".to_string()),
            completed_operations: vec![CompletedOperation {
                operation_id: "op_A".to_string(),
                status: OperationStatus::Completed,
                result: Some(serde_json::json!({"total_trades": 42})),
                error: None,
                completed_at: Utc::now(),
            }],
        };
        let json = serde_json::to_string(&packet).unwrap();
        let back: RegistrationPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(back.completed_operations.len(), 1);
        assert_eq!(back.completed_operations[0].status, OperationStatus::Completed);
    }

    #[test]
    fn directive_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Directive::Continue).unwrap(), "\"CONTINUE\"");
        assert_eq!(serde_json::to_string(&Directive::Stop).unwrap(), "\"STOP\"");
        assert_eq!(serde_json::to_string(&Directive::Idle).unwrap(), "\"IDLE\"");
    }

    #[test]
    fn ack_shape_matches_contract() {
        let ack = RegistrationAck {
            reconciled_current_operation_id: Some("op_B".to_string()),
            directive: Directive::Continue,
        };
        let v = serde_json::to_value(&ack).unwrap();
        assert_eq!(v["reconciled_current_operation_id"], "op_B");
        assert_eq!(v["directive"], "CONTINUE");
    }
}
