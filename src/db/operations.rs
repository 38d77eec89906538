//! Operation repository — lifecycle transitions as compare-and-set updates.
//!
//! Every state change is a single conditional UPDATE of the form
//! `SET status = <new> WHERE operation_id = ? AND status IN (<allowed>)
//! RETURNING …`. A zero row count means the caller lost the race and the
//! transition is refused with `StateConflict`. This is the sole mechanism
//! against concurrent resume, duplicate cancel, and cross-worker claims;
//! no application-level lock guards operation rows.

use super::{Database, OperationRow};
use crate::error::{CoreError, CoreResult};
use crate::operation::{OperationError, OperationStatus, OperationType, BACKEND_LOCAL};
use anyhow::Result;
use serde_json::Value;
use sqlx::QueryBuilder;

const OPERATION_COLUMNS: &str = "operation_id, operation_type, status, owner, created_at, \
     started_at, completed_at, progress_percent, progress_message, progress_context, \
     progress_updated_at, request_payload, result, error, last_heartbeat_at, \
     reconciliation_status, cancel_requested, run_epoch";

/// Outcome of a cancellation request (two-step protocol).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The operation was still PENDING and went straight to CANCELLED.
    Cancelled,
    /// The operation is RUNNING; the flag is set and the worker will
    /// observe it on its next cadence check.
    CancelRequested,
    /// Already terminal; nothing changed.
    AlreadyTerminal(OperationStatus),
}

/// Filters for `list_operations`. All fields combine with AND.
#[derive(Clone, Debug, Default)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub operation_type: Option<OperationType>,
    pub owner: Option<String>,
    pub older_than_hours: Option<i64>,
    /// CANCELLED/FAILED with a stored checkpoint.
    pub resumable: bool,
    pub limit: Option<i64>,
}

impl Database {
    /// Create a PENDING operation record. The id must be globally fresh —
    /// a duplicate fails even when the existing record is terminal.
    pub async fn create_operation(
        &self,
        operation_id: &str,
        operation_type: OperationType,
        owner: &str,
        request_payload: &Value,
    ) -> CoreResult<OperationRow> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            "INSERT INTO operations (operation_id, operation_type, status, owner, request_payload)
             VALUES ($1, $2, 'PENDING', $3, $4)
             ON CONFLICT (operation_id) DO NOTHING
             RETURNING {OPERATION_COLUMNS}"
        ))
        .bind(operation_id)
        .bind(operation_type.as_str())
        .bind(owner)
        .bind(request_payload)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CoreError::DuplicateOperation(operation_id.to_string()))
    }

    /// Recreate a RUNNING record for an operation the database has lost but
    /// a worker still reports. Only the reconciler calls this.
    pub async fn recreate_running_operation(
        &self,
        operation_id: &str,
        operation_type: OperationType,
        owner: &str,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO operations
               (operation_id, operation_type, status, owner, request_payload,
                started_at, last_heartbeat_at, run_epoch, reconciliation_status)
             VALUES ($1, $2, 'RUNNING', $3, '{}'::jsonb, NOW(), NOW(), 1, 'RECOVERED')
             ON CONFLICT (operation_id) DO NOTHING",
        )
        .bind(operation_id)
        .bind(operation_type.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim the operation: `{PENDING, RESUMING, PENDING_RECONCILIATION} →
    /// RUNNING`. Sets the owner, stamps `started_at` on first start, and
    /// advances the ownership epoch. Returns the new epoch.
    ///
    /// An operation already RUNNING under a different owner does not match
    /// the predicate and is refused — the reconciler is the only path that
    /// can force such a change.
    pub async fn start_operation(&self, operation_id: &str, owner: &str) -> CoreResult<i64> {
        let epoch: Option<i64> = sqlx::query_scalar(
            "UPDATE operations
                SET status = 'RUNNING', owner = $2,
                    started_at = COALESCE(started_at, NOW()),
                    run_epoch = run_epoch + 1,
                    reconciliation_status = NULL,
                    cancel_requested = FALSE,
                    last_heartbeat_at = NOW()
              WHERE operation_id = $1
                AND status IN ('PENDING', 'RESUMING', 'PENDING_RECONCILIATION')
              RETURNING run_epoch",
        )
        .bind(operation_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        epoch.ok_or_else(|| CoreError::StateConflict {
            operation_id: operation_id.to_string(),
            action: "start",
        })
    }

    /// Write a progress snapshot. Applies only while RUNNING in the given
    /// ownership epoch and only if `percent` does not regress; anything
    /// else is discarded (returns false). Discards happen naturally during
    /// races with cancellation and are logged by the caller at debug level.
    pub async fn update_operation_progress(
        &self,
        operation_id: &str,
        run_epoch: i64,
        percent: f64,
        message: &str,
        context: Option<&Value>,
    ) -> Result<bool> {
        let applied: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET progress_percent = $3, progress_message = $4,
                    progress_context = $5, progress_updated_at = NOW()
              WHERE operation_id = $1 AND status = 'RUNNING'
                AND run_epoch = $2 AND progress_percent <= $3
              RETURNING operation_id",
        )
        .bind(operation_id)
        .bind(run_epoch)
        .bind(percent)
        .bind(message)
        .bind(context)
        .fetch_optional(&self.pool)
        .await?;
        Ok(applied.is_some())
    }

    /// `RUNNING → COMPLETED`. The caller is responsible for deleting the
    /// checkpoint through the store (invariant: a COMPLETED operation has
    /// no checkpoint).
    pub async fn complete_operation(&self, operation_id: &str, result: &Value) -> CoreResult<()> {
        let row: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET status = 'COMPLETED', completed_at = NOW(), result = $2,
                    progress_percent = 100, cancel_requested = FALSE
              WHERE operation_id = $1 AND status = 'RUNNING'
              RETURNING operation_id",
        )
        .bind(operation_id)
        .bind(result)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ()).ok_or_else(|| CoreError::StateConflict {
            operation_id: operation_id.to_string(),
            action: "complete",
        })
    }

    /// Transition to FAILED from any of `allowed_from`, recording the
    /// structured error. The checkpoint, if any, is kept.
    pub async fn fail_operation(
        &self,
        operation_id: &str,
        error: &OperationError,
        allowed_from: &[OperationStatus],
    ) -> CoreResult<()> {
        let from: Vec<String> = allowed_from.iter().map(|s| s.as_str().to_string()).collect();
        let error_json = serde_json::to_value(error).map_err(anyhow::Error::from)?;
        let row: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET status = 'FAILED', completed_at = NOW(), error = $2,
                    cancel_requested = FALSE
              WHERE operation_id = $1 AND status = ANY($3)
              RETURNING operation_id",
        )
        .bind(operation_id)
        .bind(&error_json)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ()).ok_or_else(|| CoreError::StateConflict {
            operation_id: operation_id.to_string(),
            action: "fail",
        })
    }

    /// Catch-up applied by the reconciler when a worker reports a terminal
    /// outcome reached while the coordinator was away. The worker already
    /// performed the RUNNING → terminal transition on its side; the row may
    /// meanwhile have been parked in PENDING_RECONCILIATION by a restart.
    pub async fn apply_reported_terminal(
        &self,
        operation_id: &str,
        status: OperationStatus,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> CoreResult<()> {
        debug_assert!(status.is_terminal());
        let row: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET status = $2, completed_at = NOW(),
                    result = COALESCE($3, result),
                    error = COALESCE($4, error),
                    cancel_requested = FALSE,
                    reconciliation_status = NULL
              WHERE operation_id = $1
                AND status IN ('RUNNING', 'PENDING_RECONCILIATION')
              RETURNING operation_id",
        )
        .bind(operation_id)
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ()).ok_or_else(|| CoreError::StateConflict {
            operation_id: operation_id.to_string(),
            action: "apply_reported_terminal",
        })
    }

    /// First half of the two-step cancel: PENDING goes straight to
    /// CANCELLED; RUNNING/RESUMING gets the cancel-requested flag for the
    /// worker to observe. Terminal states report themselves unchanged.
    pub async fn request_cancel(&self, operation_id: &str) -> CoreResult<CancelOutcome> {
        let direct: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET status = 'CANCELLED', completed_at = NOW()
              WHERE operation_id = $1 AND status = 'PENDING'
              RETURNING operation_id",
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        if direct.is_some() {
            return Ok(CancelOutcome::Cancelled);
        }

        let flagged: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET cancel_requested = TRUE
              WHERE operation_id = $1 AND status IN ('RUNNING', 'RESUMING')
              RETURNING operation_id",
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        if flagged.is_some() {
            return Ok(CancelOutcome::CancelRequested);
        }

        let row = self
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| CoreError::OperationNotFound(operation_id.to_string()))?;
        match row.status_enum() {
            Some(s) if s.is_terminal() => Ok(CancelOutcome::AlreadyTerminal(s)),
            _ => Err(CoreError::StateConflict {
                operation_id: operation_id.to_string(),
                action: "cancel",
            }),
        }
    }

    /// Second half of the two-step cancel, reported by the worker after its
    /// terminal checkpoint: `RUNNING → CANCELLED`.
    pub async fn finalize_cancel(&self, operation_id: &str) -> CoreResult<()> {
        let row: Option<String> = sqlx::query_scalar(
            "UPDATE operations
                SET status = 'CANCELLED', completed_at = NOW(), cancel_requested = FALSE
              WHERE operation_id = $1 AND status = 'RUNNING'
              RETURNING operation_id",
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ()).ok_or_else(|| CoreError::StateConflict {
            operation_id: operation_id.to_string(),
            action: "finalize_cancel",
        })
    }

    /// `{CANCELLED, FAILED} → RESUMING`, atomically conditioned on a stored
    /// checkpoint. Exactly one of two concurrent calls can win; the loser
    /// is classified as conflict / no-checkpoint / not-found.
    pub async fn try_resume(&self, operation_id: &str) -> CoreResult<OperationRow> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            "UPDATE operations
                SET status = 'RESUMING', cancel_requested = FALSE,
                    reconciliation_status = NULL
              WHERE operation_id = $1 AND status IN ('CANCELLED', 'FAILED')
                AND EXISTS (SELECT 1 FROM checkpoints c WHERE c.operation_id = $1)
              RETURNING {OPERATION_COLUMNS}"
        ))
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(row);
        }

        let current = self
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| CoreError::OperationNotFound(operation_id.to_string()))?;
        match current.status_enum() {
            Some(OperationStatus::Cancelled) | Some(OperationStatus::Failed) => {
                Err(CoreError::NoCheckpoint(operation_id.to_string()))
            }
            _ => Err(CoreError::StateConflict {
                operation_id: operation_id.to_string(),
                action: "resume",
            }),
        }
    }

    /// Dispatch failure during resume: restore the prior terminal state.
    pub async fn revert_resume(
        &self,
        operation_id: &str,
        prior: OperationStatus,
    ) -> CoreResult<()> {
        let row: Option<String> = sqlx::query_scalar(
            "UPDATE operations SET status = $2
              WHERE operation_id = $1 AND status = 'RESUMING'
              RETURNING operation_id",
        )
        .bind(operation_id)
        .bind(prior.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ()).ok_or_else(|| CoreError::StateConflict {
            operation_id: operation_id.to_string(),
            action: "revert_resume",
        })
    }

    pub async fn get_operation(&self, operation_id: &str) -> Result<Option<OperationRow>> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations WHERE operation_id = $1"
        ))
        .bind(operation_id)
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn checkpoint_present(&self, operation_id: &str) -> Result<bool> {
        let present: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM checkpoints WHERE operation_id = $1)")
                .bind(operation_id)
                .fetch_one(&self.read_pool)
                .await?;
        Ok(present)
    }

    /// List operations, newest first, with optional filters.
    pub async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<OperationRow>> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {OPERATION_COLUMNS} FROM operations WHERE TRUE"
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(op_type) = filter.operation_type {
            qb.push(" AND operation_type = ").push_bind(op_type.as_str());
        }
        if let Some(owner) = &filter.owner {
            qb.push(" AND owner = ").push_bind(owner.clone());
        }
        if let Some(hours) = filter.older_than_hours {
            qb.push(" AND created_at < NOW() - (")
                .push_bind(hours.to_string())
                .push(" || ' hours')::interval");
        }
        if filter.resumable {
            qb.push(
                " AND status IN ('CANCELLED', 'FAILED')
                  AND EXISTS (SELECT 1 FROM checkpoints c
                               WHERE c.operation_id = operations.operation_id)",
            );
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb
            .build_query_as::<OperationRow>()
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    /// Refresh operation liveness from a heartbeat. Applies only while the
    /// reporter still owns a RUNNING operation.
    pub async fn heartbeat_operation(&self, operation_id: &str, owner: &str) -> Result<bool> {
        let touched: Option<String> = sqlx::query_scalar(
            "UPDATE operations SET last_heartbeat_at = NOW()
              WHERE operation_id = $1 AND owner = $2 AND status = 'RUNNING'
              RETURNING operation_id",
        )
        .bind(operation_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        Ok(touched.is_some())
    }

    /// Startup: every worker-owned RUNNING operation becomes
    /// PENDING_RECONCILIATION. `last_heartbeat_at` is stamped so the grace
    /// clock starts at the restart, not at the last pre-crash heartbeat.
    pub async fn mark_pending_reconciliation(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE operations
                SET status = 'PENDING_RECONCILIATION',
                    reconciliation_status = 'PENDING_RECONCILIATION',
                    last_heartbeat_at = NOW()
              WHERE status = 'RUNNING' AND owner <> $1
              RETURNING operation_id",
        )
        .bind(BACKEND_LOCAL)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Startup: backend-local RUNNING operations died with the process.
    /// Returns (operation_id, checkpoint_present) for each.
    pub async fn list_backend_local_running(&self) -> Result<Vec<(String, bool)>> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT o.operation_id,
                    EXISTS (SELECT 1 FROM checkpoints c
                             WHERE c.operation_id = o.operation_id) AS checkpoint_present
               FROM operations o
              WHERE o.status = 'RUNNING' AND o.owner = $1",
        )
        .bind(BACKEND_LOCAL)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// RUNNING operations whose heartbeat is older than `timeout_secs`
    /// (orphan candidates for the reconciler sweep).
    pub async fn list_orphan_candidates(&self, timeout_secs: i64) -> Result<Vec<OperationRow>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
              WHERE status = 'RUNNING'
                AND owner <> $1
                AND (last_heartbeat_at IS NULL
                     OR last_heartbeat_at < NOW() - ($2 || ' seconds')::interval)"
        ))
        .bind(BACKEND_LOCAL)
        .bind(timeout_secs.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// PENDING_RECONCILIATION operations whose grace window has expired.
    pub async fn list_expired_reconciliations(&self, grace_secs: i64) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT operation_id FROM operations
              WHERE status = 'PENDING_RECONCILIATION'
                AND last_heartbeat_at < NOW() - ($1 || ' seconds')::interval",
        )
        .bind(grace_secs.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Terminal records older than `retention_hours`, for the housekeeping
    /// sweep. The caller deletes their checkpoints (row + artifacts) first.
    pub async fn list_terminal_older_than(&self, retention_hours: i64) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT operation_id FROM operations
              WHERE status IN ('COMPLETED', 'CANCELLED', 'FAILED')
                AND completed_at < NOW() - ($1 || ' hours')::interval",
        )
        .bind(retention_hours.to_string())
        .fetch_all(&self.read_pool)
        .await?;
        Ok(ids)
    }

    pub async fn delete_operation(&self, operation_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM operations WHERE operation_id = $1")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Status → count, for the Prometheus gauges.
    pub async fn count_operations_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM operations GROUP BY status")
                .fetch_all(&self.read_pool)
                .await?;
        Ok(rows)
    }
}
