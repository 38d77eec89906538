//! Checkpoint row persistence. The filesystem half (artifact staging,
//! manifest verification) lives in [`crate::checkpoint`]; this module only
//! owns the `checkpoints` table. Rows are UPSERTed — one checkpoint per
//! operation, newest wins.

use super::{CheckpointRow, CheckpointSummary, Database};
use anyhow::Result;
use serde_json::Value;

const CHECKPOINT_COLUMNS: &str = "operation_id, checkpoint_type, operation_type, created_at, \
     state, artifact_handle, state_bytes, artifact_bytes";

impl Database {
    pub async fn upsert_checkpoint(
        &self,
        operation_id: &str,
        checkpoint_type: &str,
        operation_type: &str,
        state: &Value,
        artifact_handle: Option<&str>,
        state_bytes: i64,
        artifact_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints
               (operation_id, checkpoint_type, operation_type, state,
                artifact_handle, state_bytes, artifact_bytes, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
             ON CONFLICT (operation_id) DO UPDATE SET
               checkpoint_type = EXCLUDED.checkpoint_type,
               operation_type = EXCLUDED.operation_type,
               state = EXCLUDED.state,
               artifact_handle = EXCLUDED.artifact_handle,
               state_bytes = EXCLUDED.state_bytes,
               artifact_bytes = EXCLUDED.artifact_bytes,
               created_at = NOW()",
        )
        .bind(operation_id)
        .bind(checkpoint_type)
        .bind(operation_type)
        .bind(state)
        .bind(artifact_handle)
        .bind(state_bytes)
        .bind(artifact_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, operation_id: &str) -> Result<Option<CheckpointRow>> {
        let row = sqlx::query_as::<_, CheckpointRow>(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE operation_id = $1"
        ))
        .bind(operation_id)
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_checkpoint_row(&self, operation_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM checkpoints WHERE operation_id = $1")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Summaries (sizes and timestamps, no state bodies), newest first.
    pub async fn list_checkpoints(
        &self,
        older_than_hours: Option<i64>,
        operation_type: Option<&str>,
    ) -> Result<Vec<CheckpointSummary>> {
        let rows = sqlx::query_as::<_, CheckpointSummary>(
            "SELECT operation_id, checkpoint_type, operation_type, created_at,
                    state_bytes, artifact_bytes
               FROM checkpoints
              WHERE ($1::bigint IS NULL
                     OR created_at < NOW() - ($1 || ' hours')::interval)
                AND ($2::text IS NULL OR operation_type = $2)
              ORDER BY created_at DESC",
        )
        .bind(older_than_hours)
        .bind(operation_type)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    /// Aggregate byte counts for the Prometheus gauges.
    pub async fn checkpoint_totals(&self) -> Result<(i64, i64, i64)> {
        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(state_bytes), 0)::BIGINT,
                    COALESCE(SUM(artifact_bytes), 0)::BIGINT
               FROM checkpoints",
        )
        .fetch_one(&self.read_pool)
        .await?;
        Ok(row)
    }
}
