//! System log — structured operational events for forensics.
//!
//! Coordinator components append rows for significant lifecycle events
//! (registrations, reconciliation decisions, orphan failures). Inserts are
//! best-effort: a failed log write warns and never blocks the operation
//! it describes.

use super::{Database, SystemLogEntry, SystemLogRow};
use anyhow::Result;

impl Database {
    pub async fn insert_system_log(&self, entry: &SystemLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_logs (level, component, message, operation_id, worker_id, context)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&entry.level)
        .bind(&entry.component)
        .bind(&entry.message)
        .bind(&entry.operation_id)
        .bind(&entry.worker_id)
        .bind(&entry.context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_system_logs(&self, limit: i64) -> Result<Vec<SystemLogRow>> {
        let rows = sqlx::query_as::<_, SystemLogRow>(
            "SELECT id, ts, level, component, message, operation_id, worker_id, context
               FROM system_logs ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    /// Drop log rows older than the retention window. Returns rows removed.
    pub async fn prune_system_logs(&self, retention_days: i64) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM system_logs WHERE ts < NOW() - ($1 || ' days')::interval",
        )
        .bind(retention_days.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
