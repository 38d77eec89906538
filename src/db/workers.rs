//! Worker registry durability — the database mirror of the in-memory index.
//!
//! Every registry mutation is mirrored here so a coordinator restart can
//! rebuild the index, but the mirror is never authoritative for liveness:
//! reconciliation still runs after a restart because workers may have died
//! during the downtime.

use super::{Database, WorkerDbRow};
use anyhow::Result;
use serde_json::Value;

const WORKER_COLUMNS: &str = "worker_id, worker_type, endpoint_url, capabilities, state, \
     current_operation_id, metrics, registered_at, last_heartbeat_at";

impl Database {
    /// Upsert a worker registration. A re-registration refreshes the
    /// endpoint, capabilities and heartbeat in place.
    pub async fn upsert_worker(
        &self,
        worker_id: &str,
        worker_type: &str,
        endpoint_url: &str,
        capabilities: &Value,
        state: &str,
        current_operation_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers
               (worker_id, worker_type, endpoint_url, capabilities, state,
                current_operation_id, last_heartbeat_at)
             VALUES ($1, $2, $3, $4, $5, $6, NOW())
             ON CONFLICT (worker_id) DO UPDATE SET
               worker_type = EXCLUDED.worker_type,
               endpoint_url = EXCLUDED.endpoint_url,
               capabilities = EXCLUDED.capabilities,
               state = EXCLUDED.state,
               current_operation_id = EXCLUDED.current_operation_id,
               last_heartbeat_at = NOW()",
        )
        .bind(worker_id)
        .bind(worker_type)
        .bind(endpoint_url)
        .bind(capabilities)
        .bind(state)
        .bind(current_operation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh a worker's heartbeat, reported operation, and live host
    /// metrics (kept for dashboards; selection reads capabilities only).
    pub async fn heartbeat_worker(
        &self,
        worker_id: &str,
        state: &str,
        current_operation_id: Option<&str>,
        metrics: Option<&Value>,
    ) -> Result<bool> {
        let touched: Option<String> = sqlx::query_scalar(
            "UPDATE workers
                SET last_heartbeat_at = NOW(), state = $2, current_operation_id = $3,
                    metrics = COALESCE($4, metrics)
              WHERE worker_id = $1
              RETURNING worker_id",
        )
        .bind(worker_id)
        .bind(state)
        .bind(current_operation_id)
        .bind(metrics)
        .fetch_optional(&self.pool)
        .await?;
        Ok(touched.is_some())
    }

    pub async fn set_worker_state(
        &self,
        worker_id: &str,
        state: &str,
        current_operation_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET state = $2, current_operation_id = $3 WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(state)
        .bind(current_operation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_all_workers(&self) -> Result<Vec<WorkerDbRow>> {
        let rows = sqlx::query_as::<_, WorkerDbRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers ORDER BY worker_id"
        ))
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    /// Remove a worker row (explicit deregistration).
    pub async fn delete_worker(&self, worker_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Evict workers that have been UNRESPONSIVE beyond the grace period.
    /// Returns the number removed.
    pub async fn evict_unresponsive_workers(&self, grace_secs: i64) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM workers
              WHERE state = 'UNRESPONSIVE'
                AND last_heartbeat_at < NOW() - ($1 || ' seconds')::interval",
        )
        .bind(grace_secs.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
