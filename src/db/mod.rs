//! # Database — PostgreSQL Storage Layer
//!
//! Async database operations for the coordination core via `sqlx::PgPool`.
//! The database is the arbitration point: the operation repository is the
//! sole writer for operation rows, the worker registry mirror is the sole
//! writer for worker rows, and every state transition is a single
//! conditional UPDATE so no component ever holds a lock across an await.
//!
//! ## Schema
//!
//! - `operations`: durable operation records with JSONB payload/result/error
//! - `workers`: durable mirror of the in-memory worker registry
//! - `checkpoints`: one row per operation, state as JSONB, artifacts on disk
//! - `system_logs`: structured operational log for forensics
//!
//! ## Module Structure
//!
//! - [`operations`] — operation lifecycle and compare-and-set transitions
//! - [`workers`] — worker registry durability
//! - [`checkpoints`] — checkpoint row CRUD and summaries
//! - [`logs`] — system log inserts and queries

mod checkpoints;
mod logs;
mod operations;
mod workers;

pub use operations::{CancelOutcome, OperationFilter};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::operation::{OperationStatus, OperationType};

// ── Operation rows ──────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct OperationRow {
    pub operation_id: String,
    pub operation_type: String,
    pub status: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percent: f64,
    pub progress_message: String,
    pub progress_context: Option<Value>,
    pub progress_updated_at: Option<DateTime<Utc>>,
    pub request_payload: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reconciliation_status: Option<String>,
    pub cancel_requested: bool,
    pub run_epoch: i64,
}

impl OperationRow {
    /// Parsed status. Rows only ever hold values written through
    /// [`OperationStatus::as_str`]; an unknown value is treated as absent
    /// by callers.
    pub fn status_enum(&self) -> Option<OperationStatus> {
        OperationStatus::parse(&self.status)
    }

    pub fn type_enum(&self) -> Option<OperationType> {
        OperationType::parse(&self.operation_type)
    }
}

// ── Worker rows ─────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct WorkerDbRow {
    pub worker_id: String,
    pub worker_type: String,
    pub endpoint_url: String,
    pub capabilities: Value,
    pub state: String,
    pub current_operation_id: Option<String>,
    pub metrics: Option<Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

// ── Checkpoint rows ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct CheckpointRow {
    pub operation_id: String,
    pub checkpoint_type: String,
    pub operation_type: String,
    pub created_at: DateTime<Utc>,
    pub state: Value,
    pub artifact_handle: Option<String>,
    pub state_bytes: i64,
    pub artifact_bytes: i64,
}

/// Listing view: sizes and timestamps, no state body.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct CheckpointSummary {
    pub operation_id: String,
    pub checkpoint_type: String,
    pub operation_type: String,
    pub created_at: DateTime<Utc>,
    pub state_bytes: i64,
    pub artifact_bytes: i64,
}

// ── System log rows ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct SystemLogEntry {
    pub level: String,
    pub component: String,
    pub message: String,
    pub operation_id: Option<String>,
    pub worker_id: Option<String>,
    pub context: Option<Value>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct SystemLogRow {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub message: String,
    pub operation_id: Option<String>,
    pub worker_id: Option<String>,
    pub context: Option<Value>,
}

// ── Database handle ─────────────────────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    read_pool: PgPool,
}

impl Database {
    /// Connect both pools. The read pool serves list/get queries so a burst
    /// of dashboard reads cannot starve state transitions.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        let read_pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Database { pool, read_pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn read_pool(&self) -> &PgPool {
        &self.read_pool
    }

    /// Apply the embedded schema. Idempotent (`CREATE TABLE IF NOT EXISTS`).
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
