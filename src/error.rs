//! # Error Taxonomy
//!
//! Structured errors for the coordination core. Handlers map each variant
//! to an HTTP status; the worker harness maps executor failures into
//! `Domain` and records the failure kind on the operation record.

use thiserror::Error;

/// Which side of a checkpoint save failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOrigin {
    Filesystem,
    Database,
}

impl std::fmt::Display for WriteOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOrigin::Filesystem => write!(f, "filesystem"),
            WriteOrigin::Database => write!(f, "database"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no checkpoint exists for operation {0}")]
    NoCheckpoint(String),

    #[error("checkpoint for operation {operation_id} is corrupted: {reason}")]
    CheckpointCorrupted { operation_id: String, reason: String },

    #[error("failed to persist checkpoint for operation {operation_id} ({origin}): {source}")]
    CheckpointWrite {
        operation_id: String,
        origin: WriteOrigin,
        #[source]
        source: anyhow::Error,
    },

    /// Compare-and-set refusal: the operation was not in a state the
    /// requested transition allows.
    #[error("operation {operation_id} refused transition: {action}")]
    StateConflict {
        operation_id: String,
        action: &'static str,
    },

    #[error("operation {0} already exists")]
    DuplicateOperation(String),

    #[error("operation {0} not found")]
    OperationNotFound(String),

    #[error("no available worker with capability {0}")]
    NoWorkerAvailable(String),

    #[error("worker {worker_id} did not acknowledge dispatch: {reason}")]
    WorkerUnresponsive { worker_id: String, reason: String },

    #[error("reconciliation grace expired for operation {0}")]
    ReconciliationTimeout(String),

    /// Opaque failure surfaced by a domain executor.
    #[error("{0}")]
    Domain(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// HTTP status the coordinator API uses for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NoCheckpoint(_) => 404,
            CoreError::OperationNotFound(_) => 404,
            CoreError::CheckpointCorrupted { .. } => 422,
            CoreError::StateConflict { .. } => 409,
            CoreError::DuplicateOperation(_) => 409,
            CoreError::NoWorkerAvailable(_) => 503,
            CoreError::WorkerUnresponsive { .. } => 502,
            CoreError::ReconciliationTimeout(_) => 409,
            CoreError::CheckpointWrite { .. }
            | CoreError::Domain(_)
            | CoreError::Database(_)
            | CoreError::Other(_) => 500,
        }
    }

    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NoCheckpoint(_) => "NO_CHECKPOINT",
            CoreError::CheckpointCorrupted { .. } => "CHECKPOINT_CORRUPTED",
            CoreError::CheckpointWrite { .. } => "CHECKPOINT_WRITE_FAILED",
            CoreError::StateConflict { .. } => "STATE_CONFLICT",
            CoreError::DuplicateOperation(_) => "DUPLICATE_OPERATION",
            CoreError::OperationNotFound(_) => "NOT_FOUND",
            CoreError::NoWorkerAvailable(_) => "NO_WORKER",
            CoreError::WorkerUnresponsive { .. } => "WORKER_UNRESPONSIVE",
            CoreError::ReconciliationTimeout(_) => "RECONCILIATION_TIMEOUT",
            CoreError::Domain(_) => "DOMAIN_EXCEPTION",
            CoreError::Database(_) => "DATABASE_ERROR",
            CoreError::Other(_) => "INTERNAL_ERROR",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
