//! # Operation — Domain Types and State Machine
//!
//! The durable record of one long-running unit of work, its status state
//! machine, and the structured error carried on FAILED records. The
//! transition rules here are the single source of truth: the repository
//! encodes them as conditional SQL updates, and the property tests drive
//! random transition sequences against [`OperationStatus::can_transition`].
//!
//! ## State Machine
//!
//! ```text
//! PENDING ──start──► RUNNING ──complete──► COMPLETED
//!                       │  ├────cancel───► CANCELLED ─┐
//!                       │  └─────fail────► FAILED ────┤
//!                       │                             │ resume (checkpoint required)
//!                       ▼                             ▼
//!            PENDING_RECONCILIATION                RESUMING
//!                   │    │                            │
//!        (re-register)  (grace expiry)          worker claims
//!                   ▼    ▼                            ▼
//!               RUNNING  FAILED                    RUNNING   (new ownership epoch)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Owner sentinel for operations that run inside the coordinator process.
pub const BACKEND_LOCAL: &str = "BACKEND_LOCAL";

/// The closed set of operation classes the core dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Training,
    Backtesting,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Training => "training",
            OperationType::Backtesting => "backtesting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "training" => Some(OperationType::Training),
            "backtesting" => Some(OperationType::Backtesting),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
    Resuming,
    PendingReconciliation,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Running => "RUNNING",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Cancelled => "CANCELLED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Resuming => "RESUMING",
            OperationStatus::PendingReconciliation => "PENDING_RECONCILIATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OperationStatus::Pending),
            "RUNNING" => Some(OperationStatus::Running),
            "COMPLETED" => Some(OperationStatus::Completed),
            "CANCELLED" => Some(OperationStatus::Cancelled),
            "FAILED" => Some(OperationStatus::Failed),
            "RESUMING" => Some(OperationStatus::Resuming),
            "PENDING_RECONCILIATION" => Some(OperationStatus::PendingReconciliation),
            _ => None,
        }
    }

    /// COMPLETED, CANCELLED and FAILED are terminal; the only way out of
    /// CANCELLED/FAILED is the explicit resume path.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Cancelled | OperationStatus::Failed
        )
    }

    /// Whether `self → to` is a legal transition. `resume_has_checkpoint`
    /// gates the CANCELLED/FAILED → RESUMING edge, which requires a stored
    /// checkpoint.
    pub fn can_transition(&self, to: OperationStatus, resume_has_checkpoint: bool) -> bool {
        use OperationStatus::*;
        match (*self, to) {
            (Pending, Running) => true,
            (Resuming, Running) => true,
            (PendingReconciliation, Running) => true,
            (Running, Completed) | (Running, Cancelled) | (Running, Failed) => true,
            // Direct cancel before dispatch acked.
            (Pending, Cancelled) => true,
            // Dispatch failure on a fresh operation.
            (Pending, Failed) => true,
            (Cancelled, Resuming) | (Failed, Resuming) => resume_has_checkpoint,
            // Dispatch failure on resume reverts to the prior terminal state.
            (Resuming, Cancelled) | (Resuming, Failed) => true,
            (Running, PendingReconciliation) => true,
            (PendingReconciliation, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification carried on FAILED records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The owning worker stopped reporting and the grace period elapsed.
    Orphaned,
    /// No worker matched the required capability, or dispatch failed.
    NoWorker,
    /// The domain executor surfaced an error.
    DomainException,
    /// The terminal transition succeeded but the checkpoint save did not.
    CheckpointWriteFailedOnTerminal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Orphaned => "ORPHANED",
            FailureKind::NoWorker => "NO_WORKER",
            FailureKind::DomainException => "DOMAIN_EXCEPTION",
            FailureKind::CheckpointWriteFailedOnTerminal => "CHECKPOINT_WRITE_FAILED_ON_TERMINAL",
        }
    }
}

/// Structured error stored on the operation record (`error` JSONB column).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl OperationError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        OperationError {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Progress snapshot forwarded from workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// A terminal result a worker retains in memory so it can report it to the
/// coordinator after a blackout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedOperation {
    pub operation_id: String,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub completed_at: DateTime<Utc>,
}

/// Mint a server-side operation id.
pub fn mint_operation_id() -> String {
    format!("op_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationStatus::*;

    const ALL: [OperationStatus; 7] = [
        Pending,
        Running,
        Completed,
        Cancelled,
        Failed,
        Resuming,
        PendingReconciliation,
    ];

    #[test]
    fn terminal_states_are_exactly_three() {
        let terminal: Vec<_> = ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&Completed, &Cancelled, &Failed]);
    }

    #[test]
    fn completed_is_final() {
        for to in ALL {
            assert!(
                !Completed.can_transition(to, true),
                "COMPLETED must not transition to {to}"
            );
        }
    }

    #[test]
    fn resume_requires_checkpoint() {
        assert!(Cancelled.can_transition(Resuming, true));
        assert!(Failed.can_transition(Resuming, true));
        assert!(!Cancelled.can_transition(Resuming, false));
        assert!(!Failed.can_transition(Resuming, false));
    }

    #[test]
    fn running_reachable_from_three_states() {
        let sources: Vec<_> = ALL
            .iter()
            .filter(|s| s.can_transition(Running, true))
            .collect();
        assert_eq!(sources, vec![&Pending, &Resuming, &PendingReconciliation]);
    }

    #[test]
    fn reconciliation_resolves_to_running_or_failed() {
        assert!(PendingReconciliation.can_transition(Running, false));
        assert!(PendingReconciliation.can_transition(Failed, false));
        assert!(!PendingReconciliation.can_transition(Completed, true));
        assert!(!PendingReconciliation.can_transition(Cancelled, true));
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for s in ALL {
            assert_eq!(OperationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OperationStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&PendingReconciliation).unwrap();
        assert_eq!(json, "\"PENDING_RECONCILIATION\"");
        let back: OperationStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(back, Cancelled);
    }

    #[test]
    fn operation_error_serializes_kind_uppercase() {
        let err = OperationError::new(FailureKind::Orphaned, "worker died")
            .with_context(serde_json::json!({"checkpoint_present": true}));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "ORPHANED");
        assert_eq!(v["context"]["checkpoint_present"], true);
    }

    #[test]
    fn operation_type_parses() {
        assert_eq!(OperationType::parse("training"), Some(OperationType::Training));
        assert_eq!(
            OperationType::parse("backtesting"),
            Some(OperationType::Backtesting)
        );
        assert_eq!(OperationType::parse("mining"), None);
    }

    #[test]
    fn minted_ids_are_unique_and_prefixed() {
        let a = mint_operation_id();
        let b = mint_operation_id();
        assert!(a.starts_with("op_"));
        assert_ne!(a, b);
    }
}
