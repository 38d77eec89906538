//! Repository and reconciler integration tests against PostgreSQL.
//!
//! Exercises the compare-and-set state machine, the checkpoint store's
//! atomic save/load/delete protocol, and the reconciler policy table —
//! including the concurrency invariants: one winner per contested
//! transition, no resurrection of terminal operations.
//!
//! # Prerequisites
//!
//! - `TEST_DATABASE_URL` pointing at a dedicated PostgreSQL database.
//!
//! # How to run
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test db_integration -- --test-threads=1
//! ```

mod common;

use serde_json::json;

use ktrdr::checkpoint::{
    sample_training_state, ArtifactFile, CheckpointStore, CheckpointType,
};
use ktrdr::db::{CancelOutcome, Database, OperationFilter};
use ktrdr::error::CoreError;
use ktrdr::operation::{FailureKind, OperationError, OperationStatus, OperationType};
use ktrdr::reconciler::{Directive, Reconciler, RegistrationPacket};

macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

fn store_for(db: &Database) -> CheckpointStore {
    CheckpointStore::new(common::test_config().checkpoint_dir, db.clone())
}

fn training_artifacts() -> Vec<ArtifactFile> {
    vec![
        ArtifactFile::new("model.pt", vec![1u8; 512]),
        ArtifactFile::new("optimizer.pt", vec![2u8; 256]),
    ]
}

async fn create_running(db: &Database, id: &str, owner: &str) {
    db.create_operation(id, OperationType::Training, owner, &json!({"epochs": 20}))
        .await
        .unwrap();
    db.start_operation(id, owner).await.unwrap();
}

// == Creation and ownership ===================================================

#[tokio::test]
async fn duplicate_create_fails_even_on_terminal_record() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_A", "w1").await;
    db.complete_operation("op_A", &json!({})).await.unwrap();

    let err = db
        .create_operation("op_A", OperationType::Training, "w2", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateOperation(_)));
}

#[tokio::test]
async fn start_sets_owner_epoch_and_started_at() {
    require_db!();
    let db = common::setup_test_db().await;
    db.create_operation("op_A", OperationType::Training, "w1", &json!({}))
        .await
        .unwrap();
    let epoch = db.start_operation("op_A", "w1").await.unwrap();
    assert_eq!(epoch, 1);

    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Running));
    assert_eq!(row.owner, "w1");
    assert!(row.started_at.is_some());
}

#[tokio::test]
async fn concurrent_starts_have_exactly_one_winner() {
    require_db!();
    let db = common::setup_test_db().await;
    db.create_operation("op_A", OperationType::Training, "w", &json!({}))
        .await
        .unwrap();

    let db_a = db.clone();
    let db_b = db.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { db_a.start_operation("op_A", "worker_A").await }),
        tokio::spawn(async move { db_b.start_operation("op_A", "worker_B").await }),
    );
    let results = [a.unwrap(), b.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one start must win");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(CoreError::StateConflict { .. }))));
}

#[tokio::test]
async fn start_on_foreign_running_operation_is_refused() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_A", "w1").await;
    let err = db.start_operation("op_A", "w2").await.unwrap_err();
    assert!(matches!(err, CoreError::StateConflict { .. }));
    // Owner unchanged.
    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.owner, "w1");
}

// == Progress =================================================================

#[tokio::test]
async fn progress_is_monotonic_within_an_epoch() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_A", "w1").await;

    assert!(db
        .update_operation_progress("op_A", 1, 50.0, "epoch 10/20", None)
        .await
        .unwrap());
    // Regression within the same epoch is discarded.
    assert!(!db
        .update_operation_progress("op_A", 1, 40.0, "stale", None)
        .await
        .unwrap());
    // Stale epoch is discarded too.
    assert!(!db
        .update_operation_progress("op_A", 0, 99.0, "zombie", None)
        .await
        .unwrap());

    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.progress_percent, 50.0);
    assert_eq!(row.progress_message, "epoch 10/20");
}

#[tokio::test]
async fn progress_on_terminal_operation_is_discarded() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_A", "w1").await;
    db.complete_operation("op_A", &json!({})).await.unwrap();
    assert!(!db
        .update_operation_progress("op_A", 1, 99.0, "late", None)
        .await
        .unwrap());
}

#[tokio::test]
async fn resume_epoch_may_report_lower_percent() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    create_running(&db, "op_A", "w1").await;
    db.update_operation_progress("op_A", 1, 60.0, "epoch 12/20", None)
        .await
        .unwrap();
    store
        .save(
            "op_A",
            CheckpointType::Cancellation,
            &sample_training_state(8, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    db.finalize_cancel("op_A").await.unwrap();
    db.try_resume("op_A").await.unwrap();
    let epoch = db.start_operation("op_A", "w2").await.unwrap();
    assert_eq!(epoch, 2);

    // Lower percent than the pre-cancel 60% is accepted in the new epoch.
    assert!(db
        .update_operation_progress("op_A", 2, 40.0, "epoch 8/20", None)
        .await
        .unwrap());
}

// == Cancel ===================================================================

#[tokio::test]
async fn cancel_pending_is_direct() {
    require_db!();
    let db = common::setup_test_db().await;
    db.create_operation("op_A", OperationType::Training, "w", &json!({}))
        .await
        .unwrap();
    assert_eq!(
        db.request_cancel("op_A").await.unwrap(),
        CancelOutcome::Cancelled
    );
    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Cancelled));
}

#[tokio::test]
async fn cancel_running_is_two_step() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_A", "w1").await;

    assert_eq!(
        db.request_cancel("op_A").await.unwrap(),
        CancelOutcome::CancelRequested
    );
    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert!(row.cancel_requested);
    assert_eq!(row.status_enum(), Some(OperationStatus::Running));

    db.finalize_cancel("op_A").await.unwrap();
    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Cancelled));
    assert!(!row.cancel_requested);
}

#[tokio::test]
async fn concurrent_cancels_are_idempotent() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_E", "w1").await;

    let db_a = db.clone();
    let db_b = db.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { db_a.request_cancel("op_E").await }),
        tokio::spawn(async move { db_b.request_cancel("op_E").await }),
    );
    assert!(a.unwrap().is_ok());
    assert!(b.unwrap().is_ok());

    // One worker finalize; a second finalize is refused.
    db.finalize_cancel("op_E").await.unwrap();
    assert!(matches!(
        db.finalize_cancel("op_E").await,
        Err(CoreError::StateConflict { .. })
    ));
}

// == Resume ===================================================================

#[tokio::test]
async fn resume_requires_a_checkpoint() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_D", "w1").await;
    db.fail_operation(
        "op_D",
        &OperationError::new(FailureKind::DomainException, "boom"),
        &[OperationStatus::Running],
    )
    .await
    .unwrap();

    assert!(matches!(
        db.try_resume("op_D").await,
        Err(CoreError::NoCheckpoint(_))
    ));
}

#[tokio::test]
async fn concurrent_resumes_have_exactly_one_winner() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    create_running(&db, "op_A", "w1").await;
    store
        .save(
            "op_A",
            CheckpointType::Failure,
            &sample_training_state(5, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    db.fail_operation(
        "op_A",
        &OperationError::new(FailureKind::DomainException, "boom"),
        &[OperationStatus::Running],
    )
    .await
    .unwrap();

    let db_a = db.clone();
    let db_b = db.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { db_a.try_resume("op_A").await }),
        tokio::spawn(async move { db_b.try_resume("op_A").await }),
    );
    let results = [a.unwrap().map(|_| ()), b.unwrap().map(|_| ())];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(CoreError::StateConflict { .. }))));
}

#[tokio::test]
async fn revert_resume_restores_prior_terminal_state() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    create_running(&db, "op_A", "w1").await;
    store
        .save(
            "op_A",
            CheckpointType::Cancellation,
            &sample_training_state(3, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    db.finalize_cancel("op_A").await.unwrap();

    db.try_resume("op_A").await.unwrap();
    db.revert_resume("op_A", OperationStatus::Cancelled)
        .await
        .unwrap();
    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Cancelled));
}

// == Completion and checkpoints ===============================================

#[tokio::test]
async fn complete_deletes_checkpoint() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    create_running(&db, "op_A", "w1").await;
    store
        .save(
            "op_A",
            CheckpointType::Periodic,
            &sample_training_state(5, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    assert!(db.checkpoint_present("op_A").await.unwrap());

    db.complete_operation("op_A", &json!({"final_val_loss": 0.4}))
        .await
        .unwrap();
    store.delete("op_A").await.unwrap();

    assert!(!db.checkpoint_present("op_A").await.unwrap());
    assert!(store.load("op_A", false).await.unwrap().is_none());
    let row = db.get_operation("op_A").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Completed));
    assert_eq!(row.progress_percent, 100.0);
}

#[tokio::test]
async fn fail_keeps_checkpoint() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    create_running(&db, "op_A", "w1").await;
    store
        .save(
            "op_A",
            CheckpointType::Periodic,
            &sample_training_state(5, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    db.fail_operation(
        "op_A",
        &OperationError::new(FailureKind::DomainException, "boom"),
        &[OperationStatus::Running],
    )
    .await
    .unwrap();
    assert!(db.checkpoint_present("op_A").await.unwrap());
}

#[tokio::test]
async fn checkpoint_save_load_is_byte_identical_with_artifacts() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    db.create_operation("op_A", OperationType::Training, "w", &json!({}))
        .await
        .unwrap();

    let state = sample_training_state(6, "op_A");
    store
        .save("op_A", CheckpointType::Periodic, &state, &training_artifacts())
        .await
        .unwrap();

    let loaded = store.load("op_A", true).await.unwrap().unwrap();
    assert_eq!(loaded.state, state);
    assert_eq!(loaded.checkpoint_type, CheckpointType::Periodic);
    let dir = loaded.artifact_dir.unwrap();
    assert_eq!(std::fs::read(dir.join("model.pt")).unwrap(), vec![1u8; 512]);
    assert_eq!(loaded.artifact_bytes, 768);
}

#[tokio::test]
async fn checkpoint_upsert_replaces_previous() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    db.create_operation("op_A", OperationType::Training, "w", &json!({}))
        .await
        .unwrap();
    store
        .save(
            "op_A",
            CheckpointType::Periodic,
            &sample_training_state(5, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    store
        .save(
            "op_A",
            CheckpointType::Cancellation,
            &sample_training_state(9, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();

    let loaded = store.load("op_A", true).await.unwrap().unwrap();
    assert_eq!(loaded.checkpoint_type, CheckpointType::Cancellation);
    match loaded.state {
        ktrdr::checkpoint::CheckpointState::Training { epoch, .. } => assert_eq!(epoch, 9),
        _ => panic!("wrong shape"),
    }
}

#[tokio::test]
async fn corrupted_artifacts_surface_on_load() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    db.create_operation("op_A", OperationType::Training, "w", &json!({}))
        .await
        .unwrap();
    store
        .save(
            "op_A",
            CheckpointType::Periodic,
            &sample_training_state(5, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();

    // Tamper with an artifact on disk.
    let row = store.get_row("op_A").await.unwrap().unwrap();
    let dir = std::path::PathBuf::from(row.artifact_handle.unwrap());
    std::fs::write(dir.join("model.pt"), vec![9u8; 512]).unwrap();

    let err = store.load("op_A", true).await.unwrap_err();
    assert!(matches!(err, CoreError::CheckpointCorrupted { .. }));
    // Loading without artifacts still succeeds.
    assert!(store.load("op_A", false).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_is_idempotent() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    db.create_operation("op_A", OperationType::Training, "w", &json!({}))
        .await
        .unwrap();
    store
        .save(
            "op_A",
            CheckpointType::Periodic,
            &sample_training_state(5, "op_A"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    assert!(store.delete("op_A").await.unwrap());
    assert!(!store.delete("op_A").await.unwrap());
}

// == Listing ==================================================================

#[tokio::test]
async fn list_filters_by_status_and_type() {
    require_db!();
    let db = common::setup_test_db().await;
    create_running(&db, "op_T", "w1").await;
    db.create_operation("op_B", OperationType::Backtesting, "w2", &json!({}))
        .await
        .unwrap();

    let running = db
        .list_operations(&OperationFilter {
            status: Some(OperationStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].operation_id, "op_T");

    let backtests = db
        .list_operations(&OperationFilter {
            operation_type: Some(OperationType::Backtesting),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(backtests.len(), 1);
    assert_eq!(backtests[0].operation_id, "op_B");
}

// == Reconciler ===============================================================

fn reconciler_for(db: &Database) -> Reconciler {
    Reconciler::new(db.clone(), store_for(db), &common::test_config())
}

#[tokio::test]
async fn startup_fails_backend_local_and_parks_worker_owned() {
    require_db!();
    let db = common::setup_test_db().await;
    let reconciler = reconciler_for(&db);

    create_running(&db, "op_worker", "training-w1").await;
    db.create_operation(
        "op_local",
        OperationType::Training,
        ktrdr::operation::BACKEND_LOCAL,
        &json!({}),
    )
    .await
    .unwrap();
    db.start_operation("op_local", ktrdr::operation::BACKEND_LOCAL)
        .await
        .unwrap();

    let report = reconciler.startup_scan().await.unwrap();
    assert_eq!(report.backend_local_failed, 1);
    assert_eq!(report.parked_for_reconciliation, 1);

    let local = db.get_operation("op_local").await.unwrap().unwrap();
    assert_eq!(local.status_enum(), Some(OperationStatus::Failed));
    let error = local.error.unwrap();
    assert_eq!(error["kind"], "ORPHANED");
    assert_eq!(error["context"]["checkpoint_present"], false);

    let parked = db.get_operation("op_worker").await.unwrap().unwrap();
    assert_eq!(
        parked.status_enum(),
        Some(OperationStatus::PendingReconciliation)
    );
}

#[tokio::test]
async fn reregistration_resolves_pending_reconciliation() {
    require_db!();
    let db = common::setup_test_db().await;
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_B", "training-w1").await;
    db.mark_pending_reconciliation().await.unwrap();

    let ack = reconciler
        .reconcile_registration(&RegistrationPacket {
            worker_id: "training-w1".to_string(),
            worker_type: OperationType::Training,
            endpoint_url: "http://w:7200".to_string(),
            capabilities: json!({}),
            current_operation_id: Some("op_B".to_string()),
            completed_operations: vec![],
        })
        .await;
    assert_eq!(ack.directive, Directive::Continue);
    assert_eq!(ack.reconciled_current_operation_id.as_deref(), Some("op_B"));

    let row = db.get_operation("op_B").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Running));
    // New ownership epoch.
    assert_eq!(row.run_epoch, 2);
}

#[tokio::test]
async fn expired_reconciliation_fails_orphaned() {
    require_db!();
    let db = common::setup_test_db().await;
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_B", "training-w1").await;
    db.mark_pending_reconciliation().await.unwrap();

    // Age the grace clock past the window.
    sqlx::query(
        "UPDATE operations SET last_heartbeat_at = NOW() - interval '120 seconds'
          WHERE operation_id = 'op_B'",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.reconciliations_expired, 1);
    let row = db.get_operation("op_B").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Failed));
    assert_eq!(row.error.unwrap()["kind"], "ORPHANED");
}

#[tokio::test]
async fn silent_worker_orphans_running_operation() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_C", "training-w1").await;
    store
        .save(
            "op_C",
            CheckpointType::Periodic,
            &sample_training_state(4, "op_C"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    sqlx::query(
        "UPDATE operations SET last_heartbeat_at = NOW() - interval '120 seconds'
          WHERE operation_id = 'op_C'",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.orphaned, 1);

    let row = db.get_operation("op_C").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Failed));
    let error = row.error.unwrap();
    assert_eq!(error["kind"], "ORPHANED");
    assert_eq!(error["context"]["checkpoint_present"], true);

    // The checkpoint survives, so the operation is resumable.
    assert!(db.try_resume("op_C").await.is_ok());
}

#[tokio::test]
async fn heartbeats_protect_running_operations_from_the_sweep() {
    require_db!();
    let db = common::setup_test_db().await;
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_alive", "training-w1").await;
    db.heartbeat_operation("op_alive", "training-w1")
        .await
        .unwrap();

    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.orphaned, 0);
    let row = db.get_operation("op_alive").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Running));
}

#[tokio::test]
async fn terminal_db_state_wins_over_worker_claim() {
    require_db!();
    let db = common::setup_test_db().await;
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_done", "training-w1").await;
    db.complete_operation("op_done", &json!({})).await.unwrap();

    let ack = reconciler
        .reconcile_registration(&RegistrationPacket {
            worker_id: "training-w1".to_string(),
            worker_type: OperationType::Training,
            endpoint_url: "http://w:7200".to_string(),
            capabilities: json!({}),
            current_operation_id: Some("op_done".to_string()),
            completed_operations: vec![],
        })
        .await;
    assert_eq!(ack.directive, Directive::Stop);

    // Not resurrected.
    let row = db.get_operation("op_done").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Completed));
}

#[tokio::test]
async fn foreign_claim_on_running_operation_gets_stop() {
    require_db!();
    let db = common::setup_test_db().await;
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_X", "training-w1").await;

    let ack = reconciler
        .reconcile_registration(&RegistrationPacket {
            worker_id: "training-w2".to_string(),
            worker_type: OperationType::Training,
            endpoint_url: "http://w2:7200".to_string(),
            capabilities: json!({}),
            current_operation_id: Some("op_X".to_string()),
            completed_operations: vec![],
        })
        .await;
    assert_eq!(ack.directive, Directive::Stop);
    let row = db.get_operation("op_X").await.unwrap().unwrap();
    assert_eq!(row.owner, "training-w1");
}

#[tokio::test]
async fn reported_completion_deletes_checkpoint() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_Y", "training-w1").await;
    store
        .save(
            "op_Y",
            CheckpointType::Periodic,
            &sample_training_state(7, "op_Y"),
            &training_artifacts(),
        )
        .await
        .unwrap();

    reconciler
        .reconcile_registration(&RegistrationPacket {
            worker_id: "training-w1".to_string(),
            worker_type: OperationType::Training,
            endpoint_url: "http://w:7200".to_string(),
            capabilities: json!({}),
            current_operation_id: None,
            completed_operations: vec![ktrdr::operation::CompletedOperation {
                operation_id: "op_Y".to_string(),
                status: OperationStatus::Completed,
                result: Some(json!({"best_val_loss": 0.41})),
                error: None,
                completed_at: chrono::Utc::now(),
            }],
        })
        .await;

    let row = db.get_operation("op_Y").await.unwrap().unwrap();
    assert_eq!(row.status_enum(), Some(OperationStatus::Completed));
    assert!(!db.checkpoint_present("op_Y").await.unwrap());
}

// == Housekeeping =============================================================

#[tokio::test]
async fn housekeeping_removes_aged_terminal_records() {
    require_db!();
    let db = common::setup_test_db().await;
    let store = store_for(&db);
    let reconciler = reconciler_for(&db);
    create_running(&db, "op_old", "w1").await;
    store
        .save(
            "op_old",
            CheckpointType::Failure,
            &sample_training_state(2, "op_old"),
            &training_artifacts(),
        )
        .await
        .unwrap();
    db.fail_operation(
        "op_old",
        &OperationError::new(FailureKind::Orphaned, "worker died"),
        &[OperationStatus::Running],
    )
    .await
    .unwrap();
    // Age the record past the retention window (720h default).
    sqlx::query(
        "UPDATE operations SET completed_at = NOW() - interval '1000 hours'
          WHERE operation_id = 'op_old'",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let report = reconciler.housekeeping().await.unwrap();
    assert_eq!(report.operations_deleted, 1);
    assert!(db.get_operation("op_old").await.unwrap().is_none());
    assert!(!db.checkpoint_present("op_old").await.unwrap());
}
