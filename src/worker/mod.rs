//! # Worker Runtime — One Operation at a Time
//!
//! Each worker host runs this runtime: a small Axum server accepting
//! dispatch calls from the coordinator, a heartbeat thread
//! ([`client::CoordinatorClient`]), and a dedicated blocking thread for
//! the domain executor. The dispatch handler acknowledges by
//! transitioning the operation to RUNNING before returning and never
//! blocks on the computation.
//!
//! ## Graceful Shutdown
//!
//! On SIGINT: stop accepting dispatches, raise the cancellation flag,
//! wait up to the drain deadline for the harness to write a SHUTDOWN
//! checkpoint and finalize CANCELLED, deregister, exit. If the deadline
//! elapses the process exits anyway and the reconciler handles the rest.

pub mod client;
pub mod harness;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::backtest::BacktestExecutor;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::Config;
use crate::db::Database;
use crate::error::CoreError;
use crate::operation::OperationType;
use crate::training::TrainingExecutor;
use client::CoordinatorClient;
use harness::{CheckpointPolicy, ExecutionContext, OperationExecutor};

/// How long shutdown waits for the harness to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// State rehydrated from a checkpoint for a resumed run.
pub struct ResumeContext {
    pub state: CheckpointState,
    pub artifact_dir: Option<PathBuf>,
    /// The original request payload, preserved verbatim on the record.
    pub request_payload: Value,
}

struct WorkerContext {
    worker_id: String,
    worker_type: OperationType,
    db: Database,
    store: CheckpointStore,
    client: Arc<CoordinatorClient>,
    policy: CheckpointPolicy,
    rt: tokio::runtime::Handle,
    shutdown: Arc<AtomicBool>,
    /// Rejects new dispatches once shutdown begins.
    draining: Arc<AtomicBool>,
    /// Guards the single-operation slot.
    busy: Arc<Mutex<Option<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Instantiate the executor for a fresh start or a resume.
fn build_executor(
    worker_type: OperationType,
    request_payload: &Value,
    resume: Option<ResumeContext>,
) -> Result<Box<dyn OperationExecutor>, CoreError> {
    match (worker_type, resume) {
        (OperationType::Training, None) => {
            Ok(Box::new(TrainingExecutor::new(request_payload)?))
        }
        (OperationType::Training, Some(ctx)) => {
            Ok(Box::new(TrainingExecutor::from_resume(ctx)?))
        }
        (OperationType::Backtesting, None) => {
            Ok(Box::new(BacktestExecutor::new(request_payload)?))
        }
        (OperationType::Backtesting, Some(ctx)) => {
            Ok(Box::new(BacktestExecutor::from_resume(ctx)?))
        }
    }
}

/// The request payload may override the default checkpoint cadence
/// (`checkpoint_unit_interval`, `checkpoint_time_interval_seconds`).
fn policy_for(base: CheckpointPolicy, request_payload: &Value) -> CheckpointPolicy {
    let unit_interval = request_payload
        .get("checkpoint_unit_interval")
        .and_then(Value::as_u64)
        .unwrap_or(base.unit_interval);
    let time_interval = request_payload
        .get("checkpoint_time_interval_seconds")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(base.time_interval);
    CheckpointPolicy::new(unit_interval, time_interval)
}

#[derive(Deserialize)]
struct StartPayload {
    operation_id: String,
    /// Absent on resume — the worker loads the checkpoint itself.
    #[serde(default)]
    request_payload: Option<Value>,
}

async fn handler_start(
    State(ctx): State<Arc<WorkerContext>>,
    Json(payload): Json<StartPayload>,
) -> impl IntoResponse {
    if ctx.draining.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "SHUTTING_DOWN" })),
        );
    }
    {
        let mut busy = lock(&ctx.busy);
        if let Some(running) = busy.as_deref() {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "error": "BUSY", "current_operation_id": running })),
            );
        }
        *busy = Some(payload.operation_id.clone());
    }

    match accept_operation(&ctx, &payload).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "operation_id": payload.operation_id, "status": "RUNNING" })),
        ),
        Err(e) => {
            *lock(&ctx.busy) = None;
            warn!(operation_id = %payload.operation_id, error = %e, "dispatch refused");
            (
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                Json(json!({ "error": e.code(), "message": e.to_string() })),
            )
        }
    }
}

/// Validate the dispatch, transition the record to RUNNING, and hand the
/// executor to its dedicated thread. The slot is already claimed.
async fn accept_operation(ctx: &Arc<WorkerContext>, payload: &StartPayload) -> Result<(), CoreError> {
    let operation_id = payload.operation_id.clone();

    let (executor, policy) = match &payload.request_payload {
        Some(request_payload) => (
            build_executor(ctx.worker_type, request_payload, None)?,
            policy_for(ctx.policy, request_payload),
        ),
        None => {
            // Resume: rehydrate from the checkpoint, artifacts verified.
            let loaded = ctx
                .store
                .load(&operation_id, true)
                .await?
                .ok_or_else(|| CoreError::NoCheckpoint(operation_id.clone()))?;
            let row = ctx
                .db
                .get_operation(&operation_id)
                .await
                .map_err(CoreError::Other)?
                .ok_or_else(|| CoreError::OperationNotFound(operation_id.clone()))?;
            let resume = ResumeContext {
                state: loaded.state,
                artifact_dir: loaded.artifact_dir,
                request_payload: row.request_payload.clone(),
            };
            (
                build_executor(ctx.worker_type, &row.request_payload, Some(resume))?,
                policy_for(ctx.policy, &row.request_payload),
            )
        }
    };

    // The acknowledgment: claim ownership before answering the dispatch.
    let run_epoch = ctx.db.start_operation(&operation_id, &ctx.worker_id).await?;

    ctx.client.cancel_requested.store(false, Ordering::Relaxed);
    *lock(&ctx.client.current) = Some(operation_id.clone());
    *lock(&ctx.client.run_epoch) = Some(run_epoch);
    *lock(&ctx.client.progress) = None;

    let exec_ctx = ExecutionContext {
        operation_id: operation_id.clone(),
        worker_id: ctx.worker_id.clone(),
        run_epoch,
        policy,
        db: ctx.db.clone(),
        store: ctx.store.clone(),
        rt: ctx.rt.clone(),
        cancel: Arc::clone(&ctx.client.cancel_requested),
        shutdown: Arc::clone(&ctx.shutdown),
        progress_slot: Arc::clone(&ctx.client.progress),
    };
    let worker_ctx = Arc::clone(ctx);
    let mut executor = executor;
    std::thread::spawn(move || {
        let outcome = harness::execute_operation(&exec_ctx, executor.as_mut());
        if let Some(completed) = outcome {
            worker_ctx.client.record_completed(completed);
        }
        *lock(&worker_ctx.client.current) = None;
        *lock(&worker_ctx.client.run_epoch) = None;
        *lock(&worker_ctx.client.progress) = None;
        worker_ctx.client.cancel_requested.store(false, Ordering::Relaxed);
        *lock(&worker_ctx.busy) = None;
        info!(operation_id = %exec_ctx.operation_id, "executor thread finished");
    });

    Ok(())
}

#[derive(Deserialize)]
struct CancelPayload {
    operation_id: String,
}

async fn handler_cancel(
    State(ctx): State<Arc<WorkerContext>>,
    Json(payload): Json<CancelPayload>,
) -> impl IntoResponse {
    let is_current = lock(&ctx.busy).as_deref() == Some(payload.operation_id.as_str());
    if is_current {
        info!(operation_id = %payload.operation_id, "cancel received");
        ctx.client.cancel_requested.store(true, Ordering::Relaxed);
        (StatusCode::ACCEPTED, Json(json!({ "cancelling": true })))
    } else {
        (StatusCode::OK, Json(json!({ "cancelling": false })))
    }
}

async fn handler_healthz(State(ctx): State<Arc<WorkerContext>>) -> impl IntoResponse {
    let busy = lock(&ctx.busy).clone();
    (
        StatusCode::OK,
        Json(json!({
            "worker_id": ctx.worker_id,
            "worker_type": ctx.worker_type.as_str(),
            "current_operation_id": busy,
        })),
    )
}

fn build_worker_router(ctx: Arc<WorkerContext>) -> Router {
    Router::new()
        .route(
            &format!("/{}/start", ctx.worker_type.as_str()),
            post(handler_start),
        )
        .route("/cancel", post(handler_cancel))
        .route("/healthz", get(handler_healthz))
        .with_state(ctx)
}

/// Run a worker runtime until interrupted.
pub async fn run(config: Config, worker_type: OperationType, gpu: bool) -> Result<()> {
    let endpoint_url = config.require_worker_endpoint()?.to_string();
    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;
    let store = CheckpointStore::new(config.checkpoint_dir.clone(), db.clone());

    // A new process is a new worker identity.
    let worker_id = format!(
        "{}-{}",
        worker_type.as_str(),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    info!(worker_id, worker_type = %worker_type, endpoint = %endpoint_url, "worker starting");

    let capabilities = {
        let mut sys = sysinfo::System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        crate::telemetry::capabilities(&sys, gpu)
    };

    let client = CoordinatorClient::new(
        &config.coordinator_url,
        &worker_id,
        worker_type,
        &endpoint_url,
        capabilities,
        config.heartbeat_interval(),
    );
    let heartbeat_handle = client.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    let draining = Arc::new(AtomicBool::new(false));
    let ctx = Arc::new(WorkerContext {
        worker_id: worker_id.clone(),
        worker_type,
        db,
        store,
        client: Arc::clone(&client),
        policy: CheckpointPolicy::new(
            config.checkpoint_unit_interval,
            config.checkpoint_time_interval(),
        ),
        rt: tokio::runtime::Handle::current(),
        shutdown: Arc::clone(&shutdown),
        draining: Arc::clone(&draining),
        busy: Arc::new(Mutex::new(None)),
    });

    let app = build_worker_router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.worker_port)).await?;
    info!(port = config.worker_port, "worker listening for dispatch");

    let drain_ctx = Arc::clone(&ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining");
            drain_ctx.draining.store(true, Ordering::Relaxed);
            drain_ctx.shutdown.store(true, Ordering::Relaxed);
            drain_ctx
                .client
                .cancel_requested
                .store(true, Ordering::Relaxed);

            let deadline = std::time::Instant::now() + DRAIN_DEADLINE;
            while lock(&drain_ctx.busy).is_some() {
                if std::time::Instant::now() >= deadline {
                    warn!("drain deadline elapsed; the reconciler will pick up the pieces");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await?;

    let deregister_client = Arc::clone(&client);
    let _ = tokio::task::spawn_blocking(move || deregister_client.deregister()).await;
    drop(heartbeat_handle);
    info!(worker_id, "worker exited");
    Ok(())
}
