//! # Coordinator — HTTP API and Fleet Coordination Hub
//!
//! Runs the Axum HTTP server exposing the operation lifecycle, checkpoint
//! inspection and worker coordination endpoints under `/api/v1`, plus
//! health probes and Prometheus metrics. A small set of background tasks
//! keeps the system honest: the progress debounce flusher, the registry
//! liveness sweep, the reconciler sweep, and the housekeeping sweep.

mod routes_checkpoints;
mod routes_health;
mod routes_operations;
mod routes_workers;

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::db::Database;
use crate::error::CoreError;
use crate::progress::ProgressDebouncer;
use crate::prom_metrics::{Metrics, StatusLabel};
use crate::reconciler::Reconciler;
use crate::registry::WorkerRegistry;

/// Lock a mutex, recovering from poisoning.
pub(super) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AppState {
    pub db: Database,
    pub store: CheckpointStore,
    pub registry: Mutex<WorkerRegistry>,
    pub reconciler: Reconciler,
    pub debouncer: ProgressDebouncer,
    pub prom_metrics: Metrics,
    pub config: Config,
    /// Outbound client for dispatch and cancel notifications; short ack
    /// timeout so a wedged worker cannot pin a handler.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        let store = CheckpointStore::new(config.checkpoint_dir.clone(), db.clone());
        let reconciler = Reconciler::new(db.clone(), store.clone(), &config);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Arc::new(AppState {
            db,
            store,
            registry: Mutex::new(WorkerRegistry::new()),
            reconciler,
            debouncer: ProgressDebouncer::default(),
            prom_metrics: Metrics::new(),
            config,
            http,
        })
    }
}

/// Map a core error to its JSON response.
pub(super) fn error_response(e: &CoreError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(serde_json::json!({ "error": e.code(), "message": e.to_string() })),
    )
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/operations",
            get(routes_operations::handler_operations_list)
                .post(routes_operations::handler_operation_create),
        )
        .route(
            "/api/v1/operations/{id}",
            get(routes_operations::handler_operation_get)
                .delete(routes_operations::handler_operation_cancel),
        )
        .route(
            "/api/v1/operations/{id}/resume",
            post(routes_operations::handler_operation_resume),
        )
        .route(
            "/api/v1/checkpoints",
            get(routes_checkpoints::handler_checkpoints_list),
        )
        .route(
            "/api/v1/checkpoints/{id}",
            get(routes_checkpoints::handler_checkpoint_get)
                .delete(routes_checkpoints::handler_checkpoint_delete),
        )
        .route(
            "/api/v1/workers/register",
            post(routes_workers::handler_worker_register),
        )
        .route(
            "/api/v1/workers/{id}/heartbeat",
            post(routes_workers::handler_worker_heartbeat),
        )
        .route(
            "/api/v1/workers/{id}/deregister",
            post(routes_workers::handler_worker_deregister),
        )
        .route("/api/v1/workers", get(routes_workers::handler_workers_list))
        .route("/api/v1/logs", get(routes_health::handler_logs))
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .fallback(handler_not_found)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the coordinator: migrations, registry hydration, startup
/// reconciliation, background sweeps, then serve until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;

    let port = config.coordinator_port;
    let state = AppState::new(db, config);

    // Rebuild the registry from the durable mirror; everything comes back
    // REGISTERED until a live heartbeat proves otherwise.
    let rows = state.db.get_all_workers().await?;
    info!(workers = rows.len(), "hydrating worker registry");
    lock_or_recover(&state.registry).hydrate(rows);

    let report = state.reconciler.startup_scan().await?;
    info!(
        backend_local_failed = report.backend_local_failed,
        parked = report.parked_for_reconciliation,
        "startup reconciliation scan complete"
    );

    if let Ok(removed) = state.store.sweep_staging(Duration::from_secs(3600)) {
        if removed > 0 {
            info!(removed, "removed stale checkpoint staging directories");
        }
    }

    spawn_background_tasks(&state);

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "coordinator listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Flush any progress still buffered before exiting.
    state.debouncer.flush_all(&state.db).await;
    Ok(())
}

fn spawn_background_tasks(state: &Arc<AppState>) {
    // Progress debounce flusher.
    let flush_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(crate::progress::DEBOUNCE);
        loop {
            interval.tick().await;
            flush_state.debouncer.flush(&flush_state.db).await;
        }
    });

    // Registry liveness sweep.
    let liveness_state = Arc::clone(state);
    tokio::spawn(async move {
        let timeout = liveness_state.config.heartbeat_timeout_seconds as i64;
        let eviction_grace = timeout * 10;
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let (marked, evicted) = {
                let mut registry = lock_or_recover(&liveness_state.registry);
                (registry.sweep_unresponsive(timeout), registry.evict(eviction_grace))
            };
            for worker_id in &marked {
                warn!(worker_id, "worker unresponsive");
                if let Err(e) = liveness_state
                    .db
                    .set_worker_state(worker_id, "UNRESPONSIVE", None)
                    .await
                {
                    warn!(worker_id, error = %e, "failed to mirror UNRESPONSIVE state");
                }
            }
            for worker_id in &evicted {
                info!(worker_id, "evicted worker from registry");
                let _ = liveness_state.db.delete_worker(worker_id).await;
            }
            if let Err(e) = liveness_state
                .db
                .evict_unresponsive_workers(eviction_grace)
                .await
            {
                warn!(error = %e, "durable worker eviction failed");
            }
        }
    });

    // Reconciler sweep plus Prometheus gauge refresh.
    let sweep_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            match sweep_state.reconciler.sweep().await {
                Ok(report) => {
                    for _ in 0..report.orphaned {
                        sweep_state.prom_metrics.operations_orphaned.inc();
                    }
                }
                Err(e) => warn!(error = %e, "reconciler sweep failed"),
            }
            refresh_gauges(&sweep_state).await;
        }
    });

    // Housekeeping: retention-based cleanup, hourly.
    let housekeeping_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            match housekeeping_state.reconciler.housekeeping().await {
                Ok(report) => info!(
                    operations = report.operations_deleted,
                    checkpoints = report.checkpoints_deleted,
                    staging = report.staging_dirs_removed,
                    "housekeeping sweep complete"
                ),
                Err(e) => warn!(error = %e, "housekeeping sweep failed"),
            }
        }
    });
}

async fn refresh_gauges(state: &Arc<AppState>) {
    if let Ok(counts) = state.db.count_operations_by_status().await {
        for (status, count) in counts {
            state
                .prom_metrics
                .operations_by_status
                .get_or_create(&StatusLabel { status })
                .set(count);
        }
    }
    if let Ok((count, state_bytes, artifact_bytes)) = state.db.checkpoint_totals().await {
        state.prom_metrics.checkpoints.set(count);
        state
            .prom_metrics
            .checkpoint_bytes
            .set(state_bytes + artifact_bytes);
    }
    let (connected, available) = {
        let registry = lock_or_recover(&state.registry);
        let all = registry.get_all();
        let available = all
            .iter()
            .filter(|w| w.status == crate::registry::WorkerStatus::Available)
            .count();
        (all.len(), available)
    };
    state.prom_metrics.workers_connected.set(connected as i64);
    state.prom_metrics.workers_available.set(available as i64);
}

/// JSON 404 for unmatched API paths (axum's default is an empty body).
pub async fn handler_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "NOT_FOUND" })),
    )
}
