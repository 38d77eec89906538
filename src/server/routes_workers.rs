//! Worker API — register, heartbeat, deregister, fleet listing.
//!
//! Registration triggers reconciliation synchronously and returns the
//! reconciled view, so a re-connecting worker immediately knows whether to
//! continue, stop, or sit idle. Heartbeats return the cancel-requested
//! flag, which the worker's harness surfaces to the domain executor.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::{error_response, lock_or_recover, AppState};
use crate::error::CoreError;
use crate::operation::{OperationStatus, ProgressUpdate};
use crate::reconciler::{Directive, RegistrationPacket};
use crate::registry::WorkerStatus;
use crate::telemetry::HostMetrics;

pub(super) async fn handler_worker_register(
    State(state): State<Arc<AppState>>,
    Json(packet): Json<RegistrationPacket>,
) -> impl IntoResponse {
    info!(
        worker_id = %packet.worker_id,
        worker_type = %packet.worker_type,
        endpoint = %packet.endpoint_url,
        current_operation = packet.current_operation_id.as_deref().unwrap_or("-"),
        completed = packet.completed_operations.len(),
        "worker registering"
    );

    let ack = state.reconciler.reconcile_registration(&packet).await;

    // The in-memory index records the reconciled claim, not the raw one.
    let current = match ack.directive {
        Directive::Continue => ack.reconciled_current_operation_id.clone(),
        _ => None,
    };
    let worker_state = {
        let mut registry = lock_or_recover(&state.registry);
        let entry = registry.register(
            &packet.worker_id,
            packet.worker_type,
            &packet.endpoint_url,
            packet.capabilities.clone(),
            current.clone(),
        );
        entry.status
    };
    if let Err(e) = state
        .db
        .upsert_worker(
            &packet.worker_id,
            packet.worker_type.as_str(),
            &packet.endpoint_url,
            &packet.capabilities,
            worker_state.as_str(),
            current.as_deref(),
        )
        .await
    {
        warn!(worker_id = %packet.worker_id, error = %e, "failed to mirror registration");
    }

    let _ = state
        .db
        .insert_system_log(&crate::db::SystemLogEntry {
            level: "info".to_string(),
            component: "worker_register".to_string(),
            message: format!(
                "worker {} registered ({}) directive {:?}",
                packet.worker_id, packet.worker_type, ack.directive
            ),
            operation_id: ack.reconciled_current_operation_id.clone(),
            worker_id: Some(packet.worker_id.clone()),
            context: None,
        })
        .await;

    (StatusCode::OK, Json(serde_json::to_value(&ack).unwrap_or_default()))
}

#[derive(Deserialize)]
pub(super) struct HeartbeatPayload {
    #[serde(default)]
    current_operation_id: Option<String>,
    #[serde(default)]
    run_epoch: Option<i64>,
    #[serde(default)]
    progress: Option<ProgressUpdate>,
    #[serde(default)]
    metrics: Option<HostMetrics>,
}

pub(super) async fn handler_worker_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(payload): Json<HeartbeatPayload>,
) -> impl IntoResponse {
    let known = {
        let mut registry = lock_or_recover(&state.registry);
        registry.heartbeat(&worker_id, payload.current_operation_id.as_deref())
    };
    if !known {
        // The registry lost this worker (restart or eviction); it must
        // re-register with the full packet before heartbeats count.
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "UNKNOWN_WORKER", "message": "re-register" })),
        );
    }

    let worker_state = if payload.current_operation_id.is_some() {
        WorkerStatus::Busy
    } else {
        WorkerStatus::Available
    };
    let metrics_json = payload
        .metrics
        .as_ref()
        .and_then(|m| serde_json::to_value(m).ok());
    if let Err(e) = state
        .db
        .heartbeat_worker(
            &worker_id,
            worker_state.as_str(),
            payload.current_operation_id.as_deref(),
            metrics_json.as_ref(),
        )
        .await
    {
        warn!(worker_id, error = %e, "failed to mirror heartbeat");
    }

    let mut cancel_requested = false;
    if let Some(operation_id) = payload.current_operation_id.as_deref() {
        match state.db.get_operation(operation_id).await {
            Ok(Some(row)) => {
                let owns = row.owner == worker_id
                    && row.status_enum() == Some(OperationStatus::Running);
                if owns {
                    let _ = state.db.heartbeat_operation(operation_id, &worker_id).await;
                    if let Some(progress) = &payload.progress {
                        state.debouncer.offer(
                            operation_id,
                            payload.run_epoch.unwrap_or(row.run_epoch),
                            progress.percent,
                            &progress.message,
                            progress.context.clone(),
                        );
                    }
                    cancel_requested = row.cancel_requested;
                } else {
                    // The database does not recognize this claim (terminal,
                    // reassigned, or never known): tell the worker to stop.
                    cancel_requested = true;
                }
            }
            Ok(None) => cancel_requested = true,
            Err(e) => {
                return error_response(&CoreError::Other(e));
            }
        }
    }

    (StatusCode::OK, Json(json!({ "cancel_requested": cancel_requested })))
}

pub(super) async fn handler_worker_deregister(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> impl IntoResponse {
    info!(worker_id, "worker deregistering");
    {
        let mut registry = lock_or_recover(&state.registry);
        registry.deregister(&worker_id);
    }
    if let Err(e) = state.db.delete_worker(&worker_id).await {
        warn!(worker_id, error = %e, "failed to remove worker row");
    }
    let _ = state
        .db
        .insert_system_log(&crate::db::SystemLogEntry {
            level: "info".to_string(),
            component: "worker_deregister".to_string(),
            message: format!("worker {} deregistered", worker_id),
            operation_id: None,
            worker_id: Some(worker_id.clone()),
            context: None,
        })
        .await;
    // Any operation the worker still owned will be caught by the orphan
    // sweep once its heartbeats stop.
    (StatusCode::OK, Json(json!({ "ok": true })))
}

/// Fleet listing reads the durable mirror so it includes live host
/// metrics; the in-memory index stays the authority for selection.
pub(super) async fn handler_workers_list(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.db.get_all_workers().await {
        Ok(workers) => (
            StatusCode::OK,
            Json(json!({ "workers": workers, "total_workers": workers.len() })),
        ),
        Err(e) => {
            warn!(error = %e, "fleet listing from database failed; using in-memory index");
            let workers = lock_or_recover(&state.registry).get_all();
            (
                StatusCode::OK,
                Json(json!({ "workers": workers, "total_workers": workers.len() })),
            )
        }
    }
}
