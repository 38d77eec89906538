//! Operation API — create, read, list, cancel, resume, dispatch.
//!
//! Dispatch is synchronous with a short ack timeout: the selected worker
//! must transition the record to RUNNING before responding, but never
//! blocks on the computation itself. A dispatch failure marks a fresh
//! operation FAILED (`kind=NO_WORKER`) and reverts a resume to its prior
//! terminal state; the caller decides whether to retry.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{error_response, lock_or_recover, AppState};
use crate::db::{OperationFilter, OperationRow};
use crate::error::CoreError;
use crate::operation::{
    mint_operation_id, FailureKind, OperationError, OperationStatus, OperationType,
};
use crate::registry::WorkerEntry;

#[derive(Deserialize)]
pub(super) struct CreateOperationPayload {
    operation_type: String,
    request_payload: Value,
    /// Client-supplied id; minted server-side when absent.
    #[serde(default)]
    operation_id: Option<String>,
}

/// Render an operation row in the API shape.
pub(super) fn operation_json(row: &OperationRow, checkpoint_present: bool) -> Value {
    json!({
        "operation_id": row.operation_id,
        "operation_type": row.operation_type,
        "status": row.status,
        "owner": row.owner,
        "created_at": row.created_at,
        "started_at": row.started_at,
        "completed_at": row.completed_at,
        "progress": {
            "percent": row.progress_percent,
            "message": row.progress_message,
            "updated_at": row.progress_updated_at,
            "context": row.progress_context,
        },
        "result": row.result,
        "error": row.error,
        "checkpoint_present": checkpoint_present,
        "cancel_requested": row.cancel_requested,
        "run_epoch": row.run_epoch,
    })
}

/// POST the start (or resume) call to a worker. `request_payload` is
/// absent on resume — the worker loads the checkpoint itself.
async fn dispatch_to_worker(
    state: &AppState,
    worker: &WorkerEntry,
    operation_type: OperationType,
    operation_id: &str,
    request_payload: Option<&Value>,
) -> Result<(), CoreError> {
    let url = format!(
        "{}/{}/start",
        worker.endpoint_url.trim_end_matches('/'),
        operation_type.as_str()
    );
    let mut body = json!({ "operation_id": operation_id });
    if let Some(payload) = request_payload {
        body["request_payload"] = payload.clone();
    }
    let response = state
        .http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| CoreError::WorkerUnresponsive {
            worker_id: worker.worker_id.clone(),
            reason: e.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(CoreError::WorkerUnresponsive {
            worker_id: worker.worker_id.clone(),
            reason: format!("worker answered {}", response.status()),
        });
    }
    Ok(())
}

pub(super) async fn handler_operation_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOperationPayload>,
) -> impl IntoResponse {
    let Some(operation_type) = OperationType::parse(&payload.operation_type) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "UNKNOWN_OPERATION_TYPE",
                "message": format!("unknown operation_type {}", payload.operation_type),
            })),
        );
    };
    let operation_id = payload
        .operation_id
        .unwrap_or_else(mint_operation_id);

    let selected = lock_or_recover(&state.registry).select(operation_type, &[]);

    let row = match state
        .db
        .create_operation(
            &operation_id,
            operation_type,
            selected
                .as_ref()
                .map(|w| w.worker_id.as_str())
                .unwrap_or(crate::operation::BACKEND_LOCAL),
            &payload.request_payload,
        )
        .await
    {
        Ok(row) => row,
        Err(e) => return error_response(&e),
    };

    let Some(worker) = selected else {
        // No capable worker: the record is failed immediately so the
        // client is not left with a PENDING operation nothing will run.
        let error = OperationError::new(
            FailureKind::NoWorker,
            format!("no available worker with capability {}", operation_type),
        );
        if let Err(e) = state
            .db
            .fail_operation(&operation_id, &error, &[OperationStatus::Pending])
            .await
        {
            warn!(operation_id, error = %e, "failed to mark NO_WORKER failure");
        }
        state.prom_metrics.record_dispatch("no_worker");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "NO_WORKER", "capability": operation_type.as_str() })),
        );
    };

    lock_or_recover(&state.registry).mark_busy(&worker.worker_id, &operation_id);
    let _ = state
        .db
        .set_worker_state(&worker.worker_id, "BUSY", Some(&operation_id))
        .await;

    match dispatch_to_worker(
        &state,
        &worker,
        operation_type,
        &operation_id,
        Some(&payload.request_payload),
    )
    .await
    {
        Ok(()) => {
            info!(operation_id, worker_id = %worker.worker_id, "operation dispatched");
            state.prom_metrics.record_dispatch("ok");
            let status = state
                .db
                .get_operation(&operation_id)
                .await
                .ok()
                .flatten()
                .map(|r| r.status)
                .unwrap_or_else(|| row.status.clone());
            (
                StatusCode::OK,
                Json(json!({ "operation_id": operation_id, "status": status })),
            )
        }
        Err(dispatch_err) => {
            warn!(operation_id, worker_id = %worker.worker_id, error = %dispatch_err,
                  "dispatch failed; failing operation");
            state.prom_metrics.record_dispatch("failed");
            {
                let mut registry = lock_or_recover(&state.registry);
                registry.mark_available(&worker.worker_id);
            }
            let _ = state
                .db
                .set_worker_state(&worker.worker_id, "AVAILABLE", None)
                .await;
            let error = OperationError::new(
                FailureKind::NoWorker,
                format!("dispatch to worker {} failed: {}", worker.worker_id, dispatch_err),
            );
            // The worker may have acked (RUNNING) before the failure
            // surfaced; only a still-PENDING record is failed here.
            if let Err(e) = state
                .db
                .fail_operation(&operation_id, &error, &[OperationStatus::Pending])
                .await
            {
                warn!(operation_id, error = %e, "dispatch-failure cleanup refused");
            }
            error_response(&dispatch_err)
        }
    }
}

pub(super) async fn handler_operation_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let row = match state.db.get_operation(&id).await {
        Ok(Some(row)) => row,
        Ok(None) => return error_response(&CoreError::OperationNotFound(id)),
        Err(e) => return error_response(&CoreError::Other(e)),
    };
    let checkpoint_present = state.db.checkpoint_present(&id).await.unwrap_or(false);
    let mut body = operation_json(&row, checkpoint_present);

    // A RESUMING operation is in flight between coordinator and worker;
    // surface the registry's latest view of the claiming worker.
    if row.status_enum() == Some(OperationStatus::Resuming) {
        let registry = lock_or_recover(&state.registry);
        if let Some(worker) = registry
            .get_all()
            .into_iter()
            .find(|w| w.current_operation_id.as_deref() == Some(id.as_str()))
        {
            body["worker"] = json!({
                "worker_id": worker.worker_id,
                "state": worker.status.as_str(),
                "last_heartbeat_at": worker.last_heartbeat_at,
            });
        }
    }
    (StatusCode::OK, Json(body))
}

#[derive(Deserialize)]
pub(super) struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    operation_type: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    older_than_hours: Option<i64>,
    #[serde(default)]
    resumable: Option<bool>,
    #[serde(default)]
    limit: Option<i64>,
}

pub(super) async fn handler_operations_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let filter = OperationFilter {
        status: query.status.as_deref().and_then(OperationStatus::parse),
        operation_type: query.operation_type.as_deref().and_then(OperationType::parse),
        owner: query.owner,
        older_than_hours: query.older_than_hours,
        resumable: query.resumable.unwrap_or(false),
        limit: query.limit,
    };
    match state.db.list_operations(&filter).await {
        Ok(rows) => {
            let mut operations = Vec::with_capacity(rows.len());
            for row in &rows {
                let present = state
                    .db
                    .checkpoint_present(&row.operation_id)
                    .await
                    .unwrap_or(false);
                operations.push(operation_json(row, present));
            }
            (
                StatusCode::OK,
                Json(json!({ "operations": operations, "total": operations.len() })),
            )
        }
        Err(e) => error_response(&CoreError::Other(e)),
    }
}

pub(super) async fn handler_operation_cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    use crate::db::CancelOutcome;
    match state.db.request_cancel(&id).await {
        Ok(CancelOutcome::Cancelled) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "CANCELLED" })),
        ),
        Ok(CancelOutcome::CancelRequested) => {
            // Best-effort nudge so the worker notices before its next
            // heartbeat; the flag in the record is the real signal.
            notify_worker_cancel(&state, &id).await;
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "CANCEL_REQUESTED" })),
            )
        }
        Ok(CancelOutcome::AlreadyTerminal(status)) => (
            StatusCode::OK,
            Json(json!({ "status": status.as_str() })),
        ),
        Err(e) => error_response(&e),
    }
}

async fn notify_worker_cancel(state: &AppState, operation_id: &str) {
    let Ok(Some(row)) = state.db.get_operation(operation_id).await else {
        return;
    };
    let endpoint = {
        let registry = lock_or_recover(&state.registry);
        registry.get(&row.owner).map(|w| w.endpoint_url.clone())
    };
    let Some(endpoint) = endpoint else { return };
    let url = format!("{}/cancel", endpoint.trim_end_matches('/'));
    let result = state
        .http
        .post(&url)
        .json(&json!({ "operation_id": operation_id }))
        .send()
        .await;
    if let Err(e) = result {
        warn!(operation_id, error = %e, "cancel notification failed; worker will poll the flag");
    }
}

pub(super) async fn handler_operation_resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    // Remember the prior terminal state for the revert path. Terminal
    // states never change between themselves, so a successful CAS below
    // means this read was the state we left.
    let prior = match state.db.get_operation(&id).await {
        Ok(Some(row)) => row.status_enum(),
        Ok(None) => return error_response(&CoreError::OperationNotFound(id)),
        Err(e) => return error_response(&CoreError::Other(e)),
    };

    let row = match state.db.try_resume(&id).await {
        Ok(row) => row,
        Err(e) => return error_response(&e),
    };
    let prior = prior.unwrap_or(OperationStatus::Failed);

    // The state body must parse before a worker is bothered; a corrupt
    // checkpoint reverts the record and surfaces 422.
    let loaded = match state.store.load(&id, false).await {
        Ok(Some(loaded)) => loaded,
        Ok(None) => {
            let _ = state.db.revert_resume(&id, prior).await;
            return error_response(&CoreError::NoCheckpoint(id));
        }
        Err(e) => {
            let _ = state.db.revert_resume(&id, prior).await;
            return error_response(&e);
        }
    };

    let Some(operation_type) = row.type_enum() else {
        let _ = state.db.revert_resume(&id, prior).await;
        return error_response(&CoreError::Other(anyhow::anyhow!(
            "operation {} has unknown type {}",
            id,
            row.operation_type
        )));
    };

    let selected = lock_or_recover(&state.registry).select(operation_type, &[]);
    let Some(worker) = selected else {
        let _ = state.db.revert_resume(&id, prior).await;
        state.prom_metrics.record_dispatch("no_worker");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "NO_WORKER", "capability": operation_type.as_str() })),
        );
    };

    lock_or_recover(&state.registry).mark_busy(&worker.worker_id, &id);
    let _ = state
        .db
        .set_worker_state(&worker.worker_id, "BUSY", Some(&id))
        .await;

    match dispatch_to_worker(&state, &worker, operation_type, &id, None).await {
        Ok(()) => {
            info!(operation_id = %id, worker_id = %worker.worker_id, "resume dispatched");
            state.prom_metrics.record_dispatch("ok");
            (
                StatusCode::OK,
                Json(json!({
                    "operation_id": id,
                    "status": "RESUMING",
                    "resumed_from": {
                        "checkpoint_type": loaded.checkpoint_type.as_str(),
                        "created_at": loaded.created_at,
                        "resume_point": loaded.state.resume_point(),
                    },
                })),
            )
        }
        Err(dispatch_err) => {
            warn!(operation_id = %id, error = %dispatch_err, "resume dispatch failed; reverting");
            state.prom_metrics.record_dispatch("failed");
            {
                let mut registry = lock_or_recover(&state.registry);
                registry.mark_available(&worker.worker_id);
            }
            let _ = state
                .db
                .set_worker_state(&worker.worker_id, "AVAILABLE", None)
                .await;
            let _ = state.db.revert_resume(&id, prior).await;
            error_response(&dispatch_err)
        }
    }
}
