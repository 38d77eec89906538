//! Checkpoint API — inspection and manual cleanup.
//!
//! Read-only views over the checkpoint store plus explicit deletion for
//! operators reclaiming disk. State bodies are returned on single reads
//! only; listings carry sizes and timestamps.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{error_response, AppState};
use crate::error::CoreError;
use crate::operation::OperationType;

pub(super) async fn handler_checkpoint_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_row(&id).await {
        Ok(Some(row)) => (
            StatusCode::OK,
            Json(json!({
                "operation_id": row.operation_id,
                "checkpoint_type": row.checkpoint_type,
                "operation_type": row.operation_type,
                "created_at": row.created_at,
                "state": row.state,
                "artifacts_path": row.artifact_handle,
                "sizes": {
                    "state_bytes": row.state_bytes,
                    "artifact_bytes": row.artifact_bytes,
                },
            })),
        ),
        Ok(None) => error_response(&CoreError::NoCheckpoint(id)),
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_checkpoint_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete(&id).await {
        Ok(deleted) => (StatusCode::OK, Json(json!({ "deleted": deleted }))),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub(super) struct CheckpointListQuery {
    #[serde(default)]
    older_than_hours: Option<i64>,
    #[serde(default)]
    operation_type: Option<String>,
}

pub(super) async fn handler_checkpoints_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckpointListQuery>,
) -> impl IntoResponse {
    let operation_type = query.operation_type.as_deref().and_then(OperationType::parse);
    match state.store.list(query.older_than_hours, operation_type).await {
        Ok(checkpoints) => (
            StatusCode::OK,
            Json(json!({ "checkpoints": checkpoints, "total": checkpoints.len() })),
        ),
        Err(e) => error_response(&e),
    }
}
