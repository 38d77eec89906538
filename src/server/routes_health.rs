//! Health, readiness, metrics and log endpoints.
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `GET /healthz` | Liveness — the process is serving HTTP |
//! | `GET /readyz` | Readiness — both database pools answer within 2 s |
//! | `GET /metrics` | Prometheus text exposition |
//! | `GET /api/v1/logs` | Recent system log rows for forensics |

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::AppState;

pub(super) async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(super) async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timeout = std::time::Duration::from_secs(2);

    match tokio::time::timeout(timeout, state.db.health_check()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => return (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }

    let read_check = tokio::time::timeout(timeout, async {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(state.db.read_pool())
            .await
    })
    .await;
    match read_check {
        Ok(Ok(_)) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "read pool unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "read pool timeout"),
    }
}

pub(super) async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.prom_metrics.encode(),
    )
}

#[derive(Deserialize)]
pub(super) struct LogsQuery {
    #[serde(default)]
    limit: Option<i64>,
}

pub(super) async fn handler_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.db.recent_system_logs(limit).await {
        Ok(logs) => (StatusCode::OK, Json(json!({ "logs": logs }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "DATABASE_ERROR", "message": e.to_string() })),
        ),
    }
}
