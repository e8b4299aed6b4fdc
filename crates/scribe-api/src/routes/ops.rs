//! Operational endpoints: health, metrics exposition, stats

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use scribe_core::jobs::JobState;
use scribe_core::telemetry::{render_exposition, HealthStatus};

use crate::state::AppState;

/// Operator routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.telemetry.health().await;
    let status = match report.status {
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let snapshot = state.telemetry.snapshot().await;
    let queue_depth = state.queue.depth().await.unwrap_or(0);
    let in_progress = state
        .registry
        .count_by_state(JobState::Processing)
        .await
        .unwrap_or(0);

    let body = render_exposition(&snapshot, queue_depth, in_progress);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    let queue_depth = state.queue.depth().await.unwrap_or(0);
    let in_progress = state
        .registry
        .count_by_state(JobState::Processing)
        .await
        .unwrap_or(0);
    let workers = state.telemetry.fresh_workers().await;

    Json(json!({
        "queue_depth": queue_depth,
        "in_progress": in_progress,
        "workers": workers,
    }))
    .into_response()
}
