//! Status, result, and cancellation endpoints

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;

use scribe_core::jobs::JobId;
use scribe_core::{Error, ResultView};

use crate::error::ApiResult;
use crate::routes::caller_identity;
use crate::state::AppState;

/// Polling routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status/:job_id", get(get_status))
        .route("/result/:job_id", get(get_result))
        .route("/job/:job_id", delete(cancel))
}

/// Opaque ids: a malformed one is indistinguishable from an unknown one
fn parse_job_id(raw: &str) -> scribe_core::Result<JobId> {
    raw.parse()
        .map_err(|_| Error::not_found(format!("job {} does not exist", raw)))
}

/// Apply the server-side polling deadline to a registry/cache read
async fn with_deadline<T>(
    state: &AppState,
    fut: impl std::future::Future<Output = scribe_core::Result<T>>,
) -> scribe_core::Result<T> {
    tokio::time::timeout(state.config.server.poll_deadline(), fut)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("the request took too long to serve".to_string())))
}

async fn get_status(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let caller = caller_identity(&headers, connect.as_ref());
    let job_id = parse_job_id(&job_id)?;

    let status = with_deadline(&state, state.polling.get_status(&caller, job_id)).await?;
    Ok(Json(status).into_response())
}

async fn get_result(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let caller = caller_identity(&headers, connect.as_ref());
    let job_id = parse_job_id(&job_id)?;

    match with_deadline(&state, state.polling.get_result(&caller, job_id)).await? {
        ResultView::Ready(transcript) => Ok(Json(transcript).into_response()),
        ResultView::Pending { state } => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "job_id": job_id, "state": state })),
        )
            .into_response()),
        ResultView::Terminal {
            state,
            error_kind,
            error_message,
        } => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "job_id": job_id,
                "state": state,
                "error_kind": error_kind,
                "message": error_message,
            })),
        )
            .into_response()),
    }
}

async fn cancel(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let caller = caller_identity(&headers, connect.as_ref());
    let job_id = parse_job_id(&job_id)?;

    let final_state = with_deadline(&state, state.polling.cancel(&caller, job_id)).await?;
    Ok(Json(json!({ "job_id": job_id, "state": final_state })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_id_maps_to_not_found() {
        let err = parse_job_id("not-a-uuid").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_well_formed_id_parses() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
    }
}
