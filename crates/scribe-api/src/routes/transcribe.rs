//! Submission endpoint
//!
//! `POST /transcribe` takes a multipart form: a `file` part with the audio
//! plus the optional `language`, `vad_filter`, and `initial_prompt` fields.
//! Unrecognized fields are rejected. A warm cache hit answers 200 with the
//! job already Completed; the normal path answers 202 with a Queued job.

use axum::extract::multipart::Field;
use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use scribe_core::jobs::{JobId, SubmissionOptions};
use scribe_core::{Error, SubmissionOutcome, SubmissionService};

use crate::error::{ApiError, ApiResult};
use crate::routes::caller_identity;
use crate::state::AppState;

/// Submission routes
pub fn router() -> Router<AppState> {
    Router::new().route("/transcribe", post(submit))
}

async fn submit(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Response> {
    let caller = caller_identity(&headers, connect.as_ref());
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    // The provisional id outlives the body-read future so the blob can be
    // discarded even when the deadline cuts the upload short
    let provisional: Arc<Mutex<Option<JobId>>> = Arc::new(Mutex::new(None));

    let deadline = state.config.storage.body_read_timeout();
    let result = tokio::time::timeout(
        deadline,
        handle_submission(&state.submission, &caller, declared_len, multipart, &provisional),
    )
    .await
    .unwrap_or_else(|_| Err(Error::Timeout("reading the upload body timed out".to_string())));

    match result {
        Ok(outcome) => Ok(respond(outcome)),
        Err(e) => {
            if let Some(job_id) = provisional.lock().await.take() {
                state.submission.abort(job_id).await;
            }
            state.submission.record_rejection().await;
            Err(ApiError(e))
        }
    }
}

fn respond(outcome: SubmissionOutcome) -> Response {
    let status = if outcome.cache_hit {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let body = json!({
        "job_id": outcome.job_id,
        "state": outcome.state,
    });
    (status, Json(body)).into_response()
}

/// Drive the multipart form through the submission steps
async fn handle_submission(
    service: &SubmissionService,
    caller: &str,
    declared_len: Option<u64>,
    mut multipart: Multipart,
    provisional: &Arc<Mutex<Option<JobId>>>,
) -> scribe_core::Result<SubmissionOutcome> {
    service.admit(caller, declared_len)?;

    let mut options = SubmissionOptions::default();
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if upload.is_some() {
                    return Err(Error::bad_request("duplicate file field"));
                }
                let content_type = field.content_type().unwrap_or_default().to_string();
                service.validate_media_type(&content_type)?;

                let filename = field.file_name().unwrap_or("upload").to_string();
                let job_id = service.new_job_id();
                *provisional.lock().await = Some(job_id);

                let stored = service
                    .store_upload(job_id, &filename, Box::pin(field_stream(field)))
                    .await?;
                upload = Some((job_id, filename, stored));
            }
            "language" => {
                options.language = Some(field_text(field).await?);
            }
            "vad_filter" => {
                options.vad_filter = parse_bool(&field_text(field).await?)?;
            }
            "initial_prompt" => {
                options.initial_prompt = Some(field_text(field).await?);
            }
            unknown => {
                return Err(Error::bad_request(format!(
                    "UnknownOption: unrecognized field {:?}",
                    unknown
                )));
            }
        }
    }

    let Some((job_id, filename, stored)) = upload else {
        return Err(Error::bad_request("missing file field"));
    };

    let outcome = service.finalize(job_id, &filename, options, stored).await?;
    // Enrolled (or answered from cache): nothing left to clean up
    *provisional.lock().await = None;
    Ok(outcome)
}

/// Adapt a multipart field into the chunk stream the service consumes
fn field_stream(
    field: Field<'_>,
) -> impl futures::Stream<Item = scribe_core::Result<Bytes>> + '_ {
    futures::stream::unfold(field, |mut field| async move {
        match field.chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), field)),
            Ok(None) => None,
            Err(e) => Some((
                Err(Error::bad_request(format!("upload stream failed: {}", e))),
                field,
            )),
        }
    })
}

async fn field_text(field: Field<'_>) -> scribe_core::Result<String> {
    field
        .text()
        .await
        .map_err(|e| Error::bad_request(format!("unreadable form field: {}", e)))
}

fn parse_bool(value: &str) -> scribe_core::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" | "" => Ok(false),
        other => Err(Error::bad_request(format!(
            "vad_filter must be a boolean, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
