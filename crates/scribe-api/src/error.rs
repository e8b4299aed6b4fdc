//! HTTP error mapping
//!
//! Every failure response carries `{error_kind, message, retry_after?}` with
//! the stable kind string from the core taxonomy. Backend details and
//! filesystem paths never reach the wire.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use scribe_core::Error;

/// Handler result alias
pub type ApiResult<T> = Result<T, ApiError>;

/// Wrapper turning a core [`Error`] into a JSON response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Wire shape of a failure
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable kind string
    pub error_kind: &'static str,

    /// Short human sentence
    pub message: String,

    /// Suggested retry delay in seconds, on rate-limit refusals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = ErrorBody {
            error_kind: err.kind(),
            message: client_message(&err),
            retry_after: err.retry_after(),
        };

        if status.is_server_error() {
            tracing::error!(kind = body.error_kind, error = %err, "request failed");
        }

        (status, Json(body)).into_response()
    }
}

/// Message safe to show a client
fn client_message(err: &Error) -> String {
    match err {
        Error::Io(_) => "storage failure".to_string(),
        Error::Serialization(_) => "internal serialization failure".to_string(),
        Error::Config(_) | Error::Internal(_) => "internal error".to_string(),
        Error::QueueUnavailable(_) => "the work queue is temporarily unavailable".to_string(),
        Error::RegistryUnavailable(_) => "the job registry is temporarily unavailable".to_string(),
        other => other.to_string(),
    }
}
