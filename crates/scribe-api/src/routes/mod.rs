//! HTTP route handlers

pub mod jobs;
pub mod ops;
pub mod transcribe;

use axum::extract::{ConnectInfo, DefaultBodyLimit};
use axum::http::HeaderMap;
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Multipart framing overhead allowed on top of the audio size cap
const BODY_LIMIT_SLACK: u64 = 1024 * 1024;

/// Build the full router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.config.storage.max_file_size_bytes() + BODY_LIMIT_SLACK;

    Router::new()
        .merge(transcribe::router())
        .merge(jobs::router())
        .merge(ops::router())
        .layer(DefaultBodyLimit::max(body_limit as usize))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity for rate limiting
///
/// The transport layer may supply an identity via `x-caller-id` (the auth
/// hook); failing that the source address is used, preferring the
/// `x-forwarded-for` chain set by a load balancer.
pub fn caller_identity(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(id) = headers.get("x-caller-id").and_then(|v| v.to_str().ok()) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    connect
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_identity_prefers_explicit_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-caller-id", HeaderValue::from_static("tenant-42"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(caller_identity(&headers, None), "tenant-42");
    }

    #[test]
    fn test_caller_identity_falls_back_to_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(caller_identity(&headers, None), "203.0.113.7");
    }

    #[test]
    fn test_caller_identity_uses_peer_address() {
        let connect = ConnectInfo(SocketAddr::from(([192, 168, 1, 5], 1234)));
        assert_eq!(
            caller_identity(&HeaderMap::new(), Some(&connect)),
            "192.168.1.5"
        );
    }

    #[test]
    fn test_caller_identity_last_resort() {
        assert_eq!(caller_identity(&HeaderMap::new(), None), "unknown");
    }
}
