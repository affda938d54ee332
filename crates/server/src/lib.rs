//! Colloquy server
//!
//! HTTP and WebSocket control surface over the session manager: start,
//! stop, destroy and inspect the single active session, stream its
//! events, and expose health and Prometheus endpoints.

pub mod breaker;
pub mod http;
pub mod metrics;
pub mod state;
pub mod websocket;

pub use breaker::StartCircuitBreaker;
pub use http::create_router;
pub use metrics::{init_metrics, metrics_handler};
pub use state::AppState;

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Start requests are suppressed while the failure breaker is open
    #[error("Session start suppressed, retry in {0:?}")]
    StartSuppressed(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<&ServerError> for StatusCode {
    fn from(err: &ServerError) -> Self {
        match err {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::StartSuppressed(_) => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from(&self);
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        let mut response = (status, body).into_response();
        if let ServerError::StartSuppressed(retry_after) = self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            StatusCode::from(&ServerError::InvalidRequest("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StatusCode::from(&ServerError::StartSuppressed(Duration::from_secs(30))),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            StatusCode::from(&ServerError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_suppressed_response_carries_retry_after() {
        let response = ServerError::StartSuppressed(Duration::from_secs(30)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(axum::http::header::RETRY_AFTER),
            Some(&axum::http::HeaderValue::from_static("30"))
        );
    }
}
