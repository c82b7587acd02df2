//! Bridge error types.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No engine incarnation is running.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The engine input queue is at capacity.
    #[error("engine input queue full ({0} pending)")]
    QueueFull(usize),

    /// The submitted body is not a JSON value.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The bridge is shutting down.
    #[error("bridge is shutting down")]
    ShuttingDown,

    /// Configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to bind the listen address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// HTTP status and short machine-readable kind for this error.
    #[must_use]
    pub const fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::EngineUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable"),
            Self::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
            Self::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Self::InvalidEnvelope(_) => (StatusCode::BAD_REQUEST, "invalid_envelope"),
            Self::Config(_) | Self::BindFailed(_, _) | Self::Io(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        let body = ErrorResponse {
            error,
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEnvelope(err.to_string())
    }
}
