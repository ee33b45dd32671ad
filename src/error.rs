use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Semantic error kinds for the SSE core. `MailboxFull` is
/// deliberately absent: it never surfaces past `distribute`, which handles
/// it internally with the drop-oldest-then-put rule.
#[derive(Debug, Error)]
pub enum SseError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("central event queue is full")]
    QueueFull,

    #[error("store operation failed: {0}")]
    StoreFailure(#[from] sqlx::Error),

    #[error("event manager is not running")]
    ManagerNotRunning,

    #[error("stream connection broken")]
    StreamBroken,
}

pub type SseResult<T> = Result<T, SseError>;

impl IntoResponse for SseError {
    fn into_response(self) -> Response {
        // Event payloads and row contents are never echoed back to the
        // client — only the generic message below.
        let (status, message) = match &self {
            SseError::UnknownEventType(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
            SseError::QueueFull => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
            SseError::StoreFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
            SseError::ManagerNotRunning => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
            SseError::StreamBroken => (StatusCode::BAD_GATEWAY, "stream closed"),
        };

        tracing::error!(error = %self, "request failed");

        (status, Json(json!({"status": "error", "message": message}))).into_response()
    }
}
