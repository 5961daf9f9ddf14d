//! Relay error types.
//!
//! ```text
//! RelayError
//! ├── InvalidPayload        - malformed or inconsistent event payload
//! ├── InvalidUserId         - identity that fails the id format check
//! ├── ConversationNotFound  - unknown conversation id
//! ├── MessageNotFound       - unknown message id inside a conversation
//! ├── Database              - durable store failure (never shown verbatim)
//! └── Task                  - blocking store task panicked or was cancelled
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The event payload was rejected at the boundary.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A user identifier did not match the accepted format.
    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    /// No conversation with the given id exists.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// No message with the given id exists in the conversation.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The durable store failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A blocking storage task failed to complete.
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl RelayError {
    /// Message that is safe to hand back to a client.
    ///
    /// Internal failures collapse to a generic string; the detailed error is
    /// only ever logged server-side.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Database(_) | RelayError::Task(_) => "Internal storage error".to_string(),
            other => other.to_string(),
        }
    }

    /// HTTP status used when the error surfaces through the REST API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidPayload(_) | RelayError::InvalidUserId(_) => StatusCode::BAD_REQUEST,
            RelayError::ConversationNotFound(_) | RelayError::MessageNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RelayError::Database(_) | RelayError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(e: tokio::task::JoinError) -> Self {
        RelayError::Task(e.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.client_message() }))).into_response()
    }
}
