//! Error kinds surfaced by the messaging core.
//!
//! Every failure is scoped to one user, connection or message; none of them
//! is fatal to the process.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::presence::PresenceStatus;
use crate::registry::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The connection died mid-send. Recovered locally by queueing.
    #[error("transport unavailable for connection {connection_id}")]
    TransportUnavailable { connection_id: ConnectionId },

    /// The registry was asked about a connection it does not know.
    #[error("registry inconsistency: {0}")]
    RegistryInconsistency(String),

    /// The user's notification queue holds too many unacknowledged entries.
    #[error("notification queue for {user_id} is full ({capacity} unacknowledged entries)")]
    QueueOverflow { user_id: String, capacity: usize },

    /// A durable write or read against the persistence collaborator failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid presence transition from {from} to {to}")]
    InvalidTransition {
        from: PresenceStatus,
        to: PresenceStatus,
    },

    /// Online and away need at least one live connection.
    #[error("{user_id} has no live connection")]
    NotConnected { user_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("{user_id} is not a participant of thread {thread_id}")]
    NotParticipant { user_id: String, thread_id: String },

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Short machine-readable kind, used in API error bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::TransportUnavailable { .. } => "transport_unavailable",
            CoreError::RegistryInconsistency(_) => "registry_inconsistency",
            CoreError::QueueOverflow { .. } => "queue_overflow",
            CoreError::PersistenceFailure(_) => "persistence_failure",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::NotConnected { .. } => "not_connected",
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::PayloadTooLarge(_) => "payload_too_large",
            CoreError::NotParticipant { .. } => "not_participant",
            CoreError::NotFound(_) => "not_found",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::TransportUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::RegistryInconsistency(_) => StatusCode::CONFLICT,
            CoreError::QueueOverflow { .. } => StatusCode::INSUFFICIENT_STORAGE,
            CoreError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::NotConnected { .. } => StatusCode::CONFLICT,
            CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::NotParticipant { .. } => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::PersistenceFailure(format!("payload encoding: {err}"))
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::PersistenceFailure(format!("blocking task failed: {err}"))
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
