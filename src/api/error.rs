use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::{RegistryError, SessionError, SessionId};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - No session exists with this id.
    SessionNotFound(String),
    /// 409 - A client is already attached to the session.
    SessionBusy(SessionId),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 503 - The session cap has been reached.
    MaxSessionsReached,
    /// 503 - The server is shutting down.
    ShuttingDown,
    /// 500 - Failed to start the terminal (spawn error, etc.).
    SessionCreateFailed(String),
    /// 500 - Failed to write input to the terminal.
    InputSendFailed,
    /// 503 - The terminal is not reading its input fast enough.
    InputBufferFull(SessionId),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionBusy(_) => StatusCode::CONFLICT,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MaxSessionsReached => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SessionCreateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InputSendFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InputBufferFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::SessionBusy(_) => "session_busy",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::MaxSessionsReached => "max_sessions_reached",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::SessionCreateFailed(_) => "session_create_failed",
            ApiError::InputSendFailed => "input_send_failed",
            ApiError::InputBufferFull(_) => "input_buffer_full",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::SessionBusy(id) => {
                format!("Session {} already has a client attached.", id)
            }
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::MaxSessionsReached => {
                "Maximum number of sessions reached. Close one and try again.".to_string()
            }
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::SessionCreateFailed(detail) => {
                format!("Failed to start terminal: {}.", detail)
            }
            ApiError::InputSendFailed => "Failed to send input to terminal.".to_string(),
            ApiError::InputBufferFull(id) => {
                format!("Session {} is not reading its input. Try again later.", id)
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id.to_string()),
            RegistryError::MaxSessionsReached => ApiError::MaxSessionsReached,
            RegistryError::ShuttingDown => ApiError::ShuttingDown,
            RegistryError::DuplicateId(id) => {
                ApiError::InternalError(format!("session id {} already in use", id))
            }
            RegistryError::Session(e) => e.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Spawn(e) => ApiError::SessionCreateFailed(e.to_string()),
            SessionError::InvalidState { id, .. } => ApiError::SessionBusy(id),
            SessionError::Closed(id) => ApiError::SessionNotFound(id.to_string()),
            SessionError::InputOverflow { id, .. } => ApiError::InputBufferFull(id),
            SessionError::Pty(e) => {
                tracing::warn!(error = %e, "terminal write failed");
                ApiError::InputSendFailed
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
