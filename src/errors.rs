use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use utoipa::ToSchema;

/// Why a terminal process did not reach the running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The web-terminal process exited during the post-spawn grace period.
    ImmediateExit(Option<i32>),
    Other(String),
}

impl fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnFailure::ImmediateExit(Some(code)) => {
                write!(f, "process exited immediately with status {code}")
            }
            SpawnFailure::ImmediateExit(None) => write!(f, "process exited immediately"),
            SpawnFailure::Other(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no available ports in range {first}-{max}")]
    PortExhausted { first: u16, max: u16 },
    #[error("terminal on port {port} failed to start: {reason}")]
    SpawnFailed { port: u16, reason: SpawnFailure },
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("no active terminal session for port {0}")]
    SessionNotFound(u16),
    #[error("tmux session \"{0}\" not found")]
    SessionGone(String),
    #[error("tmux error: {0}")]
    MultiplexerError(String),
    #[error("timeout while running {0}")]
    Timeout(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("port {0} is already tracked")]
    AlreadyTracked(u16),
    #[error("failed to fully clean up terminal on port {0}; manual check might be needed")]
    CleanupIncomplete(u16),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for SessionError {
    fn from(error: rusqlite::Error) -> Self {
        SessionError::Storage(error.to_string())
    }
}

impl SessionError {
    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::PortExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::SpawnFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::MissingBinary(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::SessionGone(_) => StatusCode::NOT_FOUND,
            SessionError::MultiplexerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Forbidden(_) => StatusCode::FORBIDDEN,
            SessionError::AlreadyTracked(_) => StatusCode::CONFLICT,
            SessionError::CleanupIncomplete(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SessionError::PortExhausted { .. } => "port_exhausted",
            SessionError::SpawnFailed { .. } => "spawn_failed",
            SessionError::MissingBinary(_) => "missing_dependency",
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::SessionGone(_) => "session_gone",
            SessionError::MultiplexerError(_) => "multiplexer_error",
            SessionError::Timeout(_) => "timeout",
            SessionError::Forbidden(_) => "forbidden",
            SessionError::AlreadyTracked(_) => "already_tracked",
            SessionError::CleanupIncomplete(_) => "cleanup_incomplete",
            SessionError::InvalidRequest(_) => "bad_request",
            SessionError::NotFound(_) => "not_found",
            SessionError::Storage(_) => "storage_error",
            SessionError::Internal(_) | SessionError::Io(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub error: String,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            success: false,
            code: self.code().to_string(),
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_injection_failures_map_to_expected_statuses() {
        assert_eq!(
            SessionError::SessionGone("cmd_wave_term_7682".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SessionError::Timeout("tmux send-keys".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SessionError::MultiplexerError("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn exhaustion_is_service_unavailable() {
        let error = SessionError::PortExhausted {
            first: 7682,
            max: 7781,
        };
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "port_exhausted");
        assert_eq!(error.to_string(), "no available ports in range 7682-7781");
    }

    #[test]
    fn spawn_failure_reason_is_readable() {
        let error = SessionError::SpawnFailed {
            port: 7690,
            reason: SpawnFailure::ImmediateExit(Some(1)),
        };
        assert_eq!(
            error.to_string(),
            "terminal on port 7690 failed to start: process exited immediately with status 1"
        );
    }
}
