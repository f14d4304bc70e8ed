//! Error types for the live voice session

use crate::models::SessionState;
use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Microphone permission or device failure
    #[error("Microphone unavailable: {0}")]
    CaptureUnavailable(String),

    /// Channel-level failure reported by the remote connection
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Session is not active (state: {0})")]
    NotActive(SessionState),

    #[error("Malformed audio payload: {0}")]
    MalformedAudio(String),
}

impl SessionError {
    /// Errors after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::CaptureUnavailable(_) | SessionError::Transport(_)
        )
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::MalformedAudio(err.to_string())
    }
}
