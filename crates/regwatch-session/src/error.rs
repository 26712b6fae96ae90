//! Session error types.

use thiserror::Error;

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors returned by coordination-session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("session expired")]
    SessionExpired,

    #[error("operation timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session closed")]
    Closed,

    #[error("backend error: {0}")]
    Backend(String),
}

impl SessionError {
    /// Whether this error reflects a session-level disruption rather than
    /// a transient failure of one call.
    ///
    /// Disruptions pause reconciliation until the session reports it is
    /// connected again; transient errors are retried with backoff.
    pub fn is_disruption(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected | SessionError::SessionExpired | SessionError::Closed
        )
    }
}
