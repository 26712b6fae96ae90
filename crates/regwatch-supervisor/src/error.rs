//! Supervisor error types.

use std::time::Duration;

use thiserror::Error;

use regwatch_session::SessionError;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to connect to coordination service: {0}")]
    Connect(SessionError),

    #[error("no coordination session within {0:?}")]
    ConnectTimeout(Duration),

    #[error("coordination session error: {0}")]
    Session(SessionError),
}
