//! Engine error types.

use thiserror::Error;

use regwatch_session::SessionError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the registration engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Transient failures persisted past the retry budget. The intent
    /// stays pending and is retried on the next submission or resync.
    #[error("{path}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        last: SessionError,
    },

    #[error("registration engine closed")]
    Closed,
}
