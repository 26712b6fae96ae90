//! Watch error types.

use thiserror::Error;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug, Error)]
pub enum WatchError {
    /// Path, hostname or port changed; the watch must be replaced.
    #[error("service {service}: node path would change from {from} to {to}")]
    IdentityChanged {
        service: String,
        from: String,
        to: String,
    },

    #[error("service {0}: watch has stopped")]
    Stopped(String),
}
