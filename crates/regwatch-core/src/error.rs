//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for config loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid service [{service}]: {reason}")]
    InvalidService { service: String, reason: String },

    #[error("invalid [{section}] section: {reason}")]
    InvalidSection { section: String, reason: String },

    #[error("cannot resolve local hostname: {0}")]
    Hostname(String),
}

impl ConfigError {
    pub(crate) fn service(service: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidService {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}
