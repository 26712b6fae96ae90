//! Daemon error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is held by running process {pid}")]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("{path}: invalid pid {content:?}")]
    InvalidPid { path: PathBuf, content: String },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("unsupported server {0:?}: expected memory:// or etcd://host:port[,host:port]")]
    UnsupportedServer(String),
}
