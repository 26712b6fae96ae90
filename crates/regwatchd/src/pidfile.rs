//! PID file handling.
//!
//! The file holds the daemon's PID followed by a newline. A file naming a
//! live process blocks startup; one naming a dead process is replaced.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};

/// An owned PID file, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current PID to `path`.
    pub fn create(path: &Path) -> DaemonResult<Self> {
        let io_err = |source| DaemonError::Io {
            path: path.to_path_buf(),
            source,
        };

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id()).map_err(io_err)?;
                    file.sync_all().map_err(io_err)?;
                    debug!(path = %path.display(), "pid file written");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = read_pid(path)? {
                        if process_alive(pid) {
                            return Err(DaemonError::AlreadyRunning {
                                pid,
                                path: path.to_path_buf(),
                            });
                        }
                        warn!(path = %path.display(), pid, "replacing stale pid file");
                    }
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "pid file recreated concurrently",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}

/// Read the PID stored at `path`. A missing or empty file yields `None`.
pub fn read_pid(path: &Path) -> DaemonResult<Option<i32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DaemonError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    // Zero and negative values address process groups in kill(2).
    match trimmed.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(DaemonError::InvalidPid {
            path: path.to_path_buf(),
            content: trimmed.to_string(),
        }),
    }
}

/// Whether a process with this PID exists.
pub fn process_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: it exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: i32, signal: libc::c_int) -> DaemonResult<()> {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(DaemonError::Signal {
            pid,
            source: io::Error::last_os_error(),
        })
    }
}
