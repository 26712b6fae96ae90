//! Probe execution.
//!
//! A probe is a command line split on whitespace and run without a shell.
//! Output is discarded rather than piped so a chatty probe can never
//! block on a full pipe.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use regwatch_core::epoch_secs;

/// How a probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeDetail {
    /// The command ran to completion with this exit code.
    Exited(i32),
    /// The command was terminated by a signal.
    Signaled,
    /// The program does not exist.
    NotFound,
    /// The program exists but could not be started or waited on.
    Spawn(String),
    /// The command outlived its timeout and was killed.
    TimedOut,
    /// The command line was blank.
    EmptyCommand,
}

impl fmt::Display for ProbeDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeDetail::Exited(code) => write!(f, "exit code {code}"),
            ProbeDetail::Signaled => f.write_str("killed by signal"),
            ProbeDetail::NotFound => f.write_str("command not found"),
            ProbeDetail::Spawn(e) => write!(f, "spawn failed: {e}"),
            ProbeDetail::TimedOut => f.write_str("timed out"),
            ProbeDetail::EmptyCommand => f.write_str("empty command"),
        }
    }
}

/// Result of a single probe run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// True only for a verified exit code of zero.
    pub success: bool,
    pub duration_ms: u64,
    pub detail: ProbeDetail,
    /// Unix timestamp (seconds) at which the probe finished.
    pub finished_at: u64,
}

impl ProbeOutcome {
    fn finish(started: Instant, detail: ProbeDetail) -> Self {
        Self {
            success: detail == ProbeDetail::Exited(0),
            duration_ms: started.elapsed().as_millis() as u64,
            detail,
            finished_at: epoch_secs(),
        }
    }
}

/// Runs probe commands.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, command: &str, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Runs probes as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProber;

impl Prober for CommandProber {
    fn probe(&self, command: &str, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send {
        run(command, timeout)
    }
}

/// Run `command` to completion or until `timeout` elapses.
///
/// Never fails: every way a probe can go wrong is folded into an
/// unsuccessful [`ProbeOutcome`].
pub async fn run(command: &str, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return ProbeOutcome::finish(started, ProbeDetail::EmptyCommand);
    };

    let spawned = Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return ProbeOutcome::finish(started, ProbeDetail::NotFound);
        }
        Err(e) => return ProbeOutcome::finish(started, ProbeDetail::Spawn(e.to_string())),
    };

    let detail = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => match status.code() {
            Some(code) => ProbeDetail::Exited(code),
            None => ProbeDetail::Signaled,
        },
        Ok(Err(e)) => ProbeDetail::Spawn(e.to_string()),
        Err(_) => {
            // kill() also waits, so the child is reaped here.
            if let Err(e) = child.kill().await {
                warn!(%command, error = %e, "failed to kill timed-out probe");
            }
            ProbeDetail::TimedOut
        }
    };

    debug!(%command, %detail, elapsed_ms = started.elapsed().as_millis() as u64, "probe finished");
    ProbeOutcome::finish(started, detail)
}

/// A prober whose results are set by hand.
///
/// Commands report healthy or failing as last configured with
/// [`ScriptedProber::set`]; unknown commands report
/// [`ProbeDetail::NotFound`]. Used for tests and dry runs where spawning
/// processes is not wanted.
#[derive(Debug, Default)]
pub struct ScriptedProber {
    state: Mutex<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    healthy: HashMap<String, bool>,
    calls: HashMap<String, u64>,
    crashing: HashSet<String>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, command: &str, healthy: bool) {
        self.lock().healthy.insert(command.to_string(), healthy);
    }

    /// Make every run of `command` panic.
    pub fn crash(&self, command: &str) {
        self.lock().crashing.insert(command.to_string());
    }

    /// Number of times `command` has been probed.
    pub fn calls(&self, command: &str) -> u64 {
        self.lock().calls.get(command).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Prober for ScriptedProber {
    async fn probe(&self, command: &str, _timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        let detail = {
            let mut state = self.lock();
            *state.calls.entry(command.to_string()).or_default() += 1;
            if state.crashing.contains(command) {
                drop(state);
                panic!("scripted crash running {command:?}");
            }
            match state.healthy.get(command) {
                Some(true) => ProbeDetail::Exited(0),
                Some(false) => ProbeDetail::Exited(1),
                None => ProbeDetail::NotFound,
            }
        };
        ProbeOutcome::finish(started, detail)
    }
}
