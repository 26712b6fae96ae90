//! Domain types shared across regwatch crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Name of a configured service (the config table key).
pub type ServiceName = String;

/// Session identifier assigned by the coordination service.
pub type SessionId = i64;

// ── Service definition ────────────────────────────────────────────

/// Probe timeout used when the config doesn't set one.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(90);

/// One monitored service, as loaded from config.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub name: ServiceName,
    /// Probe command line, split on whitespace, run without a shell.
    pub command: String,
    /// Probe period.
    pub interval: Duration,
    /// Probe timeout; expiry counts as a failed probe.
    pub timeout: Duration,
    /// Registration path prefix, e.g. `/services/production/webservers`.
    pub registration_path: String,
    /// Port advertised in the node name.
    pub port: u16,
    /// Host advertised in the node name (override or local hostname).
    pub hostname: String,
    /// Metadata written as node content.
    pub payload: Payload,
    /// Consecutive successes required before registering.
    pub rise: u32,
    /// Force a verifying reconcile every N ticks even when nothing changed.
    pub verify_every: u32,
}

impl ServiceDefinition {
    /// `registration_path + "/" + hostname + ":" + port`
    pub fn node_path(&self) -> String {
        node_path(&self.registration_path, &self.hostname, self.port)
    }

    /// Whether `other` addresses a different node.
    ///
    /// Path, hostname and port can't change under a running watch; the
    /// old registration has to be retired and a new watch started.
    pub fn identity_differs(&self, other: &ServiceDefinition) -> bool {
        self.registration_path != other.registration_path
            || self.hostname != other.hostname
            || self.port != other.port
    }
}

/// Build the ephemeral node path for a host/port under a prefix.
pub fn node_path(prefix: &str, hostname: &str, port: u16) -> String {
    format!("{prefix}/{hostname}:{port}")
}

// ── Registration state ────────────────────────────────────────────

/// Registration state a service should have, per its latest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Up,
    Down,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DesiredState::Up => "UP",
            DesiredState::Down => "DOWN",
        })
    }
}

/// Best-effort mirror of a node's remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualState {
    Absent,
    Present,
    Unknown,
}

impl ActualState {
    /// Whether this actual state satisfies `desired`.
    pub fn satisfies(self, desired: DesiredState) -> bool {
        matches!(
            (self, desired),
            (ActualState::Present, DesiredState::Up) | (ActualState::Absent, DesiredState::Down)
        )
    }
}

impl fmt::Display for ActualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActualState::Absent => "ABSENT",
            ActualState::Present => "PRESENT",
            ActualState::Unknown => "UNKNOWN",
        })
    }
}

/// Process-wide coordination session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Suspended,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Expired => "EXPIRED",
            SessionState::Closed => "CLOSED",
        })
    }
}

/// Opaque credential pair forwarded to the session at connect time.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Unix timestamp (seconds).
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh() -> ServiceDefinition {
        ServiceDefinition {
            name: "ssh".to_string(),
            command: "pgrep sshd".to_string(),
            interval: Duration::from_secs(30),
            timeout: DEFAULT_PROBE_TIMEOUT,
            registration_path: "/services/ssh".to_string(),
            port: 22,
            hostname: "web1".to_string(),
            payload: Payload::new(),
            rise: 1,
            verify_every: 1,
        }
    }

    #[test]
    fn node_path_joins_host_and_port() {
        assert_eq!(ssh().node_path(), "/services/ssh/web1:22");
    }

    #[test]
    fn identity_ignores_mutable_fields() {
        let a = ssh();
        let mut b = ssh();
        b.command = "true".to_string();
        b.interval = Duration::from_secs(5);
        b.payload.insert("k", "v");
        assert!(!a.identity_differs(&b));

        b.port = 2222;
        assert!(a.identity_differs(&b));
    }

    #[test]
    fn actual_satisfies_desired() {
        assert!(ActualState::Present.satisfies(DesiredState::Up));
        assert!(ActualState::Absent.satisfies(DesiredState::Down));
        assert!(!ActualState::Unknown.satisfies(DesiredState::Up));
        assert!(!ActualState::Unknown.satisfies(DesiredState::Down));
        assert!(!ActualState::Present.satisfies(DesiredState::Down));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            user: "watcher".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("watcher"));
        assert!(!rendered.contains("hunter2"));
    }
}
