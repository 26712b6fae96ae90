//! Per-path registration records.

use regwatch_core::{ActualState, DesiredState, Payload, SessionId};

/// The engine's view of one node path.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    pub node_path: String,
    pub desired: DesiredState,
    /// Payload of the latest intent.
    pub payload: Payload,
    /// Best-effort mirror of the remote node. UNKNOWN after any session
    /// disruption until re-verified.
    pub actual: ActualState,
    /// The latest intent has not been confirmed applied.
    pub pending: bool,
    /// Ephemeral owner of the node, when known.
    pub owner: Option<SessionId>,
    /// Unix timestamp (seconds) of the last attempt.
    pub last_sync_attempt: Option<u64>,
    pub last_sync_error: Option<String>,
    pub consecutive_failures: u32,
    /// Drop the record once DOWN is confirmed.
    pub retired: bool,
}

impl RegistrationRecord {
    pub(crate) fn new(node_path: &str, desired: DesiredState, payload: Payload) -> Self {
        Self {
            node_path: node_path.to_string(),
            desired,
            payload,
            actual: ActualState::Unknown,
            pending: true,
            owner: None,
            last_sync_attempt: None,
            last_sync_error: None,
            consecutive_failures: 0,
            retired: false,
        }
    }

    /// Actual state matches desired and nothing is pending.
    pub fn is_converged(&self) -> bool {
        !self.pending && self.actual.satisfies(self.desired)
    }
}
