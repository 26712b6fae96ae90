//! The coordination-session interface.

use std::future::Future;

use tokio::sync::broadcast;

use regwatch_core::{Credentials, SessionId};

use crate::error::SessionResult;

/// Session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new session was established (fresh connect, or after expiry).
    Connected,
    /// The connection dropped; the session may still be alive server-side.
    Suspended,
    /// The session is gone and every ephemeral node it owned with it.
    Expired,
    /// The connection came back within the same session.
    Reconnected,
    /// The session was closed locally.
    Closed,
}

/// Outcome of an ephemeral create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A node already exists at the path (possibly from another session).
    Exists,
}

/// Outcome of a write against an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    NoNode,
}

/// A node's content and ephemeral owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStat {
    pub data: Vec<u8>,
    /// Owning session for ephemeral nodes, `None` for persistent ones.
    pub owner: Option<SessionId>,
}

/// A client session with a coordination service.
///
/// Only the registration engine issues operations against a session.
/// Every method may suspend on network I/O; callers bound each call with
/// their own timeout.
pub trait CoordinationSession: Send + Sync + 'static {
    /// Establish the session. Emits [`SessionEvent::Connected`] on success.
    fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> impl Future<Output = SessionResult<()>> + Send;

    /// Replace the credentials used for the next (re)connect.
    fn update_credentials(&self, credentials: Option<Credentials>);

    /// Current session id, if a session is established.
    fn session_id(&self) -> Option<SessionId>;

    /// Subscribe to lifecycle events. Events emitted before subscribing
    /// are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Create an ephemeral node owned by this session.
    fn create_ephemeral(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl Future<Output = SessionResult<CreateOutcome>> + Send;

    /// Replace the content of an existing node.
    fn set_data(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl Future<Output = SessionResult<WriteOutcome>> + Send;

    fn delete(&self, path: &str) -> impl Future<Output = SessionResult<WriteOutcome>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = SessionResult<bool>> + Send;

    fn get(&self, path: &str) -> impl Future<Output = SessionResult<Option<NodeStat>>> + Send;

    /// Close the session. Its ephemeral nodes are released server-side.
    fn close(&self) -> impl Future<Output = SessionResult<()>> + Send;
}
