//! In-process coordination service.
//!
//! `MemoryCoordinator` plays the server: a flat node namespace where
//! ephemeral nodes are tied to the session that created them.
//! `MemorySession` is a client bound to it. Sessions can be suspended,
//! resumed, expired and restored on demand, and the coordinator can
//! inject transient failures and latency, so the engine's failure
//! handling can be exercised without a real cluster.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use regwatch_core::{Credentials, SessionId};

use crate::error::{SessionError, SessionResult};
use crate::session::{CoordinationSession, CreateOutcome, NodeStat, SessionEvent, WriteOutcome};

/// Operations kept in the coordinator's log; older entries are dropped.
pub const OP_LOG_CAPACITY: usize = 1024;

/// A node stored in the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNode {
    pub data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    pub owner: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    SetData,
    Delete,
    Exists,
    Get,
}

/// An operation that reached the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub kind: OpKind,
    pub path: String,
    pub session: SessionId,
}

#[derive(Debug, Default)]
struct Cluster {
    nodes: BTreeMap<String, MemoryNode>,
    last_session: SessionId,
    ops: VecDeque<OpRecord>,
    injected_failures: u32,
    silent_drops: u32,
    latency: Duration,
    required_credentials: Option<Credentials>,
}

impl Cluster {
    fn release_session(&mut self, session: SessionId) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| node.owner != Some(session));
        before - self.nodes.len()
    }
}

/// The server side of the in-process coordination service.
///
/// Cheap to clone; clones share the same namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<Cluster>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A coordinator that rejects sessions without these credentials.
    pub fn with_credentials(credentials: Credentials) -> Self {
        let coordinator = Self::new();
        coordinator.lock().required_credentials = Some(credentials);
        coordinator
    }

    /// Create a new, not yet connected, client session.
    pub fn session(&self) -> MemorySession {
        let (events, _) = broadcast::channel(64);
        MemorySession {
            cluster: self.clone(),
            state: Mutex::new(ClientState {
                status: Status::Disconnected,
                session: None,
                credentials: None,
            }),
            events,
        }
    }

    pub fn node(&self, path: &str) -> Option<MemoryNode> {
        self.lock().nodes.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    /// Plant a node directly, bypassing any session.
    pub fn insert_node(&self, path: &str, data: &[u8], owner: Option<SessionId>) {
        self.lock().nodes.insert(
            path.to_string(),
            MemoryNode {
                data: data.to_vec(),
                owner,
            },
        );
    }

    /// Remove a node directly, bypassing any session.
    pub fn remove_node(&self, path: &str) -> bool {
        self.lock().nodes.remove(path).is_some()
    }

    /// The most recent operations that reached the coordinator, oldest
    /// first. At most [`OP_LOG_CAPACITY`] are kept.
    pub fn ops(&self) -> Vec<OpRecord> {
        self.lock().ops.iter().cloned().collect()
    }

    pub fn count_ops(&self, kind: OpKind, path: &str) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| op.kind == kind && op.path == path)
            .count()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Fail the next `n` operations with a transient connection error.
    pub fn fail_next(&self, n: u32) {
        self.lock().injected_failures = n;
    }

    /// Fail the next `n` operations with [`SessionError::NotConnected`]
    /// without any session event, like a client whose connection dropped
    /// before it noticed.
    pub fn drop_next(&self, n: u32) {
        self.lock().silent_drops = n;
    }

    /// Delay every operation by `latency` before it is applied.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    fn lock(&self) -> MutexGuard<'_, Cluster> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Disconnected,
    Connected,
    Suspended,
    Expired,
    Closed,
}

#[derive(Debug)]
struct ClientState {
    status: Status,
    session: Option<SessionId>,
    credentials: Option<Credentials>,
}

/// A client session against a [`MemoryCoordinator`].
#[derive(Debug)]
pub struct MemorySession {
    cluster: MemoryCoordinator,
    state: Mutex<ClientState>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    /// Drop the connection without losing the session.
    pub fn suspend(&self) {
        let mut state = self.state();
        if state.status == Status::Connected {
            state.status = Status::Suspended;
            self.emit(SessionEvent::Suspended);
        }
    }

    /// Re-establish the connection within the same session.
    pub fn resume(&self) {
        let mut state = self.state();
        if state.status == Status::Suspended {
            state.status = Status::Connected;
            self.emit(SessionEvent::Reconnected);
        }
    }

    /// Expire the session server-side, releasing its ephemeral nodes.
    pub fn expire(&self) {
        let mut state = self.state();
        if matches!(state.status, Status::Closed | Status::Expired) {
            return;
        }
        if let Some(session) = state.session.take() {
            let released = self.cluster.lock().release_session(session);
            debug!(session, released, "memory session expired");
        }
        state.status = Status::Expired;
        self.emit(SessionEvent::Expired);
    }

    /// Establish a fresh session after expiry, as a client library would.
    pub fn restore(&self) {
        let mut state = self.state();
        if matches!(state.status, Status::Expired | Status::Disconnected) {
            state.session = Some(self.new_session_id());
            state.status = Status::Connected;
            self.emit(SessionEvent::Connected);
        }
    }

    fn new_session_id(&self) -> SessionId {
        let mut cluster = self.cluster.lock();
        cluster.last_session += 1;
        cluster.last_session
    }

    fn live_session(&self) -> SessionResult<SessionId> {
        let state = self.state();
        match (state.status, state.session) {
            (Status::Connected, Some(session)) => Ok(session),
            (Status::Expired, _) => Err(SessionError::SessionExpired),
            (Status::Closed, _) => Err(SessionError::Closed),
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn op<T, F>(&self, kind: OpKind, path: &str, apply: F) -> SessionResult<T>
    where
        F: FnOnce(&mut Cluster, SessionId) -> T + Send,
    {
        let latency = self.cluster.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let session = self.live_session()?;
        let mut cluster = self.cluster.lock();
        if cluster.silent_drops > 0 {
            cluster.silent_drops -= 1;
            return Err(SessionError::NotConnected);
        }
        if cluster.injected_failures > 0 {
            cluster.injected_failures -= 1;
            return Err(SessionError::ConnectionLoss("injected failure".to_string()));
        }
        if cluster.ops.len() == OP_LOG_CAPACITY {
            cluster.ops.pop_front();
        }
        cluster.ops.push_back(OpRecord {
            kind,
            path: path.to_string(),
            session,
        });
        Ok(apply(&mut cluster, session))
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; nobody is listening yet.
        let _ = self.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinationSession for MemorySession {
    async fn connect(&self, credentials: Option<Credentials>) -> SessionResult<()> {
        let required = self.cluster.lock().required_credentials.clone();
        if let Some(required) = required {
            if credentials.as_ref() != Some(&required) {
                return Err(SessionError::Auth("credentials rejected".to_string()));
            }
        }

        let mut state = self.state();
        state.credentials = credentials;
        match state.status {
            Status::Connected => Ok(()),
            Status::Closed => Err(SessionError::Closed),
            Status::Suspended => {
                state.status = Status::Connected;
                self.emit(SessionEvent::Reconnected);
                Ok(())
            }
            Status::Disconnected | Status::Expired => {
                state.session = Some(self.new_session_id());
                state.status = Status::Connected;
                self.emit(SessionEvent::Connected);
                Ok(())
            }
        }
    }

    fn update_credentials(&self, credentials: Option<Credentials>) {
        self.state().credentials = credentials;
    }

    fn session_id(&self) -> Option<SessionId> {
        self.state().session
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> SessionResult<CreateOutcome> {
        self.op(OpKind::Create, path, |cluster, session| {
            if cluster.nodes.contains_key(path) {
                return CreateOutcome::Exists;
            }
            cluster.nodes.insert(
                path.to_string(),
                MemoryNode {
                    data: data.to_vec(),
                    owner: Some(session),
                },
            );
            CreateOutcome::Created
        })
        .await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> SessionResult<WriteOutcome> {
        self.op(OpKind::SetData, path, |cluster, _| match cluster.nodes.get_mut(path) {
            Some(node) => {
                node.data = data.to_vec();
                WriteOutcome::Applied
            }
            None => WriteOutcome::NoNode,
        })
        .await
    }

    async fn delete(&self, path: &str) -> SessionResult<WriteOutcome> {
        self.op(OpKind::Delete, path, |cluster, _| {
            if cluster.nodes.remove(path).is_some() {
                WriteOutcome::Applied
            } else {
                WriteOutcome::NoNode
            }
        })
        .await
    }

    async fn exists(&self, path: &str) -> SessionResult<bool> {
        self.op(OpKind::Exists, path, |cluster, _| cluster.nodes.contains_key(path))
            .await
    }

    async fn get(&self, path: &str) -> SessionResult<Option<NodeStat>> {
        self.op(OpKind::Get, path, |cluster, _| {
            cluster.nodes.get(path).map(|node| NodeStat {
                data: node.data.clone(),
                owner: node.owner,
            })
        })
        .await
    }

    async fn close(&self) -> SessionResult<()> {
        let mut state = self.state();
        if state.status == Status::Closed {
            return Ok(());
        }
        if let Some(session) = state.session.take() {
            self.cluster.lock().release_session(session);
        }
        state.status = Status::Closed;
        self.emit(SessionEvent::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(coordinator: &MemoryCoordinator) -> MemorySession {
        let session = coordinator.session();
        session.connect(None).await.unwrap();
        session
    }

    #[tokio::test]
    async fn create_is_ephemeral_and_reports_exists() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;

        let first = session.create_ephemeral("/services/ssh/web1:22", b"{}").await.unwrap();
        let second = session.create_ephemeral("/services/ssh/web1:22", b"{}").await.unwrap();
        assert_eq!(first, CreateOutcome::Created);
        assert_eq!(second, CreateOutcome::Exists);

        let node = coordinator.node("/services/ssh/web1:22").unwrap();
        assert_eq!(node.owner, session.session_id());
    }

    #[tokio::test]
    async fn delete_and_set_report_missing_nodes() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;

        assert_eq!(session.delete("/missing").await.unwrap(), WriteOutcome::NoNode);
        assert_eq!(session.set_data("/missing", b"x").await.unwrap(), WriteOutcome::NoNode);
        assert!(!session.exists("/missing").await.unwrap());
        assert_eq!(session.get("/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expiry_releases_only_own_ephemerals() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        coordinator.insert_node("/services/other/web2:80", b"{}", Some(999));
        session.create_ephemeral("/services/ssh/web1:22", b"{}").await.unwrap();

        let mut events = session.subscribe();
        session.expire();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert_eq!(coordinator.paths(), vec!["/services/other/web2:80".to_string()]);
        assert_eq!(
            session.exists("/services/ssh/web1:22").await,
            Err(SessionError::SessionExpired)
        );

        let old = session.session_id();
        session.restore();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        assert_ne!(session.session_id(), old);
        assert!(session.session_id().is_some());
    }

    #[tokio::test]
    async fn suspend_blocks_ops_and_resume_keeps_session() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        let id = session.session_id();
        let mut events = session.subscribe();

        session.suspend();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Suspended);
        assert_eq!(session.exists("/a").await, Err(SessionError::NotConnected));

        session.resume();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Reconnected);
        assert_eq!(session.session_id(), id);
        assert!(!session.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        coordinator.fail_next(2);

        for _ in 0..2 {
            let err = session.exists("/a").await.unwrap_err();
            assert!(!err.is_disruption());
        }
        assert!(!session.exists("/a").await.unwrap());
        assert_eq!(coordinator.count_ops(OpKind::Exists, "/a"), 1);
    }

    #[tokio::test]
    async fn dropped_operations_look_disconnected_without_events() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        let mut events = session.subscribe();
        coordinator.drop_next(1);

        let err = session.exists("/a").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(events.try_recv().is_err());
        assert!(!session.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn op_log_keeps_only_recent_operations() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;

        for _ in 0..OP_LOG_CAPACITY {
            session.exists("/old").await.unwrap();
        }
        for _ in 0..10 {
            session.exists("/new").await.unwrap();
        }

        let ops = coordinator.ops();
        assert_eq!(ops.len(), OP_LOG_CAPACITY);
        assert_eq!(coordinator.count_ops(OpKind::Exists, "/new"), 10);
        assert_eq!(coordinator.count_ops(OpKind::Exists, "/old"), OP_LOG_CAPACITY - 10);
        assert_eq!(ops.last().unwrap().path, "/new");
    }

    #[tokio::test]
    async fn close_releases_nodes() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        session.create_ephemeral("/a", b"{}").await.unwrap();

        session.close().await.unwrap();
        assert!(coordinator.paths().is_empty());
        assert_eq!(session.exists("/a").await, Err(SessionError::Closed));
        assert_eq!(session.connect(None).await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn credentials_are_checked_at_connect() {
        let creds = Credentials {
            user: "watcher".to_string(),
            password: "secret".to_string(),
        };
        let coordinator = MemoryCoordinator::with_credentials(creds.clone());

        let session = coordinator.session();
        assert!(matches!(session.connect(None).await, Err(SessionError::Auth(_))));
        session.connect(Some(creds)).await.unwrap();
        assert!(session.session_id().is_some());
    }
}
