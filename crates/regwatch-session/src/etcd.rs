//! etcd-backed coordination session.
//!
//! The session maps onto an etcd lease: a node is a key written with the
//! lease attached, so it disappears when the lease does. A background task
//! keeps the lease alive and translates what it observes into
//! [`SessionEvent`]s:
//!
//! ```text
//! keepalive ok          -> (Reconnected if previously Suspended)
//! keepalive failed      -> Suspended
//! ttl == 0 / ttl passed -> Expired, then a fresh lease -> Connected
//! ```
//!
//! Creates and updates run as transactions guarded on the key's create
//! revision, so a create never overwrites and an update never resurrects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    Txn, TxnOp,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use regwatch_core::{Credentials, SessionId};

use crate::error::{SessionError, SessionResult};
use crate::session::{CoordinationSession, CreateOutcome, NodeStat, SessionEvent, WriteOutcome};

/// A coordination session backed by an etcd cluster.
pub struct EtcdSession {
    shared: Arc<Shared>,
}

struct Shared {
    endpoints: Vec<String>,
    ttl: Duration,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct Inner {
    client: Option<Client>,
    lease: Option<i64>,
    credentials: Option<Credentials>,
    suspended: bool,
    closed: bool,
    keepalive: Option<JoinHandle<()>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl EtcdSession {
    /// Create an unconnected session. `ttl` is the lease TTL, i.e. how long
    /// the cluster keeps our nodes after we stop heartbeating.
    pub fn new(endpoints: Vec<String>, ttl: Duration, connect_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                endpoints,
                ttl,
                connect_timeout,
                inner: Mutex::new(Inner::default()),
                events,
            }),
        }
    }

    fn handle(&self) -> SessionResult<(Client, i64)> {
        let inner = self.shared.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        let Some(client) = inner.client.clone() else {
            return Err(SessionError::NotConnected);
        };
        if inner.suspended {
            return Err(SessionError::NotConnected);
        }
        let Some(lease) = inner.lease else {
            return Err(SessionError::SessionExpired);
        };
        Ok((client, lease))
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

fn map_error(err: etcd_client::Error) -> SessionError {
    match &err {
        etcd_client::Error::GRpcStatus(status) => classify_status(status.message(), &err),
        _ => SessionError::ConnectionLoss(err.to_string()),
    }
}

/// Sort an error status returned by the cluster by its message.
fn classify_status(message: &str, err: &dyn std::fmt::Display) -> SessionError {
    if message.contains("lease not found") {
        SessionError::SessionExpired
    } else if message.contains("authentication failed") || message.contains("permission denied")
    {
        SessionError::Auth(message.to_string())
    } else {
        SessionError::Backend(err.to_string())
    }
}

impl CoordinationSession for EtcdSession {
    async fn connect(&self, credentials: Option<Credentials>) -> SessionResult<()> {
        {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(SessionError::Closed);
            }
            if credentials.is_some() {
                inner.credentials = credentials;
            }
            if inner.client.is_some() && inner.lease.is_some() {
                return Ok(());
            }
        }

        let credentials = self.shared.lock().credentials.clone();
        let mut options = ConnectOptions::new().with_connect_timeout(self.shared.connect_timeout);
        if let Some(creds) = credentials {
            options = options.with_user(creds.user, creds.password);
        }

        let mut client = Client::connect(self.shared.endpoints.clone(), Some(options))
            .await
            .map_err(map_error)?;
        let lease = client
            .lease_grant(ttl_secs(self.shared.ttl), None)
            .await
            .map_err(map_error)?
            .id();

        info!(lease, endpoints = ?self.shared.endpoints, "etcd session established");

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::clone(&self.shared),
            client.clone(),
            lease,
        ));
        {
            let mut inner = self.shared.lock();
            inner.client = Some(client);
            inner.lease = Some(lease);
            inner.suspended = false;
            if let Some(previous) = inner.keepalive.replace(keepalive) {
                previous.abort();
            }
        }
        self.shared.emit(SessionEvent::Connected);
        Ok(())
    }

    fn update_credentials(&self, credentials: Option<Credentials>) {
        // Applied on the next connect; the live channel keeps its token.
        self.shared.lock().credentials = credentials;
    }

    fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().lease
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> SessionResult<CreateOutcome> {
        let (mut client, lease) = self.handle()?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                path,
                data,
                Some(PutOptions::new().with_lease(lease)),
            )]);
        let resp = client.txn(txn).await.map_err(map_error)?;
        Ok(if resp.succeeded() {
            CreateOutcome::Created
        } else {
            CreateOutcome::Exists
        })
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> SessionResult<WriteOutcome> {
        let (mut client, _) = self.handle()?;
        let current = client.get(path, None).await.map_err(map_error)?;
        let Some(kv) = current.kvs().first() else {
            return Ok(WriteOutcome::NoNode);
        };
        // Keep whichever lease the node already has.
        let mut options = PutOptions::new();
        if kv.lease() != 0 {
            options = options.with_lease(kv.lease());
        }
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                path,
                CompareOp::Equal,
                kv.create_revision(),
            )])
            .and_then(vec![TxnOp::put(path, data, Some(options))]);
        let resp = client.txn(txn).await.map_err(map_error)?;
        Ok(if resp.succeeded() {
            WriteOutcome::Applied
        } else {
            WriteOutcome::NoNode
        })
    }

    async fn delete(&self, path: &str) -> SessionResult<WriteOutcome> {
        let (mut client, _) = self.handle()?;
        let resp = client.delete(path, None).await.map_err(map_error)?;
        Ok(if resp.deleted() > 0 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::NoNode
        })
    }

    async fn exists(&self, path: &str) -> SessionResult<bool> {
        let (mut client, _) = self.handle()?;
        let resp = client.get(path, None).await.map_err(map_error)?;
        Ok(!resp.kvs().is_empty())
    }

    async fn get(&self, path: &str) -> SessionResult<Option<NodeStat>> {
        let (mut client, _) = self.handle()?;
        let resp = client.get(path, None).await.map_err(map_error)?;
        Ok(resp.kvs().first().map(|kv| NodeStat {
            data: kv.value().to_vec(),
            owner: (kv.lease() != 0).then(|| kv.lease()),
        }))
    }

    async fn close(&self) -> SessionResult<()> {
        let (client, lease) = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            if let Some(keepalive) = inner.keepalive.take() {
                keepalive.abort();
            }
            (inner.client.take(), inner.lease.take())
        };

        if let (Some(mut client), Some(lease)) = (client, lease) {
            if let Err(e) = client.lease_revoke(lease).await {
                // The lease will still lapse after its TTL.
                warn!(lease, error = %e, "failed to revoke etcd lease on close");
            }
        }
        self.shared.emit(SessionEvent::Closed);
        Ok(())
    }
}

enum Beat {
    Alive,
    LeaseGone,
    Lost(String),
}

async fn beat(
    client: &mut Client,
    lease: i64,
    channel: &mut Option<(LeaseKeeper, LeaseKeepAliveStream)>,
) -> Beat {
    if channel.is_none() {
        match client.lease_keep_alive(lease).await {
            Ok(pair) => *channel = Some(pair),
            Err(e) => {
                return match map_error(e) {
                    SessionError::SessionExpired => Beat::LeaseGone,
                    other => Beat::Lost(other.to_string()),
                };
            }
        }
    }
    let Some((keeper, stream)) = channel.as_mut() else {
        return Beat::Lost("keepalive channel unavailable".to_string());
    };
    if let Err(e) = keeper.keep_alive().await {
        return Beat::Lost(e.to_string());
    }
    match stream.message().await {
        Ok(Some(resp)) if resp.ttl() > 0 => Beat::Alive,
        Ok(Some(_)) => Beat::LeaseGone,
        Ok(None) => Beat::Lost("keepalive stream closed".to_string()),
        Err(e) => Beat::Lost(e.to_string()),
    }
}

/// Heartbeat the lease until the session is closed.
async fn keepalive_loop(shared: Arc<Shared>, mut client: Client, lease: i64) {
    let period = (shared.ttl / 3).max(Duration::from_millis(500));
    let mut lease = Some(lease);
    let mut channel = None;
    let mut last_ok = Instant::now();

    loop {
        tokio::time::sleep(period).await;
        if shared.lock().closed {
            return;
        }

        let Some(current) = lease else {
            // Expired earlier: try to open a fresh session.
            match client.lease_grant(ttl_secs(shared.ttl), None).await {
                Ok(resp) => {
                    let id = resp.id();
                    lease = Some(id);
                    last_ok = Instant::now();
                    {
                        let mut inner = shared.lock();
                        inner.lease = Some(id);
                        inner.suspended = false;
                    }
                    info!(lease = id, "etcd session re-established");
                    shared.emit(SessionEvent::Connected);
                }
                Err(e) => debug!(error = %e, "etcd lease grant failed, retrying"),
            }
            continue;
        };

        match beat(&mut client, current, &mut channel).await {
            Beat::Alive => {
                last_ok = Instant::now();
                let resumed = {
                    let mut inner = shared.lock();
                    std::mem::replace(&mut inner.suspended, false)
                };
                if resumed {
                    info!(lease = current, "etcd connection restored");
                    shared.emit(SessionEvent::Reconnected);
                }
            }
            Beat::LeaseGone => {
                channel = None;
                lease = None;
                expire(&shared, current);
            }
            Beat::Lost(reason) => {
                channel = None;
                let newly = {
                    let mut inner = shared.lock();
                    !std::mem::replace(&mut inner.suspended, true)
                };
                if newly {
                    warn!(lease = current, %reason, "etcd connection lost");
                    shared.emit(SessionEvent::Suspended);
                }
                if last_ok.elapsed() >= shared.ttl {
                    lease = None;
                    expire(&shared, current);
                }
            }
        }
    }
}

fn expire(shared: &Shared, lease: i64) {
    {
        let mut inner = shared.lock();
        inner.lease = None;
        inner.suspended = false;
    }
    warn!(lease, "etcd lease expired");
    shared.emit(SessionEvent::Expired);
}
