//! Registration engine — reconciles node paths against the session.
//!
//! Each node path gets a slot holding its record and a generation
//! counter. Submitting an intent bumps the generation and makes sure a
//! driver task is running for the path; the driver applies the newest
//! intent, retries transient failures, and exits once nothing is pending
//! or the session is disrupted. Session events arrive on a broadcast
//! channel consumed by one background task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Notify, RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};

use regwatch_core::{
    ActualState, DesiredState, EngineSettings, IntentSink, Payload, ReconcileRequest, SessionId,
    SessionState, epoch_secs,
};
use regwatch_session::{
    CoordinationSession, CreateOutcome, SessionError, SessionEvent, SessionResult, WriteOutcome,
};

use crate::backoff::Backoff;
use crate::error::{EngineError, EngineResult};
use crate::record::RegistrationRecord;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Timeout applied to every coordination call.
    pub op_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Attempts per intent before reporting a persistent error.
    pub retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            op_timeout: settings.op_timeout,
            retry_initial: settings.retry_initial,
            retry_max: settings.retry_max,
            retry_attempts: settings.retry_attempts.max(1),
        }
    }
}

/// How a reconcile request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    /// The intent was applied and confirmed.
    Applied,
    /// The session is not connected; the intent is pending and will be
    /// applied on the next resync.
    Queued,
    /// A newer intent for the same path arrived first.
    Superseded,
}

#[derive(Debug, Clone)]
enum Outcome {
    Applied,
    Queued,
    Failed(EngineError),
}

#[derive(Debug, Clone)]
struct Settled {
    generation: u64,
    outcome: Outcome,
}

struct SlotState {
    record: RegistrationRecord,
    generation: u64,
    /// Payload known to be written in a node we own.
    synced: Option<Payload>,
    driver_running: bool,
}

struct Slot {
    path: String,
    state: Mutex<SlotState>,
    settled: watch::Sender<Settled>,
    /// Cuts a retry backoff short when a newer intent arrives.
    wake: Notify,
}

impl Slot {
    fn new(path: &str, desired: DesiredState, payload: Payload) -> Self {
        let (settled, _) = watch::channel(Settled {
            generation: 0,
            outcome: Outcome::Applied,
        });
        Self {
            path: path.to_string(),
            state: Mutex::new(SlotState {
                record: RegistrationRecord::new(path, desired, payload),
                generation: 0,
                synced: None,
                driver_running: false,
            }),
            settled,
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn settle(&self, generation: u64, outcome: Outcome) {
        self.settled.send_modify(|settled| {
            if generation >= settled.generation {
                *settled = Settled {
                    generation,
                    outcome,
                };
            }
        });
    }

    async fn wait_settled(&self, generation: u64) -> Settled {
        let mut rx = self.settled.subscribe();
        match rx.wait_for(|s| s.generation >= generation).await {
            Ok(settled) => settled.clone(),
            // The sender lives as long as the slot, which we hold.
            Err(_) => Settled {
                generation,
                outcome: Outcome::Failed(EngineError::Closed),
            },
        }
    }
}

/// What an apply confirmed about the remote node.
struct Confirmed {
    actual: ActualState,
    owner: Option<SessionId>,
    synced: Option<Payload>,
}

enum Attempt {
    Done(Confirmed),
    Superseded,
    Interrupted,
    Exhausted(EngineError),
}

struct Inner<S> {
    session: Arc<S>,
    config: EngineConfig,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    state: watch::Sender<SessionState>,
    /// Bumped on every session disruption; results of calls that straddle
    /// one are not trusted.
    disruptions: AtomicU64,
}

/// Drives ephemeral registrations toward their desired state.
///
/// Cheap to clone; clones share the same engine.
pub struct RegistrationEngine<S: CoordinationSession> {
    inner: Arc<Inner<S>>,
}

impl<S: CoordinationSession> Clone for RegistrationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CoordinationSession> RegistrationEngine<S> {
    /// Create an engine bound to `session` and start consuming its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(session: Arc<S>, config: EngineConfig) -> Self {
        let events = session.subscribe();
        let initial = if session.session_id().is_some() {
            SessionState::Connected
        } else {
            SessionState::Connecting
        };
        let (state, _) = watch::channel(initial);

        let inner = Arc::new(Inner {
            session,
            config,
            slots: RwLock::new(HashMap::new()),
            state,
            disruptions: AtomicU64::new(0),
        });

        tokio::spawn(run_session_events(Arc::downgrade(&inner), events));

        Self { inner }
    }

    pub fn session(&self) -> &Arc<S> {
        &self.inner.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Record an intent and return without waiting for it to be applied.
    pub async fn submit(&self, request: ReconcileRequest) {
        enqueue(&self.inner, request).await;
    }

    /// Record an intent and wait until it is applied, queued behind a
    /// session disruption, superseded, or has exhausted its retries.
    pub async fn reconcile(&self, request: ReconcileRequest) -> EngineResult<ReconcileStatus> {
        let (slot, generation) = enqueue(&self.inner, request).await;
        resolve(&slot, generation).await
    }

    /// Submit a final DOWN for `node_path` and drop its record once the
    /// deletion is confirmed.
    ///
    /// While the session is disrupted the record stays, pending, until a
    /// resync confirms the deletion.
    pub async fn retire(&self, node_path: &str) -> EngineResult<ReconcileStatus> {
        let (slot, generation) = {
            let mut slots = self.inner.slots.write().await;
            let slot = slots
                .entry(node_path.to_string())
                .or_insert_with(|| Arc::new(Slot::new(node_path, DesiredState::Down, Payload::new())))
                .clone();
            let generation = {
                let mut st = slot.lock();
                st.generation += 1;
                st.record.desired = DesiredState::Down;
                st.record.pending = true;
                st.record.retired = true;
                st.generation
            };
            slot.wake.notify_one();
            kick(&self.inner, &slot);
            (slot, generation)
        };
        info!(path = %node_path, "retiring registration");
        resolve(&slot, generation).await
    }

    /// Drive every known path DOWN and wait up to `deadline` for the
    /// deletions. Returns the paths that could not be confirmed absent.
    pub async fn deregister_all(&self, deadline: Duration) -> Vec<String> {
        let slots: Vec<Arc<Slot>> = self.inner.slots.read().await.values().cloned().collect();

        let mut waits = Vec::with_capacity(slots.len());
        for slot in &slots {
            let generation = {
                let mut st = slot.lock();
                st.generation += 1;
                st.record.desired = DesiredState::Down;
                st.record.pending = true;
                st.record.retired = true;
                st.generation
            };
            slot.wake.notify_one();
            kick(&self.inner, slot);
            waits.push((Arc::clone(slot), generation));
        }

        let drained = async {
            for (slot, generation) in &waits {
                slot.wait_settled(*generation).await;
            }
        };
        if tokio::time::timeout(deadline, drained).await.is_err() {
            warn!(?deadline, "deregistration deadline passed");
        }

        let mut outstanding: Vec<String> = waits
            .iter()
            .filter(|(slot, _)| slot.lock().record.actual != ActualState::Absent)
            .map(|(slot, _)| slot.path.clone())
            .collect();
        outstanding.sort();

        if outstanding.is_empty() {
            info!(count = waits.len(), "all registrations removed");
        } else {
            warn!(?outstanding, "registrations left behind");
        }
        outstanding
    }

    pub fn session_state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Wait until the engine has observed `target`.
    pub async fn wait_for_state(&self, target: SessionState) -> EngineResult<()> {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::Closed)
    }

    pub async fn record(&self, node_path: &str) -> Option<RegistrationRecord> {
        let slots = self.inner.slots.read().await;
        slots.get(node_path).map(|slot| slot.lock().record.clone())
    }

    /// Every record, sorted by path.
    pub async fn records(&self) -> Vec<RegistrationRecord> {
        let slots = self.inner.slots.read().await;
        let mut records: Vec<RegistrationRecord> =
            slots.values().map(|slot| slot.lock().record.clone()).collect();
        records.sort_by(|a, b| a.node_path.cmp(&b.node_path));
        records
    }
}

impl<S: CoordinationSession> IntentSink for RegistrationEngine<S> {
    fn submit(&self, request: ReconcileRequest) -> impl Future<Output = ()> + Send {
        RegistrationEngine::submit(self, request)
    }
}

impl<S> Inner<S> {
    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    fn disruptions(&self) -> u64 {
        self.disruptions.load(Ordering::SeqCst)
    }
}

impl<S: CoordinationSession> Inner<S> {
    async fn call<T, F>(&self, op: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

/// Record an intent under the path's slot and make sure it gets driven.
async fn enqueue<S: CoordinationSession>(
    inner: &Arc<Inner<S>>,
    request: ReconcileRequest,
) -> (Arc<Slot>, u64) {
    let ReconcileRequest {
        node_path,
        desired,
        payload,
    } = request;

    // The map lock is held while updating the slot so a retired slot can't
    // be removed between lookup and update.
    {
        let slots = inner.slots.read().await;
        if let Some(slot) = slots.get(&node_path) {
            let generation = record_intent(slot, desired, payload.clone());
            kick(inner, slot);
            return (Arc::clone(slot), generation);
        }
    }

    let mut slots = inner.slots.write().await;
    let slot = slots
        .entry(node_path.clone())
        .or_insert_with(|| Arc::new(Slot::new(&node_path, desired, payload.clone())))
        .clone();
    let generation = record_intent(&slot, desired, payload);
    kick(inner, &slot);
    (slot, generation)
}

fn record_intent(slot: &Slot, desired: DesiredState, payload: Payload) -> u64 {
    let generation = {
        let mut st = slot.lock();
        st.generation += 1;
        st.record.desired = desired;
        st.record.payload = payload;
        st.record.pending = true;
        st.record.retired = false;
        st.generation
    };
    slot.wake.notify_one();
    debug!(path = %slot.path, %desired, generation, "intent recorded");
    generation
}

/// Start a driver for `slot` if one is needed and allowed.
fn kick<S: CoordinationSession>(inner: &Arc<Inner<S>>, slot: &Arc<Slot>) {
    let mut st = slot.lock();
    if !st.record.pending || st.driver_running {
        return;
    }
    if inner.is_connected() {
        st.driver_running = true;
        tokio::spawn(drive(Arc::clone(inner), Arc::clone(slot)));
    } else {
        let generation = st.generation;
        drop(st);
        slot.settle(generation, Outcome::Queued);
    }
}

async fn resolve(slot: &Slot, generation: u64) -> EngineResult<ReconcileStatus> {
    let settled = slot.wait_settled(generation).await;
    if settled.generation > generation {
        return Ok(ReconcileStatus::Superseded);
    }
    match settled.outcome {
        Outcome::Applied => Ok(ReconcileStatus::Applied),
        Outcome::Queued => Ok(ReconcileStatus::Queued),
        Outcome::Failed(err) => Err(err),
    }
}

/// Apply the newest intent for one path until nothing is pending.
///
/// An intent that exhausts its retries stays with the driver, which tries
/// again every `retry_max` for as long as the session is connected.
async fn drive<S: CoordinationSession>(inner: Arc<Inner<S>>, slot: Arc<Slot>) {
    // Paces retries after disruption errors that no session event follows.
    let mut interruptions = Backoff::new(inner.config.retry_initial, inner.config.retry_max);
    let mut interrupted: u32 = 0;

    loop {
        let (generation, desired, payload) = {
            let mut st = slot.lock();
            if !st.record.pending {
                st.driver_running = false;
                return;
            }
            if !inner.is_connected() {
                st.driver_running = false;
                let generation = st.generation;
                drop(st);
                debug!(path = %slot.path, "session not connected, intent queued");
                slot.settle(generation, Outcome::Queued);
                return;
            }
            (st.generation, st.record.desired, st.record.payload.clone())
        };

        let epoch = inner.disruptions();
        match apply_with_retries(&inner, &slot, generation, desired, &payload).await {
            Attempt::Done(confirmed) => {
                interruptions = Backoff::new(inner.config.retry_initial, inner.config.retry_max);
                interrupted = 0;
                let retire = {
                    let mut st = slot.lock();
                    if inner.disruptions() == epoch {
                        st.record.actual = confirmed.actual;
                        st.record.owner = confirmed.owner;
                        st.synced = confirmed.synced;
                    }
                    st.record.last_sync_error = None;
                    st.record.consecutive_failures = 0;
                    if st.generation == generation {
                        st.record.pending = false;
                    }
                    st.generation == generation && st.record.retired
                };
                if generation == slot.generation() {
                    slot.settle(generation, Outcome::Applied);
                }
                if retire && remove_retired(&inner, &slot, generation).await {
                    return;
                }
            }
            Attempt::Superseded => {
                debug!(path = %slot.path, generation, "intent superseded");
            }
            Attempt::Interrupted => {
                interrupted = interrupted.saturating_add(1);
                if interrupted == inner.config.retry_attempts {
                    error!(
                        path = %slot.path,
                        attempts = interrupted,
                        "session keeps failing calls without reporting a disruption"
                    );
                }
                // Give the session event a chance to land before re-checking.
                let delay = interruptions.next_delay();
                let mut state = inner.state.subscribe();
                let _ = tokio::time::timeout(delay, state.wait_for(|s| !s.is_connected())).await;
            }
            Attempt::Exhausted(err) => {
                {
                    let mut st = slot.lock();
                    if st.generation != generation {
                        continue;
                    }
                    st.record.actual = ActualState::Unknown;
                }
                error!(path = %slot.path, error = %err, "registration failed, intent kept pending");
                slot.settle(generation, Outcome::Failed(err));

                let mut state = inner.state.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.retry_max) => {}
                    _ = slot.wake.notified() => {}
                    _ = state.wait_for(|s| !s.is_connected()) => {}
                }
            }
        }
    }
}

/// Drop a retired slot whose DOWN was confirmed. Returns whether it was
/// removed; a newer intent revives it instead.
async fn remove_retired<S: CoordinationSession>(
    inner: &Arc<Inner<S>>,
    slot: &Arc<Slot>,
    generation: u64,
) -> bool {
    let mut slots = inner.slots.write().await;
    let mut st = slot.lock();
    if st.generation != generation || !st.record.retired || st.record.pending {
        return false;
    }
    st.driver_running = false;
    drop(st);
    slots.remove(&slot.path);
    debug!(path = %slot.path, "retired record dropped");
    true
}

async fn apply_with_retries<S: CoordinationSession>(
    inner: &Inner<S>,
    slot: &Slot,
    generation: u64,
    desired: DesiredState,
    payload: &Payload,
) -> Attempt {
    let mut backoff = Backoff::new(inner.config.retry_initial, inner.config.retry_max);
    let mut attempt = 0;

    loop {
        attempt += 1;
        slot.lock().record.last_sync_attempt = Some(epoch_secs());

        let result = match desired {
            DesiredState::Up => apply_up(inner, slot, payload).await,
            DesiredState::Down => apply_down(inner, slot).await,
        };

        let err = match result {
            Ok(confirmed) => return Attempt::Done(confirmed),
            Err(err) => err,
        };

        {
            let mut st = slot.lock();
            st.record.last_sync_error = Some(err.to_string());
            st.record.consecutive_failures = st.record.consecutive_failures.saturating_add(1);
        }

        if err.is_disruption() {
            debug!(path = %slot.path, error = %err, "session disrupted mid-reconcile");
            return Attempt::Interrupted;
        }
        if slot.generation() != generation {
            return Attempt::Superseded;
        }
        if attempt >= inner.config.retry_attempts {
            return Attempt::Exhausted(EngineError::RetriesExhausted {
                path: slot.path.clone(),
                attempts: attempt,
                last: err,
            });
        }

        let delay = backoff.next_delay();
        warn!(path = %slot.path, %desired, attempt, error = %err, ?delay, "coordination call failed, retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = slot.wake.notified() => {}
        }
        if slot.generation() != generation {
            return Attempt::Superseded;
        }
    }
}

async fn apply_up<S: CoordinationSession>(
    inner: &Inner<S>,
    slot: &Slot,
    payload: &Payload,
) -> SessionResult<Confirmed> {
    let path = slot.path.as_str();
    let data = payload.to_bytes();
    let me = inner.session.session_id();
    let (actual, owner, synced) = {
        let st = slot.lock();
        (st.record.actual, st.record.owner, st.synced.clone())
    };

    let ours = |owner: Option<SessionId>| owner.is_some() && owner == me;

    if actual == ActualState::Present {
        if !ours(owner) {
            // Someone else's node; it satisfies UP for as long as it exists.
            if inner.call(inner.session.exists(path)).await? {
                return Ok(Confirmed {
                    actual: ActualState::Present,
                    owner,
                    synced: None,
                });
            }
        } else if synced.as_ref() != Some(payload) {
            if inner.call(inner.session.set_data(path, &data)).await? == WriteOutcome::Applied {
                info!(path, "registration payload updated");
                return Ok(present(me, payload));
            }
        } else if inner.call(inner.session.exists(path)).await? {
            return Ok(present(me, payload));
        } else {
            warn!(path, "registration vanished, recreating");
        }
    }

    match inner.call(inner.session.create_ephemeral(path, &data)).await? {
        CreateOutcome::Created => {
            info!(path, "registered");
            Ok(present(me, payload))
        }
        CreateOutcome::Exists => match inner.call(inner.session.get(path)).await? {
            None => Err(SessionError::Backend(
                "node removed while registering".to_string(),
            )),
            Some(stat) if ours(stat.owner) => {
                if stat.data != data {
                    let written = inner.call(inner.session.set_data(path, &data)).await?;
                    if written == WriteOutcome::NoNode {
                        return Err(SessionError::Backend(
                            "node removed while updating".to_string(),
                        ));
                    }
                    info!(path, "registration payload updated");
                }
                Ok(present(me, payload))
            }
            Some(stat) => {
                info!(path, owner = ?stat.owner, "node held by another session, leaving it in place");
                Ok(Confirmed {
                    actual: ActualState::Present,
                    owner: stat.owner,
                    synced: None,
                })
            }
        },
    }
}

fn present(owner: Option<SessionId>, payload: &Payload) -> Confirmed {
    Confirmed {
        actual: ActualState::Present,
        owner,
        synced: Some(payload.clone()),
    }
}

async fn apply_down<S: CoordinationSession>(inner: &Inner<S>, slot: &Slot) -> SessionResult<Confirmed> {
    let path = slot.path.as_str();
    match inner.call(inner.session.delete(path)).await? {
        WriteOutcome::Applied => info!(path, "deregistered"),
        WriteOutcome::NoNode => debug!(path, "no node to remove"),
    }
    Ok(Confirmed {
        actual: ActualState::Absent,
        owner: None,
        synced: None,
    })
}

/// Consume session events until the session closes or the engine is
/// dropped.
async fn run_session_events<S: CoordinationSession>(
    inner: Weak<Inner<S>>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            Ok(SessionEvent::Connected) | Ok(SessionEvent::Reconnected) => {
                set_state(&inner, SessionState::Connected);
                resync(&inner).await;
            }
            // Records are marked before the state is published, so anyone
            // waiting on the state sees them UNKNOWN.
            Ok(SessionEvent::Suspended) => {
                mark_unknown(&inner, false).await;
                set_state(&inner, SessionState::Suspended);
            }
            Ok(SessionEvent::Expired) => {
                mark_unknown(&inner, true).await;
                set_state(&inner, SessionState::Expired);
            }
            Ok(SessionEvent::Closed) => {
                mark_unknown(&inner, true).await;
                set_state(&inner, SessionState::Closed);
                return;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "session events lagged");
                if inner.session.session_id().is_some() {
                    set_state(&inner, SessionState::Connected);
                    resync(&inner).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn set_state<S>(inner: &Inner<S>, state: SessionState) {
    let previous = inner.state.send_replace(state);
    if previous != state {
        info!(from = %previous, to = %state, "session state changed");
    }
}

/// Every record's actual state becomes UNKNOWN. On expiry the ephemeral
/// nodes are gone with the session, so ownership is forgotten too.
async fn mark_unknown<S>(inner: &Inner<S>, expired: bool) {
    inner.disruptions.fetch_add(1, Ordering::SeqCst);
    let slots = inner.slots.read().await;
    for slot in slots.values() {
        {
            let mut st = slot.lock();
            st.record.actual = ActualState::Unknown;
            if expired {
                st.record.owner = None;
                st.synced = None;
            }
        }
        slot.wake.notify_one();
    }
}

/// Re-apply every path's current desired state once.
async fn resync<S: CoordinationSession>(inner: &Arc<Inner<S>>) {
    let slots = inner.slots.read().await;
    for slot in slots.values() {
        {
            let mut st = slot.lock();
            st.generation += 1;
            st.record.pending = true;
        }
        slot.wake.notify_one();
        kick(inner, slot);
    }
    info!(paths = slots.len(), "resync started");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let settings = EngineSettings {
            retry_attempts: 0,
            ..EngineSettings::default()
        };
        let config = EngineConfig::from(&settings);
        assert_eq!(config.retry_attempts, 1);
        assert_eq!(config.op_timeout, settings.op_timeout);
    }

    #[test]
    fn settle_ignores_older_generations() {
        let slot = Slot::new("/a", DesiredState::Up, Payload::new());
        slot.settle(3, Outcome::Queued);
        slot.settle(2, Outcome::Applied);

        let settled = slot.settled.borrow().clone();
        assert_eq!(settled.generation, 3);
        assert!(matches!(settled.outcome, Outcome::Queued));
    }
}
