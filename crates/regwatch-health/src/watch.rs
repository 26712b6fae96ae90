//! Service watch — background task that probes one service.
//!
//! Each `ServiceWatch` owns a task that runs the service's probe on a
//! fixed schedule, folds results through a [`StateTracker`] and hands
//! reconcile requests to an [`IntentSink`]. The sink never blocks on
//! coordination I/O, so a slow session can't delay the next probe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use regwatch_core::{DesiredState, IntentSink, ReconcileRequest, ServiceDefinition, ServiceName};

use crate::error::{WatchError, WatchResult};
use crate::probe::{ProbeOutcome, Prober};
use crate::tracker::StateTracker;

/// Snapshot of a watch, published after every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceWatchState {
    pub service: ServiceName,
    pub node_path: String,
    pub desired: DesiredState,
    pub last_probe: Option<ProbeOutcome>,
    pub consecutive_failures: u32,
    /// Probes run so far.
    pub ticks: u64,
}

/// Handle to a running service watch.
pub struct ServiceWatch {
    service: ServiceName,
    node_path: String,
    config_tx: watch::Sender<ServiceDefinition>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ServiceWatchState>,
    handle: JoinHandle<()>,
}

impl ServiceWatch {
    /// Start watching a service. The first probe runs immediately.
    pub fn spawn<P, S>(definition: ServiceDefinition, prober: Arc<P>, sink: Arc<S>) -> Self
    where
        P: Prober,
        S: IntentSink,
    {
        let service = definition.name.clone();
        let node_path = definition.node_path();

        let (config_tx, config_rx) = watch::channel(definition);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ServiceWatchState {
            service: service.clone(),
            node_path: node_path.clone(),
            desired: DesiredState::Down,
            last_probe: None,
            consecutive_failures: 0,
            ticks: 0,
        });

        let handle = tokio::spawn(run_watch_loop(
            config_rx,
            prober,
            sink,
            state_tx,
            shutdown_rx,
        ));

        info!(%service, path = %node_path, "service watch started");

        Self {
            service,
            node_path,
            config_tx,
            shutdown_tx,
            state_rx,
            handle,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    /// The definition currently in force.
    pub fn definition(&self) -> ServiceDefinition {
        self.config_tx.borrow().clone()
    }

    /// Apply a new definition without restarting the watch.
    ///
    /// Command, interval, timeout, payload, `rise` and `verify_every` can
    /// change in place. A definition that addresses a different node is
    /// rejected.
    pub fn reconfigure(&self, definition: ServiceDefinition) -> WatchResult<()> {
        let to = definition.node_path();
        if to != self.node_path {
            return Err(WatchError::IdentityChanged {
                service: self.service.clone(),
                from: self.node_path.clone(),
                to,
            });
        }
        if *self.config_tx.borrow() == definition {
            return Ok(());
        }
        self.config_tx
            .send(definition)
            .map_err(|_| WatchError::Stopped(self.service.clone()))
    }

    /// Latest published state.
    pub fn state(&self) -> ServiceWatchState {
        self.state_rx.borrow().clone()
    }

    /// Whether the watch task has ended, by stopping or by panicking.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the watch, waiting up to `grace` for an in-flight probe to wind
    /// down before aborting the task.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(service = %self.service, "service watch did not stop in time, aborting");
            handle.abort();
        }
        info!(service = %self.service, "service watch stopped");
    }
}

/// The probe loop for a single service.
async fn run_watch_loop<P, S>(
    mut config: watch::Receiver<ServiceDefinition>,
    prober: Arc<P>,
    sink: Arc<S>,
    state_tx: watch::Sender<ServiceWatchState>,
    mut shutdown: watch::Receiver<bool>,
) where
    P: Prober,
    S: IntentSink,
{
    let mut definition = config.borrow_and_update().clone();
    let node_path = definition.node_path();
    let mut tracker = StateTracker::new(definition.rise);
    let mut last_tick = Instant::now();
    let mut next_tick = last_tick;
    let mut ticks: u64 = 0;
    let mut since_submit: u32 = 0;

    debug!(service = %definition.name, path = %node_path, "watch loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            changed = config.changed() => {
                if changed.is_err() {
                    break;
                }
                let updated = config.borrow_and_update().clone();
                let payload_changed = updated.payload != definition.payload;
                tracker.set_rise(updated.rise);
                if updated.interval != definition.interval {
                    next_tick = tick_after(last_tick, updated.interval);
                }
                definition = updated;
                info!(service = %definition.name, "service watch reconfigured");

                // Rewrite the node now rather than at the next tick.
                if payload_changed && ticks > 0 {
                    submit(&*sink, &node_path, tracker.desired(), &definition).await;
                    since_submit = 0;
                }
                continue;
            }
            _ = shutdown.changed() => break,
        }

        last_tick = Instant::now();
        next_tick = tick_after(last_tick, definition.interval);

        let outcome = tokio::select! {
            outcome = prober.probe(&definition.command, definition.timeout) => outcome,
            _ = shutdown.changed() => break,
        };
        ticks += 1;
        since_submit = since_submit.saturating_add(1);

        let previous = tracker.desired();
        let desired = tracker.record(outcome.success);

        if outcome.success {
            debug!(service = %definition.name, duration_ms = outcome.duration_ms, "probe succeeded");
        } else {
            warn!(
                service = %definition.name,
                detail = %outcome.detail,
                failures = tracker.consecutive_failures(),
                "probe failed"
            );
        }
        if desired != previous {
            info!(service = %definition.name, path = %node_path, %desired, "desired state changed");
        }

        let verify = since_submit >= definition.verify_every.max(1);
        if ticks == 1 || desired != previous || verify {
            submit(&*sink, &node_path, desired, &definition).await;
            since_submit = 0;
        }

        state_tx.send_replace(ServiceWatchState {
            service: definition.name.clone(),
            node_path: node_path.clone(),
            desired,
            last_probe: Some(outcome),
            consecutive_failures: tracker.consecutive_failures(),
            ticks,
        });
    }

    debug!(service = %definition.name, "watch loop shutting down");
}

/// `at + interval`, saturating far in the future instead of overflowing.
fn tick_after(at: Instant, interval: Duration) -> Instant {
    at.checked_add(interval)
        .unwrap_or_else(|| at + Duration::from_secs(30 * 365 * 24 * 60 * 60))
}

async fn submit<S: IntentSink>(
    sink: &S,
    node_path: &str,
    desired: DesiredState,
    definition: &ServiceDefinition,
) {
    sink.submit(ReconcileRequest {
        node_path: node_path.to_string(),
        desired,
        payload: definition.payload.clone(),
    })
    .await;
}
