//! The supervisor: managed watch set plus session lifecycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use regwatch_core::{Credentials, DaemonConfig, ServiceDefinition, SessionState};
use regwatch_health::{Prober, ServiceWatch, ServiceWatchState};
use regwatch_registry::{EngineConfig, ReconcileStatus, RegistrationEngine, RegistrationRecord};
use regwatch_session::CoordinationSession;

use crate::error::{SupervisorError, SupervisorResult};

/// Supervisor tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Startup fails if no session is established by then.
    pub connect_timeout: Duration,
    /// Deadline for stopping watches and for the final DOWN drain.
    pub shutdown_grace: Duration,
    pub engine: EngineConfig,
}

impl From<&DaemonConfig> for SupervisorConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            connect_timeout: config.coordination.connect_timeout,
            shutdown_grace: config.engine.shutdown_grace,
            engine: EngineConfig::from(&config.engine),
        }
    }
}

/// What an [`Supervisor::apply`] pass changed, by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub replaced: Vec<String>,
    pub reconfigured: Vec<String>,
}

impl ApplySummary {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.replaced.is_empty()
            && self.reconfigured.is_empty()
    }
}

/// Point-in-time view of the daemon.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub session: SessionState,
    pub watches: Vec<ServiceWatchState>,
    /// Services whose watch task ended on its own; they are no longer probed.
    pub stalled: Vec<String>,
    pub records: Vec<RegistrationRecord>,
}

/// Owns the session, the registration engine and every service watch.
pub struct Supervisor<S: CoordinationSession, P: Prober> {
    session: Arc<S>,
    engine: Arc<RegistrationEngine<S>>,
    prober: Arc<P>,
    config: SupervisorConfig,
    /// Active watches: service name → watch.
    watches: RwLock<HashMap<String, ServiceWatch>>,
}

impl<S: CoordinationSession, P: Prober> Supervisor<S, P> {
    /// Create a supervisor. Nothing runs until [`Supervisor::start`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(session: Arc<S>, prober: Arc<P>, config: SupervisorConfig) -> Self {
        let engine = Arc::new(RegistrationEngine::new(
            Arc::clone(&session),
            config.engine.clone(),
        ));
        Self {
            session,
            engine,
            prober,
            config,
            watches: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &RegistrationEngine<S> {
        &self.engine
    }

    /// Connect within the configured deadline, then start a watch per
    /// service.
    pub async fn start(
        &self,
        credentials: Option<Credentials>,
        services: &BTreeMap<String, ServiceDefinition>,
    ) -> SupervisorResult<ApplySummary> {
        let deadline = self.config.connect_timeout;
        match tokio::time::timeout(deadline, self.session.connect(credentials)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SupervisorError::Connect(e)),
            Err(_) => return Err(SupervisorError::ConnectTimeout(deadline)),
        }
        info!(session = ?self.session.session_id(), "coordination session established");

        Ok(self.apply(services).await)
    }

    /// Reconcile the running watches against `services`.
    pub async fn apply(&self, services: &BTreeMap<String, ServiceDefinition>) -> ApplySummary {
        let mut summary = ApplySummary::default();
        let mut stopped: Vec<ServiceWatch> = Vec::new();
        let mut retire: BTreeSet<String> = BTreeSet::new();

        {
            let mut watches = self.watches.write().await;

            let removed: Vec<String> = watches
                .keys()
                .filter(|name| !services.contains_key(*name))
                .cloned()
                .collect();
            for name in removed {
                if let Some(watch) = watches.remove(&name) {
                    retire.insert(watch.node_path().to_string());
                    stopped.push(watch);
                    summary.stopped.push(name);
                }
            }

            for (name, definition) in services {
                let Some(watch) = watches.get(name) else {
                    watches.insert(name.clone(), self.spawn_watch(definition));
                    summary.started.push(name.clone());
                    continue;
                };

                let current = watch.definition();
                if current.identity_differs(definition) {
                    if let Some(old) = watches.remove(name) {
                        retire.insert(old.node_path().to_string());
                        stopped.push(old);
                    }
                    watches.insert(name.clone(), self.spawn_watch(definition));
                    summary.replaced.push(name.clone());
                } else if current != *definition {
                    match watch.reconfigure(definition.clone()) {
                        Ok(()) => summary.reconfigured.push(name.clone()),
                        Err(e) => warn!(service = %name, error = %e, "failed to reconfigure watch"),
                    }
                }
            }
        }

        for watch in stopped {
            watch.stop(self.config.shutdown_grace).await;
        }

        // A path another service still advertises must not be torn down.
        for definition in services.values() {
            retire.remove(&definition.node_path());
        }
        for path in retire {
            match self.engine.retire(&path).await {
                Ok(ReconcileStatus::Queued) => {
                    info!(%path, "retirement queued until the session recovers");
                }
                Ok(_) => {}
                Err(e) => error!(%path, error = %e, "failed to retire registration"),
            }
        }

        if !summary.is_empty() {
            info!(
                started = summary.started.len(),
                stopped = summary.stopped.len(),
                replaced = summary.replaced.len(),
                reconfigured = summary.reconfigured.len(),
                "service watches updated"
            );
        }
        summary
    }

    /// Apply a reloaded configuration: credentials first, then services.
    pub async fn reload(&self, config: &DaemonConfig) -> ApplySummary {
        self.update_credentials(config.auth.clone());
        self.apply(&config.services).await
    }

    /// Forward credentials to the session; used at its next (re)connect.
    pub fn update_credentials(&self, credentials: Option<Credentials>) {
        self.session.update_credentials(credentials);
    }

    /// Names of the services currently watched, sorted.
    pub async fn services(&self) -> Vec<String> {
        let watches = self.watches.read().await;
        let mut names: Vec<String> = watches.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn status(&self) -> SupervisorStatus {
        let (mut watches, mut stalled): (Vec<ServiceWatchState>, Vec<String>) = {
            let watches = self.watches.read().await;
            let states = watches.values().map(ServiceWatch::state).collect();
            let stalled = watches
                .values()
                .filter(|watch| watch.is_finished())
                .map(|watch| watch.service().to_string())
                .collect();
            (states, stalled)
        };
        watches.sort_by(|a, b| a.service.cmp(&b.service));
        stalled.sort();
        if !stalled.is_empty() {
            error!(?stalled, "service watches are no longer running");
        }

        SupervisorStatus {
            session: self.engine.session_state(),
            watches,
            stalled,
            records: self.engine.records().await,
        }
    }

    /// Stop every watch, drive every registration DOWN within the grace
    /// period, then close the session.
    ///
    /// Returns the paths whose removal could not be confirmed; they go
    /// away with the session anyway.
    pub async fn shutdown(&self) -> SupervisorResult<Vec<String>> {
        info!("supervisor shutting down");
        let grace = self.config.shutdown_grace;

        let watches: Vec<ServiceWatch> = {
            let mut watches = self.watches.write().await;
            watches.drain().map(|(_, watch)| watch).collect()
        };
        for watch in watches {
            watch.stop(grace).await;
        }

        let outstanding = self.engine.deregister_all(grace).await;

        self.session.close().await.map_err(SupervisorError::Session)?;
        info!("coordination session closed");
        Ok(outstanding)
    }

    fn spawn_watch(&self, definition: &ServiceDefinition) -> ServiceWatch {
        ServiceWatch::spawn(
            definition.clone(),
            Arc::clone(&self.prober),
            Arc::clone(&self.engine),
        )
    }
}
