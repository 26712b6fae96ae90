//! End-to-end scenarios: scripted probes, real engine, in-memory coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regwatch_core::{
    Credentials, DEFAULT_PROBE_TIMEOUT, DaemonConfig, DesiredState, Payload, ServiceDefinition,
    SessionState,
};
use regwatch_health::ScriptedProber;
use regwatch_registry::EngineConfig;
use regwatch_session::{
    CoordinationSession, MemoryCoordinator, MemorySession, OpKind, SessionError,
};
use regwatch_supervisor::{Supervisor, SupervisorConfig, SupervisorError};

const INTERVAL: Duration = Duration::from_millis(50);

fn config() -> SupervisorConfig {
    SupervisorConfig {
        connect_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
        engine: EngineConfig {
            op_timeout: Duration::from_millis(500),
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            retry_attempts: 3,
        },
    }
}

fn service(name: &str, command: &str, path: &str, port: u16) -> ServiceDefinition {
    ServiceDefinition {
        name: name.to_string(),
        command: command.to_string(),
        interval: INTERVAL,
        timeout: DEFAULT_PROBE_TIMEOUT,
        registration_path: path.to_string(),
        port,
        hostname: "web1".to_string(),
        payload: Payload::new(),
        rise: 1,
        verify_every: 1,
    }
}

fn ssh() -> ServiceDefinition {
    let mut def = service("ssh", "check-ssh", "/services/ssh", 22);
    def.payload = Payload::parse("foo=bar, bar=foo");
    def
}

fn apache() -> ServiceDefinition {
    service("apache", "check-apache", "/services/web", 80)
}

fn services(defs: &[ServiceDefinition]) -> BTreeMap<String, ServiceDefinition> {
    defs.iter().map(|d| (d.name.clone(), d.clone())).collect()
}

struct Harness {
    coordinator: MemoryCoordinator,
    session: Arc<MemorySession>,
    prober: Arc<ScriptedProber>,
    supervisor: Supervisor<MemorySession, ScriptedProber>,
}

fn harness() -> Harness {
    let coordinator = MemoryCoordinator::new();
    let session = Arc::new(coordinator.session());
    let prober = Arc::new(ScriptedProber::new());
    let supervisor = Supervisor::new(Arc::clone(&session), Arc::clone(&prober), config());
    Harness {
        coordinator,
        session,
        prober,
        supervisor,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn ssh_scenario_registers_node_with_payload() {
    let h = harness();
    h.prober.set("check-ssh", true);

    let summary = h.supervisor.start(None, &services(&[ssh()])).await.unwrap();
    assert_eq!(summary.started, vec!["ssh".to_string()]);

    eventually(|| h.coordinator.node("/services/ssh/web1:22").is_some()).await;
    let node = h.coordinator.node("/services/ssh/web1:22").unwrap();
    assert_eq!(node.data, ssh().payload.to_bytes());
    assert_eq!(node.owner, h.session.session_id());

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn apache_failure_deregisters_without_flicker() {
    let h = harness();
    h.prober.set("check-apache", true);
    h.supervisor.start(None, &services(&[apache()])).await.unwrap();

    let path = "/services/web/web1:80";
    eventually(|| h.coordinator.node(path).is_some()).await;

    h.prober.set("check-apache", false);
    let flipped = tokio::time::Instant::now();
    eventually(|| h.coordinator.node(path).is_none()).await;
    assert!(flipped.elapsed() < INTERVAL * 4);

    // Stays gone, and nothing was created after the delete.
    tokio::time::sleep(INTERVAL * 3).await;
    assert!(h.coordinator.node(path).is_none());
    let ops: Vec<OpKind> = h
        .coordinator
        .ops()
        .into_iter()
        .filter(|op| op.path == path && matches!(op.kind, OpKind::Create | OpKind::Delete))
        .map(|op| op.kind)
        .collect();
    let first_delete = ops.iter().position(|k| *k == OpKind::Delete).unwrap();
    assert!(ops[first_delete..].iter().all(|k| *k == OpKind::Delete));

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn broken_probe_does_not_affect_other_services() {
    let h = harness();
    h.prober.set("check-ssh", true);
    // "check-broken" is unknown to the prober: command not found.
    let broken = service("broken", "check-broken", "/services/broken", 9999);

    h.supervisor.start(None, &services(&[ssh(), broken])).await.unwrap();

    eventually(|| h.coordinator.node("/services/ssh/web1:22").is_some()).await;
    assert!(h.coordinator.node("/services/broken/web1:9999").is_none());

    let status = h.supervisor.status().await;
    assert_eq!(status.session, SessionState::Connected);
    let broken = status.watches.iter().find(|w| w.service == "broken").unwrap();
    assert_eq!(broken.desired, DesiredState::Down);
    assert!(!broken.last_probe.as_ref().unwrap().success);
    assert!(status.stalled.is_empty());

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_reports_watches_that_died() {
    let h = harness();
    h.prober.set("check-ssh", true);
    h.prober.crash("check-crashing");
    let crashing = service("crashing", "check-crashing", "/services/crashing", 7000);

    h.supervisor.start(None, &services(&[ssh(), crashing])).await.unwrap();
    eventually(|| h.coordinator.node("/services/ssh/web1:22").is_some()).await;

    let mut stalled = Vec::new();
    for _ in 0..300 {
        stalled = h.supervisor.status().await.stalled;
        if !stalled.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stalled, vec!["crashing".to_string()]);
    assert!(h.coordinator.node("/services/crashing/web1:7000").is_none());

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn reload_reconciles_watch_set() {
    let h = harness();
    h.prober.set("check-ssh", true);
    h.prober.set("check-apache", true);
    h.prober.set("check-memcache", true);
    h.supervisor
        .start(None, &services(&[ssh(), apache()]))
        .await
        .unwrap();
    eventually(|| h.coordinator.paths().len() == 2).await;

    // apache removed, ssh moved to another port, memcache added.
    let mut moved = ssh();
    moved.port = 2222;
    let memcache = service("memcache", "check-memcache", "/services/mc", 11211);
    let summary = h
        .supervisor
        .apply(&services(&[moved, memcache]))
        .await;

    assert_eq!(summary.stopped, vec!["apache".to_string()]);
    assert_eq!(summary.replaced, vec!["ssh".to_string()]);
    assert_eq!(summary.started, vec!["memcache".to_string()]);

    assert!(h.coordinator.node("/services/web/web1:80").is_none());
    assert!(h.coordinator.node("/services/ssh/web1:22").is_none());
    eventually(|| {
        h.coordinator.node("/services/ssh/web1:2222").is_some()
            && h.coordinator.node("/services/mc/web1:11211").is_some()
    })
    .await;
    assert_eq!(
        h.supervisor.services().await,
        vec!["memcache".to_string(), "ssh".to_string()]
    );

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn reload_rewrites_payload_in_place() {
    let h = harness();
    h.prober.set("check-ssh", true);
    h.supervisor.start(None, &services(&[ssh()])).await.unwrap();
    let path = "/services/ssh/web1:22";
    eventually(|| h.coordinator.node(path).is_some()).await;

    let mut updated = ssh();
    updated.payload = Payload::parse(r#"{"weight": 10}"#);
    let summary = h.supervisor.apply(&services(&[updated.clone()])).await;
    assert_eq!(summary.reconfigured, vec!["ssh".to_string()]);

    let expected = updated.payload.to_bytes();
    eventually(|| h.coordinator.node(path).is_some_and(|n| n.data == expected)).await;
    assert_eq!(h.coordinator.count_ops(OpKind::Delete, path), 0);

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn reload_with_same_config_changes_nothing() {
    let h = harness();
    h.prober.set("check-ssh", true);
    h.supervisor.start(None, &services(&[ssh()])).await.unwrap();

    let summary = h.supervisor.apply(&services(&[ssh()])).await;
    assert!(summary.is_empty());

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn reload_forwards_credentials() {
    let creds = Credentials {
        user: "watcher".to_string(),
        password: "secret".to_string(),
    };
    let h = harness();
    h.prober.set("check-ssh", true);
    h.supervisor.start(None, &services(&[ssh()])).await.unwrap();

    let config = DaemonConfig {
        auth: Some(creds),
        coordination: Default::default(),
        engine: Default::default(),
        services: services(&[ssh()]),
    };
    let summary = h.supervisor.reload(&config).await;
    assert!(summary.is_empty());

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn expiry_restores_registrations() {
    let h = harness();
    h.prober.set("check-ssh", true);
    h.supervisor.start(None, &services(&[ssh()])).await.unwrap();
    let path = "/services/ssh/web1:22";
    eventually(|| h.coordinator.node(path).is_some()).await;

    h.session.expire();
    eventually(|| h.supervisor.engine().session_state() == SessionState::Expired).await;
    assert!(h.coordinator.node(path).is_none());

    h.session.restore();
    eventually(|| h.coordinator.node(path).is_some()).await;
    assert_eq!(h.coordinator.node(path).unwrap().owner, h.session.session_id());

    h.supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_deregisters_and_closes_session() {
    let h = harness();
    h.prober.set("check-ssh", true);
    h.prober.set("check-apache", true);
    h.supervisor
        .start(None, &services(&[ssh(), apache()]))
        .await
        .unwrap();
    eventually(|| h.coordinator.paths().len() == 2).await;

    let outstanding = h.supervisor.shutdown().await.unwrap();
    assert!(outstanding.is_empty());
    assert!(h.coordinator.paths().is_empty());
    assert_eq!(h.coordinator.count_ops(OpKind::Delete, "/services/ssh/web1:22"), 1);
    assert!(h.session.session_id().is_none());
    assert!(h.supervisor.services().await.is_empty());
}

#[tokio::test]
async fn rejected_credentials_fail_startup() {
    let coordinator = MemoryCoordinator::with_credentials(Credentials {
        user: "watcher".to_string(),
        password: "secret".to_string(),
    });
    let session = Arc::new(coordinator.session());
    let supervisor = Supervisor::new(session, Arc::new(ScriptedProber::new()), config());

    let err = supervisor.start(None, &services(&[ssh()])).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Connect(SessionError::Auth(_))));
    assert!(supervisor.services().await.is_empty());
}
