//! Foreground daemon: startup, signal handling, reload and shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use regwatch_core::{DaemonConfig, LoadedConfig};
use regwatch_health::CommandProber;
use regwatch_session::{CoordinationSession, MemoryCoordinator};
use regwatch_supervisor::{Supervisor, SupervisorConfig};

use crate::error::DaemonError;
use crate::pidfile::PidFile;

/// Coordination backend selected with `--server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Server {
    /// In-process coordinator; nothing leaves the host.
    Memory,
    /// etcd cluster endpoints (`host:port`).
    Etcd(Vec<String>),
}

impl Server {
    pub fn parse(url: &str) -> Result<Self, DaemonError> {
        let unsupported = || DaemonError::UnsupportedServer(url.to_string());

        if url == "memory://" || url == "memory" {
            return Ok(Server::Memory);
        }
        let Some(rest) = url.strip_prefix("etcd://") else {
            return Err(unsupported());
        };
        let endpoints: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        if endpoints.is_empty() || endpoints.iter().any(|e| !e.contains(':')) {
            return Err(unsupported());
        }
        Ok(Server::Etcd(endpoints))
    }
}

/// Options for `regwatchd run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: PathBuf,
    pub server: String,
    pub pid_file: Option<PathBuf>,
}

/// Load the config, logging every rejected service.
pub fn load_config(path: &Path) -> anyhow::Result<LoadedConfig> {
    let loaded = DaemonConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    for rejected in &loaded.rejected {
        error!(error = %rejected, "service rejected");
    }
    Ok(loaded)
}

/// Run the daemon until SIGTERM or SIGINT.
pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    let server = Server::parse(&options.server)?;
    let loaded = load_config(&options.config)?;
    info!(
        config = %options.config.display(),
        services = loaded.config.services.len(),
        rejected = loaded.rejected.len(),
        "configuration loaded"
    );

    let pid_file = options
        .pid_file
        .as_deref()
        .map(PidFile::create)
        .transpose()?;
    if let Some(pid_file) = &pid_file {
        info!(path = %pid_file.path().display(), pid = std::process::id(), "pid file written");
    }

    match server {
        Server::Memory => {
            warn!("using in-process coordination service; registrations are not visible outside this process");
            let coordinator = MemoryCoordinator::new();
            serve(Arc::new(coordinator.session()), &options.config, loaded.config).await
        }
        Server::Etcd(endpoints) => serve_etcd(endpoints, &options.config, loaded.config).await,
    }
}

#[cfg(feature = "etcd")]
async fn serve_etcd(
    endpoints: Vec<String>,
    config_path: &Path,
    config: DaemonConfig,
) -> anyhow::Result<()> {
    info!(?endpoints, "using etcd coordination service");
    let session = regwatch_session::EtcdSession::new(
        endpoints,
        config.coordination.session_ttl,
        config.coordination.connect_timeout,
    );
    serve(Arc::new(session), config_path, config).await
}

#[cfg(not(feature = "etcd"))]
async fn serve_etcd(
    endpoints: Vec<String>,
    _config_path: &Path,
    _config: DaemonConfig,
) -> anyhow::Result<()> {
    anyhow::bail!(
        "etcd support is not compiled in (endpoints {endpoints:?}); rebuild with --features etcd or use --server memory://"
    )
}

async fn serve<S: CoordinationSession>(
    session: Arc<S>,
    config_path: &Path,
    config: DaemonConfig,
) -> anyhow::Result<()> {
    // Installed before anything slow so an early SIGHUP can't kill us.
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let supervisor = Supervisor::new(
        session,
        Arc::new(CommandProber),
        SupervisorConfig::from(&config),
    );
    let summary = supervisor.start(config.auth.clone(), &config.services).await?;
    info!(services = summary.started.len(), "regwatch daemon running");

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(&supervisor, config_path).await;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = interrupt.recv() => {
                info!("SIGINT received");
                break;
            }
        }
    }

    let outstanding = supervisor.shutdown().await?;
    if !outstanding.is_empty() {
        warn!(?outstanding, "some registrations were not confirmed removed");
    }
    info!("regwatch daemon stopped");
    Ok(())
}

/// Re-read the config and apply it. A config that fails to parse leaves
/// the running one in force. Session and engine settings only take effect
/// on restart.
async fn reload<S: CoordinationSession, P: regwatch_health::Prober>(
    supervisor: &Supervisor<S, P>,
    config_path: &Path,
) {
    let loaded = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %format!("{e:#}"), "reload failed, keeping previous configuration");
            return;
        }
    };
    let summary = supervisor.reload(&loaded.config).await;
    info!(
        started = ?summary.started,
        stopped = ?summary.stopped,
        replaced = ?summary.replaced,
        reconfigured = ?summary.reconfigured,
        "configuration reloaded"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_server() {
        assert_eq!(Server::parse("memory://").unwrap(), Server::Memory);
    }

    #[test]
    fn parse_etcd_endpoints() {
        assert_eq!(
            Server::parse("etcd://127.0.0.1:2379").unwrap(),
            Server::Etcd(vec!["127.0.0.1:2379".to_string()])
        );
        assert_eq!(
            Server::parse("etcd://a:2379, b:2379").unwrap(),
            Server::Etcd(vec!["a:2379".to_string(), "b:2379".to_string()])
        );
    }

    #[test]
    fn reject_unsupported_servers() {
        for url in ["localhost:2181", "zk://localhost:2181", "etcd://", "etcd://hostonly"] {
            assert!(
                matches!(Server::parse(url), Err(DaemonError::UnsupportedServer(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/regwatch.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/regwatch.toml"));
    }

    #[test]
    fn load_config_keeps_good_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[services.ssh]
cmd = "pgrep sshd"
refresh = 30
service_port = 22
service_hostname = "web1"
zookeeper_path = "/services/ssh"

[services.broken]
cmd = "true"
refresh = 30
service_port = 0
zookeeper_path = "/services/broken"
"#,
        )
        .unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.config.services.len(), 1);
        assert_eq!(loaded.config.services["ssh"].node_path(), "/services/ssh/web1:22");
        assert_eq!(loaded.rejected.len(), 1);
    }
}
