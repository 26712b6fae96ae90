//! regwatch.toml configuration parser.
//!
//! Each `[services.<name>]` table is validated on its own: a malformed
//! service is rejected with a [`ConfigError::InvalidService`] while the
//! rest of the file still loads. Only an unreadable or unparsable file,
//! or a bad daemon-level section, fails the whole load.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::duration;
use crate::error::{ConfigError, ConfigResult};
use crate::payload::Payload;
use crate::types::{Credentials, DEFAULT_PROBE_TIMEOUT, ServiceDefinition};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/regwatch/config.toml";

/// Upper bound for a service's probe interval and timeout.
pub const MAX_SERVICE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Credentials section, forwarded opaquely to the coordination session.
pub type AuthConfig = Credentials;

/// Fully validated daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub auth: Option<AuthConfig>,
    pub coordination: CoordinationConfig,
    pub engine: EngineSettings,
    pub services: BTreeMap<String, ServiceDefinition>,
}

/// Result of loading a config file: the usable part plus rejected services.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: DaemonConfig,
    pub rejected: Vec<ConfigError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Startup fails if no session is established within this window.
    #[serde(deserialize_with = "duration::deserialize")]
    pub connect_timeout: Duration,
    /// Session lifetime without keep-alives (lease TTL for etcd).
    #[serde(deserialize_with = "duration::deserialize")]
    pub session_ttl: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            session_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Timeout for each individual coordination call.
    #[serde(deserialize_with = "duration::deserialize")]
    pub op_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_initial: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_max: Duration,
    pub retry_attempts: u32,
    /// Deadline for the final de-registration pass at shutdown.
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(5),
            retry_initial: Duration::from_millis(200),
            retry_max: Duration::from_secs(5),
            retry_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Top-level tables. Anything else, such as a service table outside
/// `[services]`, fails the load.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    auth: Option<AuthConfig>,
    #[serde(default)]
    coordination: CoordinationConfig,
    #[serde(default)]
    engine: EngineSettings,
    #[serde(default)]
    services: BTreeMap<String, toml::Value>,
}

/// One `[services.<name>]` table. Aliases accept the legacy INI key names.
#[derive(Debug, Deserialize)]
struct RawService {
    #[serde(alias = "cmd")]
    command: String,
    #[serde(alias = "refresh", deserialize_with = "duration::deserialize")]
    interval: Duration,
    #[serde(alias = "service_port")]
    port: RawPort,
    #[serde(alias = "service_hostname", default)]
    hostname: Option<String>,
    #[serde(alias = "zookeeper_path")]
    path: String,
    #[serde(alias = "zookeeper_data", default)]
    data: Payload,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    timeout: Option<Duration>,
    #[serde(default = "default_threshold")]
    rise: u32,
    #[serde(default = "default_threshold")]
    verify_every: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
}

fn default_threshold() -> u32 {
    1
}

impl DaemonConfig {
    /// Read and validate a config file, resolving the local hostname for
    /// services that don't override it.
    pub fn load(path: &Path) -> ConfigResult<LoadedConfig> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let local = local_hostname();
        Self::parse(&content, local.as_deref().map_err(|e| e.to_string()))
    }

    /// Parse config text. `local_host` is the default advertised hostname,
    /// or the reason it couldn't be determined.
    pub fn parse(content: &str, local_host: Result<&str, String>) -> ConfigResult<LoadedConfig> {
        let raw: RawConfig = toml::from_str(content)?;
        validate_sections(&raw)?;

        let mut services = BTreeMap::new();
        let mut rejected = Vec::new();

        for (name, value) in raw.services {
            match build_service(&name, value, local_host.clone()) {
                Ok(def) => {
                    services.insert(name, def);
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "rejecting service definition");
                    rejected.push(e);
                }
            }
        }

        Ok(LoadedConfig {
            config: DaemonConfig {
                auth: raw.auth,
                coordination: raw.coordination,
                engine: raw.engine,
                services,
            },
            rejected,
        })
    }
}

fn validate_sections(raw: &RawConfig) -> ConfigResult<()> {
    let section = |section: &str, reason: &str| ConfigError::InvalidSection {
        section: section.to_string(),
        reason: reason.to_string(),
    };

    if raw.coordination.connect_timeout.is_zero() {
        return Err(section("coordination", "connect_timeout must be > 0"));
    }
    if raw.coordination.session_ttl.is_zero() {
        return Err(section("coordination", "session_ttl must be > 0"));
    }
    if raw.engine.op_timeout.is_zero() {
        return Err(section("engine", "op_timeout must be > 0"));
    }
    if raw.engine.retry_attempts == 0 {
        return Err(section("engine", "retry_attempts must be >= 1"));
    }
    if raw.engine.retry_max < raw.engine.retry_initial {
        return Err(section("engine", "retry_max must be >= retry_initial"));
    }
    Ok(())
}

fn build_service(
    name: &str,
    value: toml::Value,
    local_host: Result<&str, String>,
) -> ConfigResult<ServiceDefinition> {
    if name.trim().is_empty() {
        return Err(ConfigError::service(name, "service name is empty"));
    }

    let raw: RawService = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::service(name, e.message().to_string()))?;

    if raw.command.split_whitespace().next().is_none() {
        return Err(ConfigError::service(name, "command is empty"));
    }
    if raw.interval.is_zero() {
        return Err(ConfigError::service(name, "interval must be > 0"));
    }
    if raw.interval > MAX_SERVICE_DURATION {
        return Err(ConfigError::service(
            name,
            format!("interval must be at most {}s", MAX_SERVICE_DURATION.as_secs()),
        ));
    }

    let timeout = raw.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);
    if timeout.is_zero() {
        return Err(ConfigError::service(name, "timeout must be > 0"));
    }
    if timeout > MAX_SERVICE_DURATION {
        return Err(ConfigError::service(
            name,
            format!("timeout must be at most {}s", MAX_SERVICE_DURATION.as_secs()),
        ));
    }

    let port = match raw.port {
        RawPort::Number(n) => u16::try_from(n).ok(),
        RawPort::Text(s) => s.trim().parse::<u16>().ok(),
    }
    .filter(|p| *p != 0)
    .ok_or_else(|| ConfigError::service(name, "port must be in 1..=65535"))?;

    validate_registration_path(&raw.path).map_err(|reason| ConfigError::service(name, reason))?;

    let hostname = match raw.hostname {
        Some(h) => h.trim().to_string(),
        None => local_host
            .map(str::to_string)
            .map_err(|reason| ConfigError::service(name, format!("no hostname: {reason}")))?,
    };
    if hostname.is_empty() || hostname.contains('/') {
        return Err(ConfigError::service(name, format!("invalid hostname {hostname:?}")));
    }

    if raw.rise == 0 {
        return Err(ConfigError::service(name, "rise must be >= 1"));
    }
    if raw.verify_every == 0 {
        return Err(ConfigError::service(name, "verify_every must be >= 1"));
    }

    Ok(ServiceDefinition {
        name: name.to_string(),
        command: raw.command.trim().to_string(),
        interval: raw.interval,
        timeout,
        registration_path: raw.path,
        port,
        hostname,
        payload: raw.data,
        rise: raw.rise,
        verify_every: raw.verify_every,
    })
}

fn validate_registration_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("path {path:?} must be absolute"));
    }
    if path.len() == 1 || path.ends_with('/') {
        return Err(format!("path {path:?} must not end with '/'"));
    }
    if path.contains("//") {
        return Err(format!("path {path:?} contains an empty segment"));
    }
    Ok(())
}

/// The local host's name, used when a service has no hostname override.
pub fn local_hostname() -> ConfigResult<String> {
    let name = hostname::get().map_err(|e| ConfigError::Hostname(e.to_string()))?;
    name.into_string()
        .map_err(|raw| ConfigError::Hostname(format!("hostname is not valid UTF-8: {raw:?}")))
}
