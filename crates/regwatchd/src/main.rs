//! regwatchd — the regwatch daemon.
//!
//! Probes local services on a schedule and keeps an ephemeral node in the
//! coordination service for every healthy one:
//! - Config loading (TOML, per-service validation)
//! - Service watches (probe commands, rise threshold)
//! - Registration engine (retries, session disruptions, resync)
//! - PID file and signal handling
//!
//! # Usage
//!
//! ```text
//! regwatchd run --config /etc/regwatch/config.toml --server etcd://127.0.0.1:2379
//! regwatchd check --config /etc/regwatch/config.toml
//! regwatchd stop
//! ```

mod daemon;
mod error;
mod pidfile;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use regwatch_core::config::DEFAULT_CONFIG_PATH;

use crate::daemon::RunOptions;

const DEFAULT_PID_FILE: &str = "/run/regwatchd.pid";

#[derive(Parser)]
#[command(name = "regwatchd", about = "Register healthy local services in a coordination service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    Run {
        /// Configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Coordination service: etcd://host:port[,host:port] or memory://.
        #[arg(long, default_value = "etcd://127.0.0.1:2379")]
        server: String,

        /// Write the daemon's PID here; refuse to start if it names a live process.
        #[arg(long, default_value = DEFAULT_PID_FILE)]
        pid_file: PathBuf,

        /// Don't write a PID file.
        #[arg(long, conflicts_with = "pid_file")]
        no_pid_file: bool,

        /// Debug logging for regwatch crates.
        #[arg(long, short)]
        verbose: bool,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },

    /// Send SIGTERM to a running daemon.
    Stop {
        #[arg(long, default_value = DEFAULT_PID_FILE)]
        pid_file: PathBuf,
    },

    /// Validate a configuration file and list the services it defines.
    Check {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "info,regwatchd=debug,regwatch_core=debug,regwatch_session=debug,regwatch_health=debug,regwatch_registry=debug,regwatch_supervisor=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            server,
            pid_file,
            no_pid_file,
            verbose,
            log_format,
        } => {
            init_tracing(verbose, log_format);
            daemon::run(RunOptions {
                config,
                server,
                pid_file: (!no_pid_file).then_some(pid_file),
            })
            .await
        }
        Command::Stop { pid_file } => stop(&pid_file),
        Command::Check { config } => {
            init_tracing(false, LogFormat::Text);
            check(&config)
        }
    }
}

fn stop(pid_file: &Path) -> anyhow::Result<()> {
    let Some(pid) = pidfile::read_pid(pid_file)? else {
        anyhow::bail!("{} holds no pid; is regwatchd running?", pid_file.display());
    };
    pidfile::send_signal(pid, libc::SIGTERM)?;
    println!("sent SIGTERM to regwatchd (pid {pid})");
    Ok(())
}

fn check(config: &Path) -> anyhow::Result<()> {
    let loaded = daemon::load_config(config)?;

    for (name, def) in &loaded.config.services {
        println!(
            "ok       {name:<20} {} every {:?} ({})",
            def.node_path(),
            def.interval,
            def.command
        );
    }
    for rejected in &loaded.rejected {
        println!("rejected {rejected}");
    }

    if !loaded.rejected.is_empty() {
        anyhow::bail!(
            "{} of {} services rejected",
            loaded.rejected.len(),
            loaded.rejected.len() + loaded.config.services.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_defaults() {
        let cli = Cli::try_parse_from(["regwatchd", "run"]).unwrap();
        match cli.command {
            Command::Run {
                config,
                server,
                pid_file,
                no_pid_file,
                verbose,
                log_format,
            } => {
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
                assert_eq!(server, "etcd://127.0.0.1:2379");
                assert_eq!(pid_file, PathBuf::from(DEFAULT_PID_FILE));
                assert!(!no_pid_file);
                assert!(!verbose);
                assert_eq!(log_format, LogFormat::Text);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "regwatchd",
            "run",
            "--config",
            "/tmp/regwatch.toml",
            "--server",
            "memory://",
            "--pid-file",
            "/tmp/regwatchd.pid",
            "-v",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                server,
                pid_file,
                verbose,
                log_format,
                ..
            } => {
                assert_eq!(server, "memory://");
                assert_eq!(pid_file, PathBuf::from("/tmp/regwatchd.pid"));
                assert!(verbose);
                assert_eq!(log_format, LogFormat::Json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_and_stop_share_default_pid_file() {
        let Command::Run { pid_file: written, .. } =
            Cli::try_parse_from(["regwatchd", "run"]).unwrap().command
        else {
            panic!("expected run");
        };
        let Command::Stop { pid_file: signalled } =
            Cli::try_parse_from(["regwatchd", "stop"]).unwrap().command
        else {
            panic!("expected stop");
        };
        assert_eq!(written, signalled);
    }

    #[test]
    fn run_can_skip_the_pid_file() {
        let cli = Cli::try_parse_from(["regwatchd", "run", "--no-pid-file"]).unwrap();
        assert!(matches!(cli.command, Command::Run { no_pid_file: true, .. }));

        let both = Cli::try_parse_from([
            "regwatchd",
            "run",
            "--no-pid-file",
            "--pid-file",
            "/tmp/regwatchd.pid",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn stop_without_pid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(stop(&dir.path().join("regwatchd.pid")).is_err());
    }

    #[test]
    fn check_fails_on_rejected_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[services.bad]
command = "true"
interval = "5s"
port = 70000
hostname = "web1"
path = "/services/bad"
"#,
        )
        .unwrap();
        assert!(check(&path).is_err());
    }

    #[test]
    fn check_accepts_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[services.web]
command = "true"
interval = "5s"
port = 80
hostname = "web1"
path = "/services/web"
"#,
        )
        .unwrap();
        assert!(check(&path).is_ok());
    }
}
