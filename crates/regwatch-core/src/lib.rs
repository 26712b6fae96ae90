//! regwatch-core — shared types for the regwatch daemon.
//!
//! Holds everything the other crates agree on: service definitions
//! loaded from the TOML config, registration payloads, the desired /
//! actual / session state enums, and the `IntentSink` seam through which
//! service watches hand reconcile requests to the registration engine.

pub mod config;
pub mod duration;
pub mod error;
pub mod intent;
pub mod payload;
pub mod types;

pub use config::{
    AuthConfig, CoordinationConfig, DaemonConfig, EngineSettings, LoadedConfig, MAX_SERVICE_DURATION,
};
pub use error::{ConfigError, ConfigResult};
pub use intent::{IntentSink, ReconcileRequest};
pub use payload::Payload;
pub use types::*;
