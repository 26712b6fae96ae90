//! regwatch-supervisor — keeps the running watches in line with config.
//!
//! The supervisor owns the coordination session's lifecycle and the set
//! of service watches. On start it connects within a deadline and spawns
//! a watch per configured service; on reload it reconciles the running
//! set against the new configuration; on shutdown it stops every watch,
//! drives each registration DOWN, and closes the session.
//!
//! # Reload
//!
//! ```text
//! removed service          → stop watch, retire node path
//! path/hostname/port moved → stop watch, retire old path, start new watch
//! other fields changed     → reconfigure watch in place
//! new service              → start watch
//! ```

pub mod error;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use supervisor::{ApplySummary, Supervisor, SupervisorConfig, SupervisorStatus};
