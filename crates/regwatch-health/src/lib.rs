//! regwatch-health — local health probing for the regwatch daemon.
//!
//! Runs each service's probe command on a fixed schedule and turns the
//! outcomes into a desired registration state. One background task per
//! service; tasks share nothing but the intent sink they submit to.
//!
//! # Architecture
//!
//! ```text
//! ServiceWatch (one per configured service)
//!   ├── Background task
//!   │   ├── Prober::probe() → ProbeOutcome   (CommandProber in production)
//!   │   ├── StateTracker (rise threshold, immediate DOWN)
//!   │   └── IntentSink::submit(ReconcileRequest)
//!   ├── watch::Sender<ServiceDefinition>  (in-place reconfiguration)
//!   └── watch::Receiver<ServiceWatchState> (status reporting)
//! ```
//!
//! # Probe semantics
//!
//! Only an exit status of zero within the timeout counts as healthy.
//! A missing command, spawn failure, timeout, non-zero exit or death by
//! signal all count as failures. A failure moves the service DOWN on the
//! spot; coming back UP may require `rise` consecutive successes.

pub mod error;
pub mod probe;
pub mod tracker;
pub mod watch;

pub use error::{WatchError, WatchResult};
pub use probe::{CommandProber, ProbeDetail, ProbeOutcome, Prober, ScriptedProber};
pub use tracker::StateTracker;
pub use watch::{ServiceWatch, ServiceWatchState};
