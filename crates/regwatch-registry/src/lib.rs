//! regwatch-registry — the registration engine.
//!
//! The engine is the only component that talks to the coordination
//! session. Service watches submit reconcile requests; the engine keeps a
//! record per node path and drives the remote node toward the latest
//! desired state, retrying transient failures with backoff and pausing
//! while the session is disrupted.
//!
//! # Architecture
//!
//! ```text
//! RegistrationEngine
//!   ├── RwLock<HashMap<path, Slot>>
//!   │   └── Slot: Mutex<record + generation>, settled watch, wake Notify
//!   ├── Per-path driver task (at most one per path)
//!   │   ├── apply newest intent: create / set_data / delete
//!   │   └── Backoff between transient failures
//!   └── Session event task
//!       ├── Suspended/Expired → every record UNKNOWN
//!       └── Connected/Reconnected → full resync
//! ```
//!
//! # Ordering
//!
//! Every submission bumps the path's generation. A driver re-reads the
//! newest intent after each attempt, so an older UP retry never lands
//! after a newer DOWN.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod record;

pub use backoff::Backoff;
pub use engine::{EngineConfig, ReconcileStatus, RegistrationEngine};
pub use error::{EngineError, EngineResult};
pub use record::RegistrationRecord;
