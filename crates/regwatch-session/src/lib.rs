//! regwatch-session — the coordination-service session consumed by the
//! registration engine.
//!
//! The daemon never speaks a coordination wire protocol itself. It talks
//! to a [`CoordinationSession`]: a narrow interface for ephemeral-node
//! CRUD plus a broadcast stream of session lifecycle events.
//!
//! # Backends
//!
//! ```text
//! CoordinationSession
//!   ├── MemorySession  (in-process coordinator: tests, dry runs, fault injection)
//!   └── EtcdSession    (feature "etcd": lease = session, leased key = ephemeral node)
//! ```

pub mod error;
pub mod memory;
pub mod session;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use error::{SessionError, SessionResult};
pub use memory::{MemoryCoordinator, MemoryNode, MemorySession, OP_LOG_CAPACITY, OpKind, OpRecord};
pub use session::{CoordinationSession, CreateOutcome, NodeStat, SessionEvent, WriteOutcome};

#[cfg(feature = "etcd")]
pub use etcd::EtcdSession;
