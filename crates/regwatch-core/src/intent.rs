//! The hand-off between service watches and the registration engine.

use std::future::Future;

use crate::payload::Payload;
use crate::types::DesiredState;

/// A request to drive one node path toward a desired state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileRequest {
    pub node_path: String,
    pub desired: DesiredState,
    pub payload: Payload,
}

/// Accepts reconcile requests from service watches.
///
/// Implementations must not block on coordination I/O: `submit` records
/// the intent and returns, and convergence happens in the background.
pub trait IntentSink: Send + Sync + 'static {
    fn submit(&self, request: ReconcileRequest) -> impl Future<Output = ()> + Send;
}
