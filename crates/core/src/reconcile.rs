//! Reconciler registration contract.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{ResourceKey, ResourceStore, StoreError};

/// What to do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Go idle until the next observed change.
    pub fn await_change() -> Self { Self { requeue_after: None } }

    /// Reconcile again after `delay` even without a change (polling).
    pub fn requeue(delay: Duration) -> Self { Self { requeue_after: Some(delay) } }

    pub fn requeue_after(&self) -> Option<Duration> { self.requeue_after }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    /// Expected to clear up on its own (dependency not ready, timeout, I/O).
    #[error("transient: {0}")]
    Transient(String),
    /// The reconciler cannot make progress with the current spec.
    #[error("terminal: {0}")]
    Terminal(String),
    /// Optimistic-concurrency collision; retried with backoff after a fresh read.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl ReconcileError {
    pub fn transient(e: impl fmt::Display) -> Self { Self::Transient(e.to_string()) }
    pub fn terminal(e: impl fmt::Display) -> Self { Self::Terminal(e.to_string()) }
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Terminal(_)) }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => Self::Conflict(e.to_string()),
            StoreError::Invalid(_) => Self::Terminal(e.to_string()),
            StoreError::NotFound(_) | StoreError::AlreadyExists(_) => Self::Transient(e.to_string()),
        }
    }
}

/// Handed to every reconcile call. The key is the only input about *what* to
/// reconcile; state must be re-read from `store`.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    /// Cancelled when the pass exceeds its deadline or the engine shuts down.
    pub cancel: CancellationToken,
    /// Consecutive failed passes for this key before this one.
    pub attempt: u32,
}

#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    /// Level-triggered and idempotent: read current state, converge, return.
    async fn reconcile(&self, key: &ResourceKey, cx: &Context) -> Result<Action, ReconcileError>;
}
