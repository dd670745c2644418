//! Resource store contract. The real API server is out of reach; anything
//! honoring this trait (the in-memory `keel-store`, a fake, a remote adapter)
//! can back the engine and the admission write path.

use futures::stream::BoxStream;

use crate::{Gvk, Object, ResourceKey, ResourceVersion};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(ResourceKey),
    #[error("already_exists: {0}")]
    AlreadyExists(ResourceKey),
    #[error("conflict: {key}: submitted resourceVersion {submitted:?}, current {current}")]
    Conflict { key: ResourceKey, submitted: Option<ResourceVersion>, current: ResourceVersion },
    #[error("invalid: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

/// Change notification. `Restarted` carries a full relist after a watcher fell behind.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    Restarted(Vec<Object>),
}

impl WatchEvent {
    pub fn keys(&self) -> Vec<ResourceKey> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => vec![o.key()],
            WatchEvent::Restarted(list) => list.iter().map(Object::key).collect(),
        }
    }
}

pub type WatchStream = BoxStream<'static, WatchEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Object erased from the store.
    Deleted(Object),
    /// Finalizers remain; `deletionTimestamp` is set and the object stays readable.
    Pending(Object),
}

#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> StoreResult<Object>;

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> StoreResult<Vec<Object>>;

    /// Events for objects of `gvk` (optionally one namespace) written after the call.
    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>) -> StoreResult<WatchStream>;

    async fn create(&self, obj: Object) -> StoreResult<Object>;

    /// Compare-and-swap write of metadata and spec. `status` is carried over from the stored copy.
    async fn update(&self, obj: Object) -> StoreResult<Object>;

    /// Compare-and-swap write of `status` only.
    async fn update_status(&self, obj: Object) -> StoreResult<Object>;

    async fn delete(&self, key: &ResourceKey) -> StoreResult<DeleteOutcome>;
}
