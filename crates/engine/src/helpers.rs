//! Building blocks for reconcilers. Every write is a CAS against the version
//! the caller read; conflicts surface as `StoreError::Conflict`.

use keel_core::{Condition, Object, ResourceKey, ResourceStore, StoreError, StoreResult};
use tracing::debug;

const STATUS_RETRIES: usize = 5;

/// What [`create_or_update`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Created(Object),
    Updated(Object),
    Unchanged(Object),
}

impl Applied {
    pub fn object(&self) -> &Object {
        match self {
            Applied::Created(o) | Applied::Updated(o) | Applied::Unchanged(o) => o,
        }
    }

    pub fn into_object(self) -> Object {
        match self {
            Applied::Created(o) | Applied::Updated(o) | Applied::Unchanged(o) => o,
        }
    }
}

/// Add `finalizer` to `obj` unless it is already there.
pub async fn ensure_finalizer(store: &dyn ResourceStore, obj: &Object, finalizer: &str) -> StoreResult<Object> {
    if obj.has_finalizer(finalizer) {
        return Ok(obj.clone());
    }
    let mut next = obj.clone();
    next.metadata.finalizers.push(finalizer.to_string());
    store.update(next).await
}

/// Drop `finalizer` from `obj`. When it was the last one on an object being
/// deleted, the store erases the object and the returned copy is its final state.
pub async fn remove_finalizer(store: &dyn ResourceStore, obj: &Object, finalizer: &str) -> StoreResult<Object> {
    if !obj.has_finalizer(finalizer) {
        return Ok(obj.clone());
    }
    let mut next = obj.clone();
    next.metadata.finalizers.retain(|f| *f != finalizer);
    store.update(next).await
}

/// Write `cond` into the status of `obj` (status subresource only).
pub async fn set_condition(store: &dyn ResourceStore, obj: &Object, cond: Condition) -> StoreResult<Object> {
    let mut next = obj.clone();
    next.set_condition(cond);
    store.update_status(next).await
}

/// Make the stored object match `desired` in spec, labels, annotations and
/// owner references. Other stored fields (status, finalizers) are kept.
pub async fn create_or_update(store: &dyn ResourceStore, desired: Object) -> StoreResult<Applied> {
    let key = desired.key();
    let current = match store.get(&key).await {
        Ok(o) => o,
        Err(StoreError::NotFound(_)) => {
            let created = store.create(desired).await?;
            debug!(key = %key, "create_or_update: created");
            return Ok(Applied::Created(created));
        }
        Err(e) => return Err(e),
    };
    let mut next = current.clone();
    next.spec = desired.spec;
    for (k, v) in desired.metadata.labels {
        next.metadata.labels.insert(k, v);
    }
    for (k, v) in desired.metadata.annotations {
        next.metadata.annotations.insert(k, v);
    }
    if !desired.metadata.owner_references.is_empty() {
        next.metadata.owner_references = desired.metadata.owner_references;
    }
    if next == current {
        return Ok(Applied::Unchanged(current));
    }
    let updated = store.update(next).await?;
    debug!(key = %key, "create_or_update: updated");
    Ok(Applied::Updated(updated))
}

/// Read-modify-write of status, re-reading on conflict.
pub(crate) async fn update_status_with<F>(store: &dyn ResourceStore, key: &ResourceKey, mut f: F) -> StoreResult<Object>
where
    F: FnMut(&mut Object) + Send,
{
    let mut last = None;
    for _ in 0..STATUS_RETRIES {
        let mut obj = store.get(key).await?;
        f(&mut obj);
        match store.update_status(obj).await {
            Ok(o) => return Ok(o),
            Err(e) if e.is_conflict() => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| StoreError::NotFound(key.clone())))
}
