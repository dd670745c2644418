//! Keel store: in-memory `ResourceStore` with compare-and-swap writes,
//! two-phase deletion and broadcast watch.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use keel_core::{
    DeleteOutcome, Gvk, Object, ResourceKey, ResourceStore, ResourceVersion, StoreError, StoreResult, WatchEvent,
    WatchStream,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

fn default_watch_buffer() -> usize {
    std::env::var("KEEL_WATCH_BUFFER")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1024)
}

#[derive(Default)]
struct State {
    objects: FxHashMap<ResourceKey, Object>,
    /// Store-wide counter; every write takes the next value.
    revision: u64,
}

impl State {
    fn next_rv(&mut self) -> ResourceVersion {
        self.revision = self.revision.saturating_add(1);
        ResourceVersion(self.revision)
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    revision_tx: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Publish while the state lock is held so watchers observe writes in revision order.
    fn publish(&self, state: &State, ev: WatchEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(ev);
        self.revision_tx.send_replace(state.revision);
    }

    fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> Vec<Object> {
        let state = self.lock();
        let mut out: Vec<Object> = state
            .objects
            .values()
            .filter(|o| matches_scope(o, gvk, namespace))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }
}

fn matches_scope(obj: &Object, gvk: &Gvk, namespace: Option<&str>) -> bool {
    obj.gvk() == *gvk && namespace.map(|ns| obj.metadata.namespace.as_deref() == Some(ns)).unwrap_or(true)
}

fn check_version(key: &ResourceKey, current: &Object, submitted: Option<ResourceVersion>) -> StoreResult<()> {
    let current_rv = current.resource_version().unwrap_or_default();
    if submitted != Some(current_rv) {
        counter!("store_conflicts_total", 1u64);
        return Err(StoreError::Conflict { key: key.clone(), submitted, current: current_rv });
    }
    Ok(())
}

/// In-memory store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl MemStore {
    pub fn new() -> Self { Self::with_watch_buffer(default_watch_buffer()) }

    /// `buffer` bounds how far a watcher may fall behind before it is relisted.
    pub fn with_watch_buffer(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        let (revision_tx, _) = watch::channel(0u64);
        Self { inner: Arc::new(Inner { state: Mutex::new(State::default()), events, revision_tx }) }
    }

    pub fn len(&self) -> usize { self.inner.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Latest store revision (the resourceVersion of the last write).
    pub fn revision(&self) -> u64 { self.inner.lock().revision }

    pub fn subscribe_revision(&self) -> watch::Receiver<u64> { self.inner.revision_tx.subscribe() }
}

#[async_trait::async_trait]
impl ResourceStore for MemStore {
    async fn get(&self, key: &ResourceKey) -> StoreResult<Object> {
        self.inner.lock().objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> StoreResult<Vec<Object>> {
        Ok(self.inner.list(gvk, namespace))
    }

    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>) -> StoreResult<WatchStream> {
        let rx = self.inner.events.subscribe();
        let scope = (gvk.clone(), namespace.map(|s| s.to_string()));
        let inner = Arc::clone(&self.inner);
        let stream = futures::stream::unfold((rx, inner, scope), |(mut rx, inner, scope)| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let hit = match &ev {
                            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => {
                                matches_scope(o, &scope.0, scope.1.as_deref())
                            }
                            WatchEvent::Restarted(_) => false,
                        };
                        if hit {
                            return Some((ev, (rx, inner, scope)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(gvk = %scope.0, skipped, "watcher lagged; relisting");
                        counter!("store_watch_relists_total", 1u64);
                        let list = inner.list(&scope.0, scope.1.as_deref());
                        return Some((WatchEvent::Restarted(list), (rx, inner, scope)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn create(&self, mut obj: Object) -> StoreResult<Object> {
        if obj.metadata.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".into()));
        }
        let key = obj.key();
        let mut state = self.inner.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let rv = state.next_rv();
        obj.metadata.resource_version = Some(rv);
        obj.metadata.uid = Some(Uuid::new_v4().to_string());
        obj.metadata.generation = 1;
        obj.metadata.creation_timestamp = Some(Utc::now());
        obj.metadata.deletion_timestamp = None;
        state.objects.insert(key.clone(), obj.clone());
        self.inner.publish(&state, WatchEvent::Added(obj.clone()));
        counter!("store_writes_total", 1u64, "op" => "create");
        debug!(key = %key, rv = %rv, "store: created");
        Ok(obj)
    }

    async fn update(&self, obj: Object) -> StoreResult<Object> {
        let key = obj.key();
        let mut state = self.inner.lock();
        let current = state.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_version(&key, &current, obj.resource_version())?;

        let mut next = obj;
        next.status = current.status.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp;
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        next.metadata.generation = if next.spec != current.spec {
            current.metadata.generation.saturating_add(1)
        } else {
            current.metadata.generation
        };
        next.metadata.resource_version = current.metadata.resource_version;

        if current.is_deleting() {
            if let Some(added) = next.metadata.finalizers.iter().find(|f| !current.has_finalizer(f)) {
                return Err(StoreError::Invalid(format!("cannot add finalizer {} to {} while it is being deleted", added, key)));
            }
        }
        if next == current {
            return Ok(current);
        }

        let rv = state.next_rv();
        next.metadata.resource_version = Some(rv);
        if next.is_deleting() && next.metadata.finalizers.is_empty() {
            state.objects.remove(&key);
            self.inner.publish(&state, WatchEvent::Deleted(next.clone()));
            counter!("store_writes_total", 1u64, "op" => "finalize");
            debug!(key = %key, rv = %rv, "store: last finalizer removed; erased");
            return Ok(next);
        }
        state.objects.insert(key.clone(), next.clone());
        self.inner.publish(&state, WatchEvent::Modified(next.clone()));
        counter!("store_writes_total", 1u64, "op" => "update");
        debug!(key = %key, rv = %rv, generation = next.metadata.generation, "store: updated");
        Ok(next)
    }

    async fn update_status(&self, obj: Object) -> StoreResult<Object> {
        let key = obj.key();
        let mut state = self.inner.lock();
        let current = state.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_version(&key, &current, obj.resource_version())?;
        if obj.status == current.status {
            return Ok(current);
        }
        let mut next = current;
        next.status = obj.status;
        let rv = state.next_rv();
        next.metadata.resource_version = Some(rv);
        state.objects.insert(key.clone(), next.clone());
        self.inner.publish(&state, WatchEvent::Modified(next.clone()));
        counter!("store_writes_total", 1u64, "op" => "update_status");
        debug!(key = %key, rv = %rv, "store: status updated");
        Ok(next)
    }

    async fn delete(&self, key: &ResourceKey) -> StoreResult<DeleteOutcome> {
        let mut state = self.inner.lock();
        let mut current = state.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if current.metadata.finalizers.is_empty() {
            state.objects.remove(key);
            let rv = state.next_rv();
            current.metadata.resource_version = Some(rv);
            if current.metadata.deletion_timestamp.is_none() {
                current.metadata.deletion_timestamp = Some(Utc::now());
            }
            self.inner.publish(&state, WatchEvent::Deleted(current.clone()));
            counter!("store_writes_total", 1u64, "op" => "delete");
            debug!(key = %key, rv = %rv, "store: deleted");
            return Ok(DeleteOutcome::Deleted(current));
        }
        if current.is_deleting() {
            return Ok(DeleteOutcome::Pending(current));
        }
        current.metadata.deletion_timestamp = Some(Utc::now());
        let rv = state.next_rv();
        current.metadata.resource_version = Some(rv);
        state.objects.insert(key.clone(), current.clone());
        self.inner.publish(&state, WatchEvent::Modified(current.clone()));
        counter!("store_writes_total", 1u64, "op" => "delete_pending");
        debug!(key = %key, rv = %rv, finalizers = current.metadata.finalizers.len(), "store: deletion pending on finalizers");
        Ok(DeleteOutcome::Pending(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget(name: &str) -> Object {
        Object::new(&Gvk::new("example.com", "v1", "Widget"), Some("default"), name).with_spec(json!({"replicas": 1}))
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemStore::new();
        let obj = store.create(widget("a")).await.unwrap();
        assert_eq!(obj.resource_version(), Some(ResourceVersion(1)));
        assert_eq!(obj.metadata.generation, 1);
        assert!(obj.metadata.uid.is_some());
        assert!(obj.metadata.creation_timestamp.is_some());
        let err = store.create(widget("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        let err = store.create(widget("")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn generation_moves_only_on_spec_changes() {
        let store = MemStore::new();
        let mut obj = store.create(widget("a")).await.unwrap();

        obj.metadata.labels.insert("tier".into(), "web".into());
        let obj = store.update(obj).await.unwrap();
        assert_eq!(obj.metadata.generation, 1);
        assert_eq!(obj.resource_version(), Some(ResourceVersion(2)));

        let mut with_status = obj.clone();
        with_status.status = json!({"ready": true});
        let obj = store.update_status(with_status).await.unwrap();
        assert_eq!(obj.metadata.generation, 1);

        let mut spec_change = obj.clone();
        spec_change.spec = json!({"replicas": 5});
        let obj = store.update(spec_change).await.unwrap();
        assert_eq!(obj.metadata.generation, 2);
        assert_eq!(obj.status, json!({"ready": true}), "update keeps stored status");
    }

    #[tokio::test]
    async fn unchanged_writes_do_not_bump_version() {
        let store = MemStore::new();
        let obj = store.create(widget("a")).await.unwrap();
        let again = store.update(obj.clone()).await.unwrap();
        assert_eq!(again.resource_version(), obj.resource_version());
        let again = store.update_status(obj.clone()).await.unwrap();
        assert_eq!(again.resource_version(), obj.resource_version());
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn update_requires_current_version() {
        let store = MemStore::new();
        let obj = store.create(widget("a")).await.unwrap();
        let mut missing = obj.clone();
        missing.metadata.resource_version = None;
        missing.spec = json!({"replicas": 2});
        assert!(store.update(missing).await.unwrap_err().is_conflict());
        let err = store.update(widget("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn revision_channel_tracks_writes() {
        let store = MemStore::new();
        let rx = store.subscribe_revision();
        store.create(widget("a")).await.unwrap();
        store.create(widget("b")).await.unwrap();
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(store.len(), 2);
    }
}
