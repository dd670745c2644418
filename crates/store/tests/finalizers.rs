#![forbid(unsafe_code)]

use keel_core::{DeleteOutcome, Gvk, Object, ResourceStore, StoreError};
use keel_store::MemStore;
use serde_json::json;

fn guarded(name: &str, finalizers: &[&str]) -> Object {
    let mut o = Object::new(&Gvk::new("example.com", "v1", "Widget"), Some("default"), name).with_spec(json!({"replicas": 1}));
    o.metadata.finalizers = finalizers.iter().map(|s| s.to_string()).collect();
    o
}

#[tokio::test]
async fn object_stays_until_last_finalizer_is_removed() {
    let store = MemStore::new();
    let obj = store.create(guarded("w", &["a.example.com/cleanup", "b.example.com/cleanup"])).await.unwrap();
    let key = obj.key();

    let pending = match store.delete(&key).await.unwrap() {
        DeleteOutcome::Pending(o) => o,
        other => panic!("expected pending delete, got {other:?}"),
    };
    assert!(pending.is_deleting());

    // deleting again is a no-op while finalizers remain
    let again = match store.delete(&key).await.unwrap() {
        DeleteOutcome::Pending(o) => o,
        other => panic!("expected pending delete, got {other:?}"),
    };
    assert_eq!(again.resource_version(), pending.resource_version());

    let mut live = store.get(&key).await.unwrap();
    assert!(live.is_deleting());
    live.metadata.finalizers.retain(|f| *f != "a.example.com/cleanup");
    let live = store.update(live).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap().metadata.finalizers.len(), 1);

    let mut last = live;
    last.metadata.finalizers.clear();
    store.update(last).await.unwrap();
    assert!(matches!(store.get(&key).await, Err(StoreError::NotFound(_))));
    assert!(store.is_empty());
}

#[tokio::test]
async fn finalizers_cannot_be_added_during_deletion() {
    let store = MemStore::new();
    let obj = store.create(guarded("w", &["a.example.com/cleanup"])).await.unwrap();
    store.delete(&obj.key()).await.unwrap();
    let mut live = store.get(&obj.key()).await.unwrap();
    live.metadata.finalizers.push("late.example.com/x".into());
    assert!(matches!(store.update(live).await, Err(StoreError::Invalid(_))));
}

#[tokio::test]
async fn update_cannot_clear_deletion_timestamp() {
    let store = MemStore::new();
    let obj = store.create(guarded("w", &["a.example.com/cleanup"])).await.unwrap();
    store.delete(&obj.key()).await.unwrap();
    let mut live = store.get(&obj.key()).await.unwrap();
    live.metadata.deletion_timestamp = None;
    live.metadata.labels.insert("touched".into(), "yes".into());
    let stored = store.update(live).await.unwrap();
    assert!(stored.is_deleting());
}

#[tokio::test]
async fn delete_without_finalizers_is_immediate() {
    let store = MemStore::new();
    let obj = store.create(guarded("w", &[])).await.unwrap();
    assert!(matches!(store.delete(&obj.key()).await.unwrap(), DeleteOutcome::Deleted(_)));
    assert!(store.delete(&obj.key()).await.unwrap_err().is_not_found());
}
