#![forbid(unsafe_code)]

use std::time::Duration;

use futures::StreamExt;
use keel_core::{Gvk, Object, ResourceStore, WatchEvent};
use keel_store::MemStore;
use serde_json::json;

fn gvk() -> Gvk { Gvk::new("example.com", "v1", "Widget") }

fn obj(ns: &str, name: &str) -> Object {
    Object::new(&gvk(), Some(ns), name).with_spec(json!({"replicas": 1}))
}

async fn next(stream: &mut keel_core::WatchStream) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_reports_lifecycle_in_order_and_filters_scope() {
    let store = MemStore::new();
    let mut stream = store.watch(&gvk(), Some("prod")).await.unwrap();

    store.create(obj("dev", "ignored")).await.unwrap();
    store
        .create(Object::new(&Gvk::new("", "v1", "ConfigMap"), Some("prod"), "other-kind"))
        .await
        .unwrap();
    let created = store.create(obj("prod", "a")).await.unwrap();
    let mut changed = created.clone();
    changed.spec = json!({"replicas": 2});
    store.update(changed).await.unwrap();
    store.delete(&created.key()).await.unwrap();

    assert!(matches!(next(&mut stream).await, WatchEvent::Added(o) if o.metadata.name == "a"));
    assert!(matches!(next(&mut stream).await, WatchEvent::Modified(o) if o.metadata.generation == 2));
    assert!(matches!(next(&mut stream).await, WatchEvent::Deleted(o) if o.metadata.name == "a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lagging_watcher_gets_a_relist() {
    let store = MemStore::with_watch_buffer(2);
    let mut stream = store.watch(&gvk(), None).await.unwrap();
    for i in 0..10 {
        store.create(obj("default", &format!("w{i}"))).await.unwrap();
    }
    match next(&mut stream).await {
        WatchEvent::Restarted(list) => assert_eq!(list.len(), 10),
        other => panic!("expected relist, got {other:?}"),
    }
}
