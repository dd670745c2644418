use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_admission::{FailurePolicy, ImagePolicy, RunAsNonRoot, SetDefaults, MutatingBinding, ValidatingBinding};
use keel_core::{Action, Context, Gvk, ReconcileError, Reconciler, ResourceKey};
use keel_registry::{Kind, Registry, RegistryError};
use keel_schema::{CrdSchema, Schema};
use serde_json::json;

struct Noop;

#[async_trait]
impl Reconciler for Noop {
    async fn reconcile(&self, _: &ResourceKey, _: &Context) -> Result<Action, ReconcileError> { Ok(Action::await_change()) }
}

fn widget() -> Gvk { Gvk::new("example.com", "v1", "Widget") }

fn schema(min: i64) -> Schema {
    Schema::compile(json!({
        "type": "object",
        "properties": {"spec": {"type": "object", "properties": {"replicas": {"type": "integer", "minimum": min}}}}
    }))
    .unwrap()
}

const T: Duration = Duration::from_secs(1);

#[test]
fn unregistered_kinds_pass_through() {
    let reg = Registry::new();
    assert!(reg.lookup(&widget()).is_none());
    assert!(reg.kinds().is_empty());
}

#[test]
fn conflicting_schema_is_rejected() {
    let reg = Registry::new();
    reg.register(Kind::new(widget()).schema(schema(1))).unwrap();
    let err = reg.register(Kind::new(widget()).schema(schema(2))).unwrap_err();
    assert_eq!(err, RegistryError::SchemaConflict(widget()));
    // the same schema again is fine and keeps the original
    reg.register(Kind::new(widget()).schema(schema(1))).unwrap();
    assert_eq!(*reg.lookup(&widget()).unwrap().schema.clone().unwrap(), schema(1));
}

#[test]
fn conflicting_scope_is_rejected() {
    let reg = Registry::new();
    let node = Gvk::new("example.com", "v1", "NodePool");
    reg.register(Kind::new(node.clone()).cluster_scoped()).unwrap();
    let err = reg.register(Kind::new(node.clone()).namespaced()).unwrap_err();
    assert_eq!(err, RegistryError::ScopeConflict(node.clone()));
    assert!(!reg.lookup(&node).unwrap().namespaced);

    // Leaving the scope unstated keeps the registered one.
    reg.register(Kind::new(node.clone()).reconciler(Arc::new(Noop))).unwrap();
    assert!(!reg.lookup(&node).unwrap().namespaced);
}

#[test]
fn hooks_accumulate_in_registration_order() {
    let reg = Registry::new();
    reg.register(
        Kind::new(widget())
            .mutating(MutatingBinding::mutating(SetDefaults::new("owner"), T, FailurePolicy::FailClosed))
            .validating(ValidatingBinding::validating(RunAsNonRoot::new(), T, FailurePolicy::FailClosed)),
    )
    .unwrap();
    reg.register(Kind::new(widget()).validating(ValidatingBinding::validating(ImagePolicy::default(), T, FailurePolicy::FailOpen)))
        .unwrap();
    let r = reg.lookup(&widget()).unwrap();
    let names: Vec<&str> = r.pipeline.validating().iter().map(|b| b.name()).collect();
    assert_eq!(names, vec!["run-as-non-root", "image-policy"]);
    assert_eq!(r.pipeline.mutating().len(), 1);
}

#[test]
fn one_reconciler_per_kind() {
    let reg = Registry::new();
    reg.register(Kind::new(widget()).reconciler(Arc::new(Noop))).unwrap();
    let err = reg.register(Kind::new(widget()).reconciler(Arc::new(Noop))).unwrap_err();
    assert_eq!(err, RegistryError::DuplicateReconciler(widget()));
    reg.register(Kind::new(Gvk::new("", "v1", "ConfigMap"))).unwrap();
    let reconciled: Vec<Gvk> = reg.reconciled().iter().map(|r| r.gvk.clone()).collect();
    assert_eq!(reconciled, vec![widget()]);
}

#[test]
fn snapshots_are_stable_across_registration() {
    let reg = Registry::new();
    let before = reg.register(Kind::new(widget())).unwrap();
    reg.register(Kind::new(widget()).reconciler(Arc::new(Noop))).unwrap();
    assert!(before.reconciler.is_none());
    assert!(reg.lookup(&widget()).unwrap().reconciler.is_some());
}

#[test]
fn registers_from_crd_manifest() {
    let crd = json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "crontabs.stable.example.com"},
        "spec": {
            "group": "stable.example.com",
            "scope": "Cluster",
            "names": {"kind": "CronTab", "plural": "crontabs"},
            "versions": [{
                "name": "v1", "served": true, "storage": true,
                "schema": {"openAPIV3Schema": {"type": "object", "properties": {
                    "spec": {"type": "object", "properties": {"cronSpec": {"type": "string"}}}
                }}}
            }]
        }
    });
    let reg = Registry::new();
    let r = reg.register(Kind::from_crd(CrdSchema::from_crd(&crd).unwrap()).unwrap()).unwrap();
    assert_eq!(r.gvk, Gvk::new("stable.example.com", "v1", "CronTab"));
    assert!(!r.namespaced);
    assert!(r.schema.is_some());
}
