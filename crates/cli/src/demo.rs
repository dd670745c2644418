//! The Widget kind used by `keelctl demo`, and the reconciler `apply`
//! attaches to kinds loaded from CRDs.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use keel_admission::{
    AdmissionRequest, FailurePolicy, HookError, MutatingBinding, Operation, SetDefaults, ValidatingBinding,
    ValidatingHook, Verdict,
};
use keel_core::prelude::*;
use keel_engine::{create_or_update, ensure_finalizer, remove_finalizer, set_condition};
use keel_registry::{Kind, Registry};
use keel_schema::Schema;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const WIDGET_FINALIZER: &str = "widgets.example.com/config";

pub fn widget_gvk() -> Gvk { Gvk::new("example.com", "v1", "Widget") }

fn config_map_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

#[derive(Debug, Deserialize)]
struct WidgetSpec {
    replicas: i64,
    #[serde(default)]
    owner: String,
}

fn widget_schema() -> Result<Schema> {
    Ok(Schema::compile(json!({
        "type": "object",
        "properties": {
            "spec": {
                "type": "object",
                "required": ["replicas"],
                "properties": {
                    "replicas": {"type": "integer", "minimum": 1},
                    "owner": {"type": "string"}
                }
            }
        }
    }))?)
}

struct OwnerRequired;

#[async_trait]
impl ValidatingHook for OwnerRequired {
    fn name(&self) -> &str { "owner-required" }

    async fn validate(&self, req: &AdmissionRequest) -> Result<Verdict, HookError> {
        let owner = req.object.as_ref().and_then(|o| o.spec.get("owner")).and_then(|v| v.as_str()).unwrap_or("");
        Ok(if owner.is_empty() { Verdict::deny("spec.owner must not be empty") } else { Verdict::allow() })
    }
}

/// Keeps `status.ready`, and a `<name>-config` ConfigMap mirroring `spec.replicas` and `spec.owner`.
/// The ConfigMap is removed behind a finalizer when the Widget goes away.
struct WidgetReconciler;

#[async_trait]
impl Reconciler for WidgetReconciler {
    async fn reconcile(&self, key: &ResourceKey, cx: &Context) -> Result<Action, ReconcileError> {
        let widget = match cx.store.get(key).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };
        let child_key = ResourceKey::new(config_map_gvk(), key.namespace.as_deref(), &format!("{}-config", key.name));

        if widget.is_deleting() {
            match cx.store.delete(&child_key).await {
                Ok(_) => debug!(child = %child_key, "widget: child removed"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            remove_finalizer(cx.store.as_ref(), &widget, WIDGET_FINALIZER).await?;
            return Ok(Action::await_change());
        }

        let widget = ensure_finalizer(cx.store.as_ref(), &widget, WIDGET_FINALIZER).await?;
        let spec: WidgetSpec = widget.spec_as().map_err(ReconcileError::terminal)?;

        let mut child = Object::new(&config_map_gvk(), key.namespace.as_deref(), &child_key.name)
            .with_spec(json!({"replicas": spec.replicas, "owner": spec.owner}));
        child.metadata.owner_references.push(widget.owner_reference());
        create_or_update(cx.store.as_ref(), child).await?;

        let mut next = widget.clone();
        next.status = json!({"ready": true, "replicas": spec.replicas});
        if next.status != widget.status {
            cx.store.update_status(next).await?;
        }
        Ok(Action::await_change())
    }
}

pub fn register_widget(registry: &Registry, hook_timeout: Duration) -> Result<()> {
    registry.register(
        Kind::new(widget_gvk())
            .schema(widget_schema()?)
            .reconciler(Arc::new(WidgetReconciler))
            .mutating(MutatingBinding::mutating(
                SetDefaults::new("owner-default").field("spec.owner", json!("system")),
                hook_timeout,
                FailurePolicy::FailClosed,
            ))
            .validating(
                ValidatingBinding::validating(OwnerRequired, hook_timeout, FailurePolicy::FailClosed)
                    .for_operations(&[Operation::Create, Operation::Update]),
            ),
    )?;
    Ok(())
}

/// Marks every object of a CRD-defined kind `Accepted` for its current generation.
pub struct Acceptor;

#[async_trait]
impl Reconciler for Acceptor {
    async fn reconcile(&self, key: &ResourceKey, cx: &Context) -> Result<Action, ReconcileError> {
        let obj = match cx.store.get(key).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };
        let generation = obj.metadata.generation;
        let current = obj.condition("Accepted");
        if current.map(|c| c.status == ConditionStatus::True && c.observed_generation == generation).unwrap_or(false) {
            return Ok(Action::await_change());
        }
        let cond = Condition::new("Accepted", ConditionStatus::True, "Reconciled", "object observed by keel", generation);
        set_condition(cx.store.as_ref(), &obj, cond).await?;
        Ok(Action::await_change())
    }
}
