//! Keel public API façade (in-process).
//!
//! The write path every frontend goes through: registry lookup, schema,
//! admission, then the store. Kinds without a registration pass straight through.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_admission::{AdmissionError, AdmissionRequest, UserInfo};
use keel_core::{DeleteOutcome, Gvk, Object, ResourceKey, ResourceStore, StoreError};
use keel_registry::{Registration, Registry};
use keel_schema::SchemaError;
use keel_store::MemStore;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

pub use keel_admission::Operation;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ApiError {
    pub fn is_conflict(&self) -> bool { matches!(self, ApiError::Store(e) if e.is_conflict()) }
    pub fn is_not_found(&self) -> bool { matches!(self, ApiError::Store(e) if e.is_not_found()) }
    pub fn is_schema(&self) -> bool { matches!(self, ApiError::Schema(_)) }
    pub fn is_denied(&self) -> bool { matches!(self, ApiError::Admission(_)) }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Result of a dry run: what would be stored, and what the hooks had to say.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRun {
    pub operation: Operation,
    pub object: Object,
    pub warnings: Vec<String>,
}

#[async_trait::async_trait]
pub trait KeelApi: Send + Sync {
    async fn create(&self, obj: Object) -> ApiResult<Object>;

    /// Replace metadata and spec. `obj` must carry the resourceVersion it was read at.
    async fn update(&self, obj: Object) -> ApiResult<Object>;

    /// Replace status only; not subject to admission hooks.
    async fn update_status(&self, obj: Object) -> ApiResult<Object>;

    async fn delete(&self, key: &ResourceKey) -> ApiResult<DeleteOutcome>;

    async fn get(&self, key: &ResourceKey) -> ApiResult<Object>;

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> ApiResult<Vec<Object>>;

    /// Run schema and admission for a create (or an update, if the object
    /// exists) without writing anything.
    async fn dry_run(&self, obj: Object) -> ApiResult<DryRun>;
}

/// In-process implementation over a store and a registry.
pub struct InProcApi {
    store: Arc<dyn ResourceStore>,
    registry: Arc<Registry>,
    user: UserInfo,
}

impl InProcApi {
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry, user: UserInfo::new("system:keel") }
    }

    /// Fresh in-memory store with the given registry.
    pub fn in_memory(registry: Arc<Registry>) -> Self { Self::new(Arc::new(MemStore::new()), registry) }

    /// Submit subsequent requests as `username`.
    pub fn as_user(mut self, username: &str) -> Self {
        self.user = UserInfo::new(username);
        self
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> { &self.store }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }

    fn check_scope(reg: &Registration, obj: &Object) -> ApiResult<()> {
        match (reg.namespaced, obj.metadata.namespace.is_some()) {
            (true, false) => Err(ApiError::Invalid(format!("{} {} requires a namespace", reg.gvk.kind, obj.metadata.name))),
            (false, true) => Err(ApiError::Invalid(format!("{} is cluster-scoped; drop metadata.namespace", reg.gvk.kind))),
            _ => Ok(()),
        }
    }

    /// Schema, then admission. Returns the object to write plus hook warnings.
    async fn admit(&self, reg: &Registration, req: AdmissionRequest) -> ApiResult<(Option<Object>, Vec<String>)> {
        if let (Some(schema), Some(obj)) = (&reg.schema, &req.object) {
            schema.validate(obj)?;
        }
        let submitted = req.object.clone();
        let admitted = reg.pipeline.admit(req).await?;
        // Hooks assume a well-typed object; hold them to producing one.
        if let (Some(schema), Some(obj)) = (&reg.schema, &admitted.object) {
            if admitted.object != submitted {
                schema.validate(obj)?;
            }
        }
        Ok((admitted.object, admitted.warnings))
    }

    async fn prepare(&self, op: Operation, mut obj: Object, dry_run: bool) -> ApiResult<(Object, Vec<String>)> {
        if obj.metadata.name.is_empty() {
            return Err(ApiError::Invalid("metadata.name is required".into()));
        }
        if op == Operation::Create {
            obj.status = Value::Null;
        }
        let Some(reg) = self.registry.lookup(&obj.gvk()) else {
            return Ok((obj, Vec::new()));
        };
        Self::check_scope(&reg, &obj)?;
        let mut req = match op {
            Operation::Create => AdmissionRequest::create(obj.clone(), self.user.clone()),
            Operation::Update => {
                let old = self.store.get(&obj.key()).await?;
                // Status is owned by controllers; what is stored is what hooks see.
                obj.status = old.status.clone();
                AdmissionRequest::update(old, obj.clone(), self.user.clone())
            }
            Operation::Delete => return Err(ApiError::Invalid("prepare is for writes with a body".into())),
        };
        if dry_run {
            req = req.dry_run();
        }
        let (admitted, warnings) = self.admit(&reg, req).await?;
        Ok((admitted.unwrap_or(obj), warnings))
    }
}

#[async_trait::async_trait]
impl KeelApi for InProcApi {
    async fn create(&self, obj: Object) -> ApiResult<Object> {
        let t0 = Instant::now();
        let key = obj.key();
        let (obj, warnings) = self.prepare(Operation::Create, obj, false).await?;
        let created = self.store.create(obj).await?;
        counter!("api_requests_total", 1u64, "op" => "create");
        info!(key = %key, rv = ?created.resource_version(), warnings = warnings.len(), took_ms = %t0.elapsed().as_millis(), "api: created");
        Ok(created)
    }

    async fn update(&self, obj: Object) -> ApiResult<Object> {
        let t0 = Instant::now();
        let key = obj.key();
        let (obj, warnings) = self.prepare(Operation::Update, obj, false).await?;
        let updated = self.store.update(obj).await?;
        counter!("api_requests_total", 1u64, "op" => "update");
        info!(key = %key, rv = ?updated.resource_version(), warnings = warnings.len(), took_ms = %t0.elapsed().as_millis(), "api: updated");
        Ok(updated)
    }

    async fn update_status(&self, obj: Object) -> ApiResult<Object> {
        if let Some(schema) = self.registry.lookup(&obj.gvk()).and_then(|r| r.schema.clone()) {
            let mut candidate = self.store.get(&obj.key()).await?;
            candidate.status = obj.status.clone();
            schema.validate(&candidate)?;
        }
        let updated = self.store.update_status(obj).await?;
        counter!("api_requests_total", 1u64, "op" => "update_status");
        debug!(key = %updated.key(), rv = ?updated.resource_version(), "api: status updated");
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> ApiResult<DeleteOutcome> {
        if let Some(reg) = self.registry.lookup(&key.gvk) {
            let old = self.store.get(key).await?;
            self.admit(&reg, AdmissionRequest::delete(old, self.user.clone())).await?;
        }
        let out = self.store.delete(key).await?;
        counter!("api_requests_total", 1u64, "op" => "delete");
        info!(key = %key, pending = matches!(out, DeleteOutcome::Pending(_)), "api: deleted");
        Ok(out)
    }

    async fn get(&self, key: &ResourceKey) -> ApiResult<Object> { Ok(self.store.get(key).await?) }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> ApiResult<Vec<Object>> {
        Ok(self.store.list(gvk, namespace).await?)
    }

    async fn dry_run(&self, obj: Object) -> ApiResult<DryRun> {
        let operation = match self.store.get(&obj.key()).await {
            Ok(_) => Operation::Update,
            Err(StoreError::NotFound(_)) => Operation::Create,
            Err(e) => return Err(e.into()),
        };
        let mut obj = obj;
        if operation == Operation::Update && obj.resource_version().is_none() {
            obj.metadata.resource_version = self.store.get(&obj.key()).await?.resource_version();
        }
        let (object, warnings) = self.prepare(operation, obj, true).await?;
        debug!(key = %object.key(), op = %operation, "api: dry run admitted");
        Ok(DryRun { operation, object, warnings })
    }
}
