//! Keel registry: which kinds have custom behavior, and what that behavior is.
//! Reads are lock-free snapshots; registration swaps in a new table.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use keel_admission::{MutatingBinding, Pipeline, ValidatingBinding};
use keel_core::{Gvk, Reconciler};
use keel_schema::{CrdSchema, Schema, SchemaError};
use rustc_hash::FxHashMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already registered with a different schema")]
    SchemaConflict(Gvk),
    #[error("{0} is already registered with a different scope")]
    ScopeConflict(Gvk),
    #[error("{0} already has a reconciler")]
    DuplicateReconciler(Gvk),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Everything registered for one kind.
#[derive(Clone)]
pub struct Registration {
    pub gvk: Gvk,
    pub namespaced: bool,
    pub schema: Option<Arc<Schema>>,
    pub columns: Option<Arc<CrdSchema>>,
    pub reconciler: Option<Arc<dyn Reconciler>>,
    pub pipeline: Pipeline,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("gvk", &self.gvk)
            .field("namespaced", &self.namespaced)
            .field("schema", &self.schema.is_some())
            .field("reconciler", &self.reconciler.is_some())
            .field("mutating", &self.pipeline.mutating().len())
            .field("validating", &self.pipeline.validating().len())
            .finish()
    }
}

/// Builder handed to [`Registry::register`].
pub struct Kind {
    gvk: Gvk,
    /// `None` until a scope is stated; first registration defaults to namespaced.
    namespaced: Option<bool>,
    schema: Option<Schema>,
    crd: Option<CrdSchema>,
    reconciler: Option<Arc<dyn Reconciler>>,
    mutating: Vec<MutatingBinding>,
    validating: Vec<ValidatingBinding>,
}

impl Kind {
    pub fn new(gvk: Gvk) -> Self {
        Self {
            gvk,
            namespaced: None,
            schema: None,
            crd: None,
            reconciler: None,
            mutating: Vec::new(),
            validating: Vec::new(),
        }
    }

    /// Kind, scope, schema and printer columns taken from a CRD manifest.
    pub fn from_crd(crd: CrdSchema) -> Result<Self, SchemaError> {
        let mut kind = Self::new(crd.gvk.clone());
        kind.namespaced = Some(crd.namespaced);
        kind.schema = crd.compile()?;
        kind.crd = Some(crd);
        Ok(kind)
    }

    pub fn namespaced(mut self) -> Self {
        self.namespaced = Some(true);
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = Some(false);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn reconciler(mut self, r: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(r);
        self
    }

    pub fn mutating(mut self, b: MutatingBinding) -> Self {
        self.mutating.push(b);
        self
    }

    pub fn validating(mut self, b: ValidatingBinding) -> Self {
        self.validating.push(b);
        self
    }
}

type Table = FxHashMap<Gvk, Arc<Registration>>;

#[derive(Default)]
pub struct Registry {
    table: ArcSwap<Table>,
    // serializes writers; readers never take it
    write: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Register or extend a kind. Registering the same kind again appends its
    /// hooks after the existing ones. A schema that differs from the one already
    /// registered, or a second reconciler, is rejected.
    pub fn register(&self, kind: Kind) -> Result<Arc<Registration>, RegistryError> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.table.load_full();
        let merged = match current.get(&kind.gvk) {
            None => Registration {
                gvk: kind.gvk.clone(),
                namespaced: kind.namespaced.unwrap_or(true),
                schema: kind.schema.map(Arc::new),
                columns: kind.crd.map(Arc::new),
                reconciler: kind.reconciler,
                pipeline: Pipeline::new(kind.mutating, kind.validating),
            },
            Some(prev) => {
                let schema = match (&prev.schema, kind.schema) {
                    (Some(a), Some(b)) if **a != b => return Err(RegistryError::SchemaConflict(kind.gvk)),
                    (Some(a), _) => Some(a.clone()),
                    (None, b) => b.map(Arc::new),
                };
                if kind.namespaced.is_some_and(|n| n != prev.namespaced) {
                    return Err(RegistryError::ScopeConflict(kind.gvk));
                }
                if prev.reconciler.is_some() && kind.reconciler.is_some() {
                    return Err(RegistryError::DuplicateReconciler(kind.gvk));
                }
                let mut mutating = prev.pipeline.mutating().to_vec();
                mutating.extend(kind.mutating);
                let mut validating = prev.pipeline.validating().to_vec();
                validating.extend(kind.validating);
                Registration {
                    gvk: kind.gvk.clone(),
                    namespaced: prev.namespaced,
                    schema,
                    columns: prev.columns.clone().or(kind.crd.map(Arc::new)),
                    reconciler: prev.reconciler.clone().or(kind.reconciler),
                    pipeline: Pipeline::new(mutating, validating),
                }
            }
        };
        let merged = Arc::new(merged);
        let mut next: Table = (*current).clone();
        next.insert(kind.gvk.clone(), merged.clone());
        self.table.store(Arc::new(next));
        info!(gvk = %kind.gvk, reconciler = merged.reconciler.is_some(), hooks = merged.pipeline.mutating().len() + merged.pipeline.validating().len(), "kind registered");
        Ok(merged)
    }

    /// `None` means unregistered: the kind has no custom behavior and passes through.
    pub fn lookup(&self, gvk: &Gvk) -> Option<Arc<Registration>> { self.table.load().get(gvk).cloned() }

    pub fn kinds(&self) -> Vec<Gvk> {
        let mut out: Vec<Gvk> = self.table.load().keys().cloned().collect();
        out.sort();
        out
    }

    /// Kinds that have a reconciler, in a stable order.
    pub fn reconciled(&self) -> Vec<Arc<Registration>> {
        let mut out: Vec<Arc<Registration>> =
            self.table.load().values().filter(|r| r.reconciler.is_some()).cloned().collect();
        out.sort_by(|a, b| a.gvk.cmp(&b.gvk));
        out
    }
}
