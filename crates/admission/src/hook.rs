use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::request::{AdmissionRequest, Mutation, Operation, Verdict};

/// Error raised by a hook implementation (transport failure, bad payload, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(e: impl fmt::Display) -> Self { Self(e.to_string()) }
}

/// May rewrite the incoming object. Cannot reject: a mutating hook transforms,
/// it does not gate. Failures are handled by the binding's failure policy.
#[async_trait]
pub trait MutatingHook: Send + Sync {
    fn name(&self) -> &str;
    async fn mutate(&self, req: &AdmissionRequest) -> Result<Mutation, HookError>;
}

/// Accepts or rejects; never changes the object.
#[async_trait]
pub trait ValidatingHook: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self, req: &AdmissionRequest) -> Result<Verdict, HookError>;
}

/// What happens when a hook errors, panics or exceeds its timeout.
/// There is no default: every binding states it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject the whole request.
    FailClosed,
    /// Treat the hook as having allowed the request (and changed nothing).
    FailOpen,
}

/// A hook together with its per-call settings.
pub struct HookBinding<H: ?Sized> {
    pub hook: Arc<H>,
    pub timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub operations: Vec<Operation>,
    /// Requests in these namespaces skip the hook.
    pub exempt_namespaces: Vec<String>,
}

pub type MutatingBinding = HookBinding<dyn MutatingHook>;
pub type ValidatingBinding = HookBinding<dyn ValidatingHook>;

impl<H: ?Sized> Clone for HookBinding<H> {
    fn clone(&self) -> Self {
        Self {
            hook: Arc::clone(&self.hook),
            timeout: self.timeout,
            failure_policy: self.failure_policy,
            operations: self.operations.clone(),
            exempt_namespaces: self.exempt_namespaces.clone(),
        }
    }
}

impl<H: ?Sized> HookBinding<H> {
    /// Bind for all operations.
    pub fn new(hook: Arc<H>, timeout: Duration, failure_policy: FailurePolicy) -> Self {
        Self {
            hook,
            timeout,
            failure_policy,
            operations: vec![Operation::Create, Operation::Update, Operation::Delete],
            exempt_namespaces: Vec::new(),
        }
    }

    pub fn for_operations(mut self, ops: &[Operation]) -> Self {
        self.operations = ops.to_vec();
        self
    }

    pub fn exempt_namespace(mut self, ns: &str) -> Self {
        self.exempt_namespaces.push(ns.to_string());
        self
    }

    pub fn applies_to(&self, req: &AdmissionRequest) -> bool {
        self.operations.contains(&req.operation)
            && !req.namespace.as_ref().map(|ns| self.exempt_namespaces.contains(ns)).unwrap_or(false)
    }
}

impl MutatingBinding {
    pub fn mutating<T: MutatingHook + 'static>(hook: T, timeout: Duration, failure_policy: FailurePolicy) -> Self {
        Self::new(Arc::new(hook), timeout, failure_policy)
    }

    pub fn name(&self) -> &str { self.hook.name() }
}

impl ValidatingBinding {
    pub fn validating<T: ValidatingHook + 'static>(hook: T, timeout: Duration, failure_policy: FailurePolicy) -> Self {
        Self::new(Arc::new(hook), timeout, failure_policy)
    }

    pub fn name(&self) -> &str { self.hook.name() }
}
