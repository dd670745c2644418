//! Keel admission: every Create/Update/Delete passes through mutating hooks,
//! then validating hooks, before it may reach the store.

#![forbid(unsafe_code)]

mod builtin;
mod hook;
mod pipeline;
mod request;
pub mod review;

pub use builtin::{ImagePolicy, ImageRef, RunAsNonRoot, SetDefaults};
pub use hook::{FailurePolicy, HookBinding, HookError, MutatingBinding, MutatingHook, ValidatingBinding, ValidatingHook};
pub use pipeline::{Admitted, Pipeline};
pub use request::{AdmissionRequest, Mutation, Operation, UserInfo, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// A validating hook said no. The reason goes back to the submitter verbatim.
    #[error("admission denied by {hook}: {reason}")]
    Denied { hook: String, reason: String },
    /// A fail-closed hook errored, panicked or timed out.
    #[error("admission hook {hook} failed: {reason}")]
    HookFailed { hook: String, reason: String },
}

impl AdmissionError {
    pub fn hook(&self) -> &str {
        match self {
            AdmissionError::Denied { hook, .. } | AdmissionError::HookFailed { hook, .. } => hook,
        }
    }
}
