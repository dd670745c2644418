use std::fmt;

use keel_core::{Gvk, Object};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Who submitted the write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl UserInfo {
    pub fn new(username: &str) -> Self { Self { username: username.to_string(), groups: Vec::new() } }
}

/// One write under review. Built per request, dropped after the decision.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    pub uid: String,
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
    pub operation: Operation,
    /// Stored object; `None` for CREATE.
    pub old_object: Option<Object>,
    /// Incoming object; `None` for DELETE.
    pub object: Option<Object>,
    pub user_info: UserInfo,
    pub dry_run: bool,
}

impl AdmissionRequest {
    fn build(operation: Operation, anchor: &Object, old: Option<Object>, new: Option<Object>, user: UserInfo) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            gvk: anchor.gvk(),
            namespace: anchor.metadata.namespace.clone(),
            name: anchor.metadata.name.clone(),
            operation,
            old_object: old,
            object: new,
            user_info: user,
            dry_run: false,
        }
    }

    pub fn create(object: Object, user: UserInfo) -> Self {
        Self::build(Operation::Create, &object, None, Some(object.clone()), user)
    }

    pub fn update(old: Object, object: Object, user: UserInfo) -> Self {
        Self::build(Operation::Update, &object, Some(old), Some(object.clone()), user)
    }

    pub fn delete(old: Object, user: UserInfo) -> Self {
        Self::build(Operation::Delete, &old, Some(old.clone()), None, user)
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Decision of a validating hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Required when `allowed` is false.
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn allow() -> Self { Self { allowed: true, reason: None, warnings: Vec::new() } }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()), warnings: Vec::new() }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Result of a mutating hook: a replacement object or nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub object: Option<Object>,
    pub warnings: Vec<String>,
}

impl Mutation {
    pub fn unchanged() -> Self { Self::default() }

    pub fn patched(object: Object) -> Self { Self { object: Some(object), warnings: Vec::new() } }
}
