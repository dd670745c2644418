//! Keel core types: object model, store contract and reconciler contract.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;

mod reconcile;
mod store;

pub use reconcile::{Action, Context, ReconcileError, Reconciler};
pub use store::{DeleteOutcome, ResourceStore, StoreError, StoreResult, WatchEvent, WatchStream};

pub mod prelude {
    pub use super::{
        Action, Condition, ConditionStatus, Context, DeleteOutcome, Gvk, Object, ObjectMeta, ReconcileError,
        Reconciler, ResourceKey, ResourceStore, ResourceVersion, StoreError, StoreResult, WatchEvent,
    };
}

/// Group/Version/Kind triple. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` (`v1` or `group/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(group, version, kind)),
            _ => None,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Identity of a single object. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.gvk, ns, self.name),
            None => write!(f, "{}/{}", self.gvk, self.name),
        }
    }
}

/// Opaque, strictly increasing write token. Serialized as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceVersion(pub u64);

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl FromStr for ResourceVersion {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { s.parse::<u64>().map(Self) }
}

impl Serialize for ResourceVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw { Str(String), Num(u64) }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(Self(n)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,
    /// Bumped by the store on spec changes only.
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set means "pending delete"; erased once `finalizers` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub finalizers: SmallVec<[String; 2]>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

/// A versioned document: metadata, desired `spec`, observed `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl Object {
    pub fn new(gvk: &Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.map(|s| s.to_string()),
                ..Default::default()
            },
            spec: Value::Null,
            status: Value::Null,
        }
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(&self.api_version, &self.kind) }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.gvk(), self.metadata.namespace.as_deref(), &self.metadata.name)
    }

    pub fn resource_version(&self) -> Option<ResourceVersion> { self.metadata.resource_version }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Owner reference pointing at this object, for children a reconciler creates.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: true,
        }
    }

    /// Decode `spec` into a typed structure.
    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.spec.clone())
    }

    /// Decode `status`; `None` while nothing has been observed yet.
    pub fn status_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        if self.status.is_null() { return Ok(None); }
        serde_json::from_value(self.status.clone()).map(Some)
    }

    /// Replace `status` with `value`, keeping any recorded conditions.
    pub fn set_status<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let mut next = serde_json::to_value(value)?;
        let conditions = self.status.get("conditions").cloned();
        if let (Some(conds), Some(map)) = (conditions, next.as_object_mut()) {
            map.entry("conditions").or_insert(conds);
        }
        self.status = next;
        Ok(())
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.status
            .get("conditions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn condition(&self, type_: &str) -> Option<Condition> {
        self.conditions().into_iter().find(|c| c.type_ == type_)
    }

    /// Upsert a condition by type. The transition time only moves when the status flips.
    pub fn set_condition(&mut self, mut cond: Condition) {
        let mut conds = self.conditions();
        match conds.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time;
                }
                *existing = cond;
            }
            None => conds.push(cond),
        }
        self.write_conditions(conds);
    }

    /// Returns true if a condition of that type was present.
    pub fn remove_condition(&mut self, type_: &str) -> bool {
        let mut conds = self.conditions();
        let before = conds.len();
        conds.retain(|c| c.type_ != type_);
        if conds.len() == before { return false; }
        self.write_conditions(conds);
        true
    }

    fn write_conditions(&mut self, conds: Vec<Condition>) {
        if !self.status.is_object() {
            self.status = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.status.as_object_mut() {
            map.insert("conditions".to_string(), serde_json::to_value(conds).unwrap_or(Value::Null));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Status condition entry, the only place asynchronous failures surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: &str, observed_generation: i64) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
            last_transition_time: Some(Utc::now()),
        }
    }
}
