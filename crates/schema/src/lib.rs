//! Keel schema: structural validation of objects before admission, CRD
//! manifest loading, printer columns and a small json-path grammar.

#![forbid(unsafe_code)]

use std::fmt;

use jsonschema::{Draft, JSONSchema};
use keel_core::{Gvk, Object};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

mod path;

pub use path::{extract_path, normalize_json_path, set_path};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub error: String,
    pub hint: Option<String>,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        write!(f, "{}: {}", path, self.error)?;
        if let Some(h) = &self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

fn join_issues(issues: &[Issue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The schema document itself does not compile.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    /// The CRD manifest is missing required pieces.
    #[error("invalid crd: {0}")]
    InvalidCrd(String),
    /// The object does not match its kind's schema.
    #[error("{object} rejected by schema: {}", join_issues(.issues))]
    Invalid { object: String, issues: Vec<Issue> },
}

impl SchemaError {
    pub fn issues(&self) -> &[Issue] {
        match self {
            SchemaError::Invalid { issues, .. } => issues,
            _ => &[],
        }
    }
}

fn hint_for(error: &str) -> Option<String> {
    if error.contains("is a required property") {
        Some("missing required field".into())
    } else if error.contains("is not of type") {
        Some("mismatched type".into())
    } else if error.contains("is not one of") {
        Some("value not in allowed set".into())
    } else if error.contains("minimum") || error.contains("maximum") {
        Some("value out of range".into())
    } else {
        None
    }
}

/// Compiled structural schema for one kind (an OpenAPI v3 / JSON Schema document
/// describing the whole object).
pub struct Schema {
    source: Value,
    compiled: JSONSchema,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("source", &self.source).finish()
    }
}

/// Two schemas are the same when their source documents are.
impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool { self.source == other.source }
}

impl Schema {
    pub fn compile(source: Value) -> Result<Self, SchemaError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&source)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self { source, compiled })
    }

    pub fn source(&self) -> &Value { &self.source }

    /// Collect every violation; empty on success.
    pub fn issues(&self, instance: &Value) -> Vec<Issue> {
        match self.compiled.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|err| {
                    let error = err.to_string();
                    Issue { path: err.instance_path.to_string(), hint: hint_for(&error), error }
                })
                .collect(),
        }
    }

    pub fn validate(&self, obj: &Object) -> Result<(), SchemaError> {
        let instance = serde_json::to_value(obj).map_err(|e| SchemaError::Invalid {
            object: obj.key().to_string(),
            issues: vec![Issue { path: String::new(), error: e.to_string(), hint: None }],
        })?;
        let issues = self.issues(&instance);
        if issues.is_empty() {
            return Ok(());
        }
        debug!(object = %obj.key(), issues = issues.len(), "schema: rejected");
        Err(SchemaError::Invalid { object: obj.key().to_string(), issues })
    }

    /// Validate, then decode `spec` into its typed form.
    pub fn validate_typed<S: DeserializeOwned>(&self, obj: &Object) -> Result<S, SchemaError> {
        self.validate(obj)?;
        obj.spec_as::<S>().map_err(|e| SchemaError::Invalid {
            object: obj.key().to_string(),
            issues: vec![Issue { path: "/spec".into(), error: e.to_string(), hint: Some("mismatched type".into()) }],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterCol {
    pub name: String,
    pub json_path: String,
}

/// What a CustomResourceDefinition manifest says about one served version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdSchema {
    pub gvk: Gvk,
    pub namespaced: bool,
    pub open_api: Option<Value>,
    pub printer_cols: Vec<PrinterCol>,
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> { v.get(key).and_then(|s| s.as_str()) }

fn flag_at(v: &Value, key: &str) -> bool { v.get(key).and_then(|b| b.as_bool()).unwrap_or(false) }

fn printer_cols_of(cols: Option<&Value>) -> Vec<PrinterCol> {
    let mut out = Vec::new();
    for c in cols.and_then(|c| c.as_array()).into_iter().flatten() {
        let name = str_at(c, "name").unwrap_or("");
        let raw = str_at(c, "jsonPath").unwrap_or("");
        if name.is_empty() {
            continue;
        }
        if let Some(jp) = normalize_json_path(raw) {
            out.push(PrinterCol { name: name.to_string(), json_path: jp });
        }
    }
    out
}

impl CrdSchema {
    /// Read an `apiextensions.k8s.io/v1` CustomResourceDefinition (as JSON).
    /// Picks the storage version, else the first served one, else the first listed.
    pub fn from_crd(crd: &Value) -> Result<Self, SchemaError> {
        let spec = crd.get("spec").ok_or_else(|| SchemaError::InvalidCrd("missing spec".into()))?;
        let group = str_at(spec, "group").ok_or_else(|| SchemaError::InvalidCrd("missing spec.group".into()))?;
        let kind = spec
            .get("names")
            .and_then(|n| str_at(n, "kind"))
            .ok_or_else(|| SchemaError::InvalidCrd("missing spec.names.kind".into()))?;
        let namespaced = str_at(spec, "scope").map(|s| s == "Namespaced").unwrap_or(true);
        let versions = spec.get("versions").and_then(|vv| vv.as_array()).cloned().unwrap_or_default();
        let chosen = versions
            .iter()
            .find(|v| flag_at(v, "storage"))
            .or_else(|| versions.iter().find(|v| flag_at(v, "served")))
            .or_else(|| versions.first())
            .ok_or_else(|| SchemaError::InvalidCrd(format!("{}/{} has no versions", group, kind)))?;
        let version = str_at(chosen, "name").ok_or_else(|| SchemaError::InvalidCrd("version without name".into()))?;

        let open_api = chosen
            .get("schema")
            .and_then(|s| s.get("openAPIV3Schema"))
            .or_else(|| spec.get("validation").and_then(|s| s.get("openAPIV3Schema")))
            .cloned();
        let mut printer_cols = printer_cols_of(chosen.get("additionalPrinterColumns"));
        if printer_cols.is_empty() {
            printer_cols = printer_cols_of(spec.get("additionalPrinterColumns"));
        }
        Ok(Self { gvk: Gvk::new(group, version, kind), namespaced, open_api, printer_cols })
    }

    pub fn is_crd(doc: &Value) -> bool {
        str_at(doc, "kind") == Some("CustomResourceDefinition")
            && str_at(doc, "apiVersion").map(|v| v.starts_with("apiextensions.k8s.io/")).unwrap_or(false)
    }

    /// Compile `openAPIV3Schema`, if the version carries one.
    pub fn compile(&self) -> Result<Option<Schema>, SchemaError> {
        self.open_api.clone().map(Schema::compile).transpose()
    }

    /// Render printer columns for `obj`; missing values render as `<none>`.
    pub fn columns(&self, obj: &Object) -> Vec<(String, String)> {
        let raw = serde_json::to_value(obj).unwrap_or(Value::Null);
        self.printer_cols
            .iter()
            .map(|c| {
                let rendered = match extract_path(&raw, &c.json_path) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    Some(Value::Bool(b)) => b.to_string(),
                    _ => "<none>".to_string(),
                };
                (c.name.clone(), rendered)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "required": ["replicas"],
                    "properties": {
                        "replicas": { "type": "integer", "minimum": 1 },
                        "owner": { "type": "string" }
                    }
                }
            }
        })
    }

    fn widget(spec: Value) -> Object {
        Object::new(&Gvk::new("example.com", "v1", "Widget"), Some("default"), "w").with_spec(spec)
    }

    #[test]
    fn accepts_well_typed_objects() {
        let schema = Schema::compile(widget_schema()).unwrap();
        assert!(schema.validate(&widget(json!({"replicas": 3}))).is_ok());
    }

    #[test]
    fn reports_each_violation_with_a_hint() {
        let schema = Schema::compile(widget_schema()).unwrap();
        let err = schema.validate(&widget(json!({"replicas": 0}))).unwrap_err();
        assert_eq!(err.issues().len(), 1);
        assert_eq!(err.issues()[0].path, "/spec/replicas");
        assert_eq!(err.issues()[0].hint.as_deref(), Some("value out of range"));

        let err = schema.validate(&widget(json!({"owner": 5}))).unwrap_err();
        let hints: Vec<_> = err.issues().iter().filter_map(|i| i.hint.clone()).collect();
        assert!(hints.contains(&"missing required field".to_string()));
        assert!(hints.contains(&"mismatched type".to_string()));
        assert!(err.to_string().contains("example.com/v1/Widget/default/w"));
    }

    #[test]
    fn typed_decode_after_validation() {
        #[derive(Deserialize)]
        struct WidgetSpec { replicas: u32, owner: Option<String> }
        let schema = Schema::compile(widget_schema()).unwrap();
        let spec: WidgetSpec = schema.validate_typed(&widget(json!({"replicas": 2}))).unwrap();
        assert_eq!(spec.replicas, 2);
        assert!(spec.owner.is_none());
    }

    #[test]
    fn bad_schema_does_not_compile() {
        assert!(matches!(Schema::compile(json!({"type": 12})), Err(SchemaError::InvalidSchema(_))));
    }

    #[test]
    fn schema_equality_follows_source() {
        let a = Schema::compile(widget_schema()).unwrap();
        let b = Schema::compile(widget_schema()).unwrap();
        let c = Schema::compile(json!({"type": "object"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn crd_prefers_storage_version_and_reads_columns() {
        let crd = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "crontabs.stable.example.com" },
            "spec": {
                "group": "stable.example.com",
                "scope": "Namespaced",
                "names": { "kind": "CronTab", "plural": "crontabs" },
                "versions": [
                    { "name": "v1beta1", "served": true, "storage": false },
                    {
                        "name": "v1", "served": true, "storage": true,
                        "schema": { "openAPIV3Schema": { "type": "object", "properties": { "spec": { "type": "object", "properties": { "cronSpec": { "type": "string" } } } } } },
                        "additionalPrinterColumns": [
                            { "name": "Spec", "jsonPath": ".spec.cronSpec", "type": "string" },
                            { "name": "Bad", "jsonPath": ".spec.items[*].x", "type": "string" }
                        ]
                    }
                ]
            }
        });
        assert!(CrdSchema::is_crd(&crd));
        let s = CrdSchema::from_crd(&crd).unwrap();
        assert_eq!(s.gvk, Gvk::new("stable.example.com", "v1", "CronTab"));
        assert!(s.namespaced);
        assert_eq!(s.printer_cols, vec![PrinterCol { name: "Spec".into(), json_path: "spec.cronSpec".into() }]);
        assert!(s.compile().unwrap().is_some());

        let obj = Object::new(&s.gvk, Some("default"), "c").with_spec(json!({"cronSpec": "* * * * */5"}));
        assert_eq!(s.columns(&obj), vec![("Spec".to_string(), "* * * * */5".to_string())]);
    }

    #[test]
    fn crd_without_versions_is_rejected() {
        let crd = json!({ "spec": { "group": "g", "names": { "kind": "K" }, "versions": [] } });
        assert!(matches!(CrdSchema::from_crd(&crd), Err(SchemaError::InvalidCrd(_))));
    }
}
