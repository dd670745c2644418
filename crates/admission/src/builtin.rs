use async_trait::async_trait;
use keel_schema::{extract_path, set_path};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::hook::{HookError, MutatingHook, ValidatingHook};
use crate::request::{AdmissionRequest, Mutation, Verdict};

const DEFAULT_REGISTRIES: &[&str] = &["docker.io", "gcr.io", "k8s.gcr.io", "quay.io", "registry.k8s.io", "ghcr.io"];
const DEFAULT_BLOCKED_TAGS: &[&str] = &["latest"];

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap());
// First path component is a registry host when it has a dot, a port, or is localhost.
static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(localhost|[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+)(:[0-9]+)?$|^[A-Za-z0-9-]+:[0-9]+$").unwrap()
});

/// Containers of a pod (`spec`) or of a pod template (`spec.template.spec`),
/// init containers included.
fn containers(obj_spec: &Value) -> Vec<&Value> {
    let pod = match extract_path(obj_spec, "template.spec") {
        Some(p) => p,
        None => obj_spec,
    };
    ["containers", "initContainers"]
        .iter()
        .filter_map(|k| pod.get(*k).and_then(Value::as_array))
        .flatten()
        .collect()
}

fn container_name(c: &Value) -> &str { c.get("name").and_then(Value::as_str).unwrap_or("unknown") }

/// Every container must run as non-root. `strict` additionally requires
/// `allowPrivilegeEscalation=false` and `readOnlyRootFilesystem=true`.
#[derive(Debug, Clone, Default)]
pub struct RunAsNonRoot {
    strict: bool,
}

impl RunAsNonRoot {
    pub fn new() -> Self { Self { strict: false } }

    pub fn strict() -> Self { Self { strict: true } }

    fn check(&self, pod_level: bool, c: &Value) -> Option<String> {
        let sc = c.get("securityContext");
        let flag = |k: &str| sc.and_then(|s| s.get(k)).and_then(Value::as_bool);
        let mut missing = Vec::new();
        if !flag("runAsNonRoot").unwrap_or(pod_level) {
            missing.push("runAsNonRoot=true");
        }
        if self.strict {
            if flag("allowPrivilegeEscalation").unwrap_or(true) {
                missing.push("allowPrivilegeEscalation=false");
            }
            if !flag("readOnlyRootFilesystem").unwrap_or(false) {
                missing.push("readOnlyRootFilesystem=true");
            }
        }
        if missing.is_empty() {
            None
        } else {
            Some(format!("Container '{}' must set {}", container_name(c), missing.join(", ")))
        }
    }
}

#[async_trait]
impl ValidatingHook for RunAsNonRoot {
    fn name(&self) -> &str { "run-as-non-root" }

    async fn validate(&self, req: &AdmissionRequest) -> Result<Verdict, HookError> {
        let Some(obj) = &req.object else { return Ok(Verdict::allow()) };
        let pod_spec = extract_path(&obj.spec, "template.spec").unwrap_or(&obj.spec);
        let pod_level = extract_path(pod_spec, "securityContext.runAsNonRoot").and_then(Value::as_bool).unwrap_or(false);
        for c in containers(&obj.spec) {
            if let Some(msg) = self.check(pod_level, c) {
                return Ok(Verdict::deny(msg));
            }
        }
        Ok(Verdict::allow())
    }
}

/// Registry, host and tag of an image reference. An untagged, undigested
/// reference means `latest`; a reference without a registry host means `docker.io`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn effective_tag(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(t), _) => Some(t),
            (None, Some(_)) => None,
            (None, None) => Some("latest"),
        }
    }
}

/// Only pull from approved registries, never pull a blocked tag, and
/// optionally insist on cpu/memory requests and limits.
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    approved_registries: Vec<String>,
    blocked_tags: Vec<String>,
    require_resources: bool,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_REGISTRIES.iter().map(|s| s.to_string()).collect(),
            DEFAULT_BLOCKED_TAGS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl ImagePolicy {
    pub fn new(approved_registries: Vec<String>, blocked_tags: Vec<String>) -> Self {
        Self { approved_registries, blocked_tags, require_resources: false }
    }

    pub fn require_resources(mut self) -> Self {
        self.require_resources = true;
        self
    }

    pub fn parse(&self, image: &str) -> Option<ImageRef> {
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return None;
        }
        let (name, digest) = match image.split_once('@') {
            Some((n, d)) if !d.is_empty() => (n, Some(d.to_string())),
            Some(_) => return None,
            None => (image, None),
        };
        let (registry, rest) = match name.split_once('/') {
            Some((first, rest)) if HOST_RE.is_match(first) => (first.to_string(), rest),
            _ => ("docker.io".to_string(), name),
        };
        let last = rest.rsplit('/').next().unwrap_or(rest);
        let (repository, tag) = match last.rsplit_once(':') {
            Some((_, t)) => {
                if !TAG_RE.is_match(t) {
                    return None;
                }
                (rest[..rest.len() - t.len() - 1].to_string(), Some(t.to_string()))
            }
            None => (rest.to_string(), None),
        };
        if repository.is_empty() {
            return None;
        }
        Some(ImageRef { registry, repository, tag, digest })
    }

    fn violations(&self, c: &Value) -> Vec<String> {
        let name = container_name(c);
        let mut out = Vec::new();
        let image = c.get("image").and_then(Value::as_str).unwrap_or("");
        if image.is_empty() {
            out.push(format!("Container '{name}': Image is required"));
        } else {
            match self.parse(image) {
                None => out.push(format!("Container '{name}': invalid image reference '{image}'")),
                Some(r) => {
                    if !self.approved_registries.iter().any(|a| *a == r.registry) {
                        out.push(format!(
                            "Container '{name}': Registry '{}' not in approved list: {}",
                            r.registry,
                            self.approved_registries.join(", ")
                        ));
                    }
                    if let Some(tag) = r.effective_tag() {
                        if self.blocked_tags.iter().any(|b| b == tag) {
                            out.push(format!("Container '{name}': Tag '{tag}' is blocked. Use specific version tags."));
                        }
                    }
                }
            }
        }
        if self.require_resources {
            let missing: Vec<&str> = [
                ("limits.cpu", "CPU limits"),
                ("limits.memory", "memory limits"),
                ("requests.cpu", "CPU requests"),
                ("requests.memory", "memory requests"),
            ]
            .iter()
            .filter(|(path, _)| {
                c.get("resources").and_then(|r| extract_path(r, path)).map(|v| v.is_null() || v == "").unwrap_or(true)
            })
            .map(|(_, label)| *label)
            .collect();
            if !missing.is_empty() {
                out.push(format!("Container '{name}': Missing {}", missing.join(", ")));
            }
        }
        out
    }
}

#[async_trait]
impl ValidatingHook for ImagePolicy {
    fn name(&self) -> &str { "image-policy" }

    async fn validate(&self, req: &AdmissionRequest) -> Result<Verdict, HookError> {
        let Some(obj) = &req.object else { return Ok(Verdict::allow()) };
        let errors: Vec<String> = containers(&obj.spec).into_iter().flat_map(|c| self.violations(c)).collect();
        if errors.is_empty() {
            Ok(Verdict::allow())
        } else {
            Ok(Verdict::deny(errors.join(" | ")))
        }
    }
}

/// Fills absent fields with fixed values. Paths are rooted at the object,
/// e.g. `spec.owner`. Present fields, even `null` ones set explicitly, are left alone.
#[derive(Debug, Clone)]
pub struct SetDefaults {
    name: String,
    defaults: Vec<(String, Value)>,
}

impl SetDefaults {
    pub fn new(name: &str) -> Self { Self { name: name.to_string(), defaults: Vec::new() } }

    pub fn field(mut self, path: &str, value: Value) -> Self {
        self.defaults.push((path.to_string(), value));
        self
    }
}

#[async_trait]
impl MutatingHook for SetDefaults {
    fn name(&self) -> &str { &self.name }

    async fn mutate(&self, req: &AdmissionRequest) -> Result<Mutation, HookError> {
        let Some(obj) = &req.object else { return Ok(Mutation::unchanged()) };
        let mut doc = serde_json::to_value(obj).map_err(HookError::new)?;
        let mut changed = false;
        for (path, value) in &self.defaults {
            if extract_path(&doc, path).is_none() {
                if !set_path(&mut doc, path, value.clone()) {
                    return Err(HookError(format!("cannot default {path}")));
                }
                changed = true;
            }
        }
        if !changed {
            return Ok(Mutation::unchanged());
        }
        let patched = serde_json::from_value(doc).map_err(HookError::new)?;
        Ok(Mutation::patched(patched))
    }
}
