//! Multi-document YAML manifests.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use keel_core::Object;
use keel_schema::CrdSchema;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::warn;

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// One document from a manifest.
#[derive(Debug, Clone)]
pub enum Doc {
    Crd(CrdSchema),
    Object(Object),
}

pub fn load(path: &Path) -> Result<Vec<Doc>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(text: &str) -> Result<Vec<Doc>> {
    if text.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("document {}", i + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("document {} too complex (>{} nodes)", i + 1, max_yaml_nodes()));
        }
        out.push(to_doc(json).with_context(|| format!("document {}", i + 1))?);
    }
    Ok(out)
}

fn to_doc(json: Json) -> Result<Doc> {
    if CrdSchema::is_crd(&json) {
        return Ok(Doc::Crd(CrdSchema::from_crd(&json)?));
    }
    let top = json.as_object().ok_or_else(|| anyhow!("document is not a mapping"))?;
    for key in ["apiVersion", "kind"] {
        if !top.get(key).map(Json::is_string).unwrap_or(false) {
            return Err(anyhow!("missing {key}"));
        }
    }
    for key in top.keys() {
        if !matches!(key.as_str(), "apiVersion" | "kind" | "metadata" | "spec" | "status") {
            warn!(field = %key, "manifest: ignoring top-level field");
        }
    }
    let obj: Object = serde_json::from_value(json).context("decoding object")?;
    if obj.metadata.name.is_empty() {
        return Err(anyhow!("missing metadata.name"));
    }
    Ok(Doc::Object(obj))
}
