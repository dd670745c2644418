//! Minimal json-path grammar: dot-separated keys, each optionally followed by
//! a single `[index]`, e.g. `spec.containers[0].image`. Wildcards and filters
//! are not supported.

use serde_json::{Map, Value};

fn split_segment(seg: &str) -> Option<(&str, Option<usize>)> {
    match seg.find('[') {
        Some(open) => {
            let inner = seg.get(open + 1..)?.strip_suffix(']')?;
            if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some((seg.get(..open)?, Some(inner.parse().ok()?)))
        }
        None => Some((seg, None)),
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Accept `.spec.foo` or `spec.foo[0]`; returns the path without the leading dot.
pub fn normalize_json_path(jp: &str) -> Option<String> {
    let s = jp.strip_prefix('.').unwrap_or(jp);
    if s.is_empty() {
        return None;
    }
    for seg in s.split('.') {
        let (key, _) = split_segment(seg)?;
        if !valid_key(key) {
            return None;
        }
    }
    Some(s.to_string())
}

pub fn extract_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        let (key, idx) = split_segment(seg)?;
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

/// Write `value` at a dotted path, creating intermediate objects. Indexed
/// segments must point at existing array elements. Returns false when the
/// path cannot be written.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> bool {
    let segs: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segs.split_last() else { return false };
    let mut cur = root;
    for seg in parents {
        let Some((key, idx)) = split_segment(seg) else { return false };
        if cur.is_null() {
            *cur = Value::Object(Map::new());
        }
        let Some(map) = cur.as_object_mut() else { return false };
        let next = map.entry(key.to_string()).or_insert(Value::Null);
        cur = match idx {
            Some(i) => match next.as_array_mut().and_then(|a| a.get_mut(i)) {
                Some(v) => v,
                None => return false,
            },
            None => next,
        };
    }
    let Some((key, idx)) = split_segment(last) else { return false };
    if cur.is_null() {
        *cur = Value::Object(Map::new());
    }
    let Some(map) = cur.as_object_mut() else { return false };
    match idx {
        None => {
            map.insert(key.to_string(), value);
            true
        }
        Some(i) => match map.get_mut(key).and_then(|v| v.as_array_mut()).and_then(|a| a.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_accepts_simple_paths() {
        assert_eq!(normalize_json_path(".spec.foo"), Some("spec.foo".to_string()));
        assert_eq!(normalize_json_path("spec.dnsNames[0]"), Some("spec.dnsNames[0]".to_string()));
        assert!(normalize_json_path("").is_none());
        assert!(normalize_json_path("spec.*").is_none());
        assert!(normalize_json_path("spec.foo[0][1]").is_none());
        assert!(normalize_json_path("spec..foo").is_none());
        assert!(normalize_json_path("spec.foo[]").is_none());
    }

    #[test]
    fn extract_walks_objects_and_arrays() {
        let v = json!({ "spec": { "dnsNames": ["a.example.com", "b.example.com"], "replicas": 3 } });
        assert_eq!(extract_path(&v, "spec.dnsNames[1]"), Some(&json!("b.example.com")));
        assert_eq!(extract_path(&v, "spec.replicas"), Some(&json!(3)));
        assert_eq!(extract_path(&v, "spec.missing"), None);
        assert_eq!(extract_path(&v, "spec.replicas[0]"), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut v = Value::Null;
        assert!(set_path(&mut v, "spec.owner.name", json!("system")));
        assert_eq!(v, json!({ "spec": { "owner": { "name": "system" } } }));

        let mut v = json!({ "spec": { "containers": [{ "name": "a" }] } });
        assert!(set_path(&mut v, "spec.containers[0].imagePullPolicy", json!("Always")));
        assert_eq!(v["spec"]["containers"][0]["imagePullPolicy"], "Always");
        assert!(!set_path(&mut v, "spec.containers[3].name", json!("x")));
        assert!(!set_path(&mut v, "spec.containers.name", json!("x")), "array is not an object");
    }
}
