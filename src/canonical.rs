//! Canonical JSON serialization and content fingerprints.
//!
//! Example upserts match source records to destination records by the
//! SHA-256 of their canonical-JSON inputs, so the serialization must be
//! byte-stable: object keys sorted, array order preserved, no insignificant
//! whitespace. Numbers use serde_json's default rendering (the flow never
//! carries NaN/Inf).

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value with sorted object keys and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut tree = BTreeMap::new();
            for (k, v) in map {
                tree.insert(k, to_canonical_json(v));
            }
            let items: Vec<String> = tree
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(&k).unwrap_or_default(), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// SHA-256 hex digest of the canonical serialization.
///
/// This is the upsert matching key for example inputs: stable under key
/// reordering and formatting differences between the two instances.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(value).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sorted_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(to_canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_key_order_invariance() {
        let a: Value = serde_json::from_str(r#"{"q": 1, "context": {"x": [1, 2], "y": null}}"#)
            .expect("parse");
        let b: Value = serde_json::from_str(r#"{"context": {"y": null, "x": [1, 2]}, "q": 1}"#)
            .expect("parse");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_whitespace_invariance() {
        let a: Value = serde_json::from_str(r#"{ "q" : 1 }"#).expect("parse");
        let b: Value = serde_json::from_str(r#"{"q":1}"#).expect("parse");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_array_order_preserved() {
        let a = json!({"items": [1, 2, 3]});
        let b = json!({"items": [3, 2, 1]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_string_escaping() {
        let a = json!({"text": "line\nbreak \"quoted\""});
        assert_eq!(
            to_canonical_json(&a),
            r#"{"text":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn test_fingerprint_shape() {
        let digest = fingerprint(&json!({"q": 1}));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    quickcheck! {
        fn prop_canonical_stable_under_reparse(pairs: Vec<(String, i64)>) -> bool {
            let mut obj = serde_json::Map::new();
            for (k, v) in pairs {
                obj.insert(k, json!(v));
            }
            let value = Value::Object(obj);
            let canonical = to_canonical_json(&value);
            let reparsed: Value = match serde_json::from_str(&canonical) {
                Ok(v) => v,
                Err(_) => return false,
            };
            to_canonical_json(&reparsed) == canonical
        }
    }
}
