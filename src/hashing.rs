//! Content identity helpers.
//!
//! Every cache layer in the crate is keyed by SHA-256 of the thing it
//! describes: file bytes, embedding text, or a candidate's canonical JSON.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Serializes a JSON value with recursively sorted object keys and no
/// whitespace, so that equal values always hash equally regardless of the
/// key order they were built or parsed with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_hex_sha256() {
        assert_eq!(
            hash_bytes(b"ABC"),
            "b5d4045c3f466fa91fe2cc6abe79232a1a57cdf104f7a26e716e0a1e2789df78"
        );
        assert_eq!(hash_text("ABC"), hash_bytes(b"ABC"));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[2,{"d":1,"c":2}],"x":null}}"#)
            .unwrap();
        let b = json!({"a": {"x": null, "y": [2, {"c": 2, "d": 1}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&b),
            r#"{"a":{"x":null,"y":[2,{"c":2,"d":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_keeps_array_order() {
        assert_ne!(
            canonical_json(&json!([1, 2])),
            canonical_json(&json!([2, 1]))
        );
    }
}
