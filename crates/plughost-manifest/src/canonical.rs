//! Canonical manifest form (version 1).
//!
//! The manifest is converted to its JSON data model with the `signature`
//! block removed, then written as compact JSON with object keys sorted by
//! byte order and no insignificant whitespace. Strings use JSON escaping.
//! Two manifests that differ only in TOML formatting, key order or comments
//! produce the same bytes.

use serde_json::Value;

use crate::model::Manifest;

/// Canonical bytes of `manifest`, excluding its signature.
#[must_use]
pub fn canonical_bytes(manifest: &Manifest) -> Vec<u8> {
    let mut value = match serde_json::to_value(manifest) {
        Ok(v) => v,
        // The model only holds strings, integers, booleans and lists, all
        // of which map onto JSON.
        Err(_) => Value::Null,
    };
    if let Value::Object(map) = &mut value {
        map.remove("signature");
    }
    let mut out = Vec::with_capacity(512);
    write_value(&value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        },
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                if let Some(v) = map.get(key) {
                    write_value(v, out);
                }
            }
            out.push(b'}');
        },
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    match serde_json::to_string(s) {
        Ok(escaped) => out.extend_from_slice(escaped.as_bytes()),
        Err(_) => out.extend_from_slice(b"\"\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaLimits, check};

    const A: &str = r#"
name = "canon-test"
version = "0.1.0"
entryPoint = "run.sh"
description = "quote \" and unicode é"

[permissions]
queue = [{ topic = "a.b", mode = "both" }]

[isolationLimits]
maxHeapMb = 32

[signature]
algorithm = "ed25519"
value = "AAAA"
signer = "one"
"#;

    // Same content, different key order and formatting, different signature.
    const B: &str = r#"
# reordered
version = "0.1.0"
description = 'quote " and unicode é'
entryPoint = "run.sh"
name = "canon-test"
[isolationLimits]
maxHeapMb   = 32
[signature]
signer = "two"
value = "BBBB"
algorithm = "ed25519"
[permissions]
queue = [ { mode = "both", topic = "a.b" } ]
"#;

    fn parse(text: &str) -> Manifest {
        check(text, &SchemaLimits::default(), None).unwrap()
    }

    #[test]
    fn formatting_and_signature_do_not_matter() {
        assert_eq!(canonical_bytes(&parse(A)), canonical_bytes(&parse(B)));
    }

    #[test]
    fn content_changes_bytes() {
        let a = parse(A);
        let mut b = a.clone();
        b.isolation_limits.max_heap_mb = 33;
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn output_is_sorted_and_compact() {
        let bytes = canonical_bytes(&parse(A));
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains(": ") && !text.contains(", "));
        assert!(!text.contains('\n'));
        assert!(!text.contains("signature"));
        let desc = text.find("\"description\"").unwrap();
        let entry = text.find("\"entryPoint\"").unwrap();
        let name = text.find("\"name\"").unwrap();
        assert!(desc < entry && entry < name);
    }
}
