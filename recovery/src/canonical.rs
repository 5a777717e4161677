//! Canonical JSON encoding and content hashing
//!
//! Object keys are emitted in sorted order at every depth so equal values
//! always produce identical bytes, checksums and diffs.

use serde_json::{Map, Value};

/// Copy of `value` with every object's keys sorted
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical encoding
pub fn to_canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Pretty canonical encoding, one scalar per line
pub fn to_canonical_pretty(value: &Value) -> String {
    serde_json::to_string_pretty(&canonicalize(value)).unwrap_or_else(|_| value.to_string())
}

/// BLAKE3 hex digest of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Checksum of a value's canonical encoding
pub fn value_checksum(value: &Value) -> String {
    checksum(to_canonical_string(value).as_bytes())
}
