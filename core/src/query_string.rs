//! Query-string encoding for nested parameter structures.
//!
//! # Design
//! Nested maps become bracketed key paths (`parent[child]`), sequences become
//! indexed paths (`parent[0]`), and `null` keeps its key with an empty value.
//! No percent-escaping is performed — the provider side is expected to be
//! tolerant of raw values, and escaping policy belongs to the transport
//! layer if a host needs one. Pure function, no failure modes: anything that
//! is not a map or a sequence is stringified as a scalar.

use serde_json::{Map, Value};

/// Serialize a parameter mapping into a single `key=value&...` query string.
pub fn encode(params: &Map<String, Value>) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        push_pairs(value, key, &mut pairs);
    }
    pairs.join("&")
}

fn push_pairs(value: &Value, key: &str, out: &mut Vec<String>) {
    match value {
        Value::Null => out.push(format!("{key}=")),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                push_pairs(item, &format!("{key}[{index}]"), out);
            }
        }
        Value::Object(map) => {
            for (child, item) in map {
                push_pairs(item, &format!("{key}[{child}]"), out);
            }
        }
        Value::String(s) => out.push(format!("{key}={s}")),
        other => out.push(format!("{key}={other}")),
    }
}
