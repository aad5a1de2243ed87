//! Key-name conversion between the local (camelCase) and wire (snake_case)
//! naming conventions.
//!
//! # Design
//! `to_local` and `to_wire` are each other's structural mirror: both recurse
//! through maps and sequences, transform every map key, and leave scalar
//! values untouched. One dedicated rule rides along with the generic case
//! transform: the wire identity field `id` becomes the local field `guid` on
//! the way in, and `guid` becomes `id` on the way out, at every nesting
//! level. The rename always fires; a local hash that legitimately uses a
//! `guid` key for something else must rename it before crossing this
//! boundary.

use serde_json::{Map, Value};

/// Convert a wire key to local convention: `comment_count` → `commentCount`,
/// `display-name` → `displayName`.
pub fn camelize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' || ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Convert a local key to wire convention: `commentCount` → `comment_count`.
/// Hyphens normalize to underscores.
pub fn decamelize(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_uppercase() {
            out.push('_');
            out.extend(ch.to_lowercase());
        } else if ch == '-' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Recursively convert map keys from wire to local convention, renaming
/// `id` → `guid` along the way.
pub fn to_local(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(to_local).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let key = if key == "id" { "guid".to_string() } else { camelize(&key) };
                out.insert(key, to_local(item));
            }
            Value::Object(out)
        }
        scalar => scalar,
    }
}

/// Recursively convert map keys from local to wire convention, renaming
/// `guid` → `id` along the way.
pub fn to_wire(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(to_wire).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let key = if key == "guid" { "id".to_string() } else { decamelize(&key) };
                out.insert(key, to_wire(item));
            }
            Value::Object(out)
        }
        scalar => scalar,
    }
}

/// Map variants of [`to_local`] / [`to_wire`] for callers already holding a
/// data hash.
pub fn map_to_local(map: Map<String, Value>) -> Map<String, Value> {
    match to_local(Value::Object(map)) {
        Value::Object(out) => out,
        _ => unreachable!(),
    }
}

pub fn map_to_wire(map: Map<String, Value>) -> Map<String, Value> {
    match to_wire(Value::Object(map)) {
        Value::Object(out) => out,
        _ => unreachable!(),
    }
}
