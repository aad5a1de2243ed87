//! Shared post-response reconciliation: normalize provider fields, resolve
//! record types, and push the batch into the store as one coherent update.
//!
//! # Design
//! Provider identity (`_id`, else `id`) and revision (`rev`) fields are
//! pulled out before the generic case conversion runs, so CouchDB's
//! underscore-prefixed names survive untouched; identity is then re-seated
//! on the resolved type's primary-key field and revision on `_rev`. An item
//! whose type tag resolves to nothing is dropped with a warning — it never
//! poisons the rest of the batch. The surviving items reach the store in a
//! single `bulk_apply_fetched` call so the store can emit one change
//! notification for the whole batch.

use log::warn;
use serde_json::Value;

use crate::case;
use crate::registry::{TypeId, TypeRegistry};
use crate::store::{FoldedRecord, RecordStore};

/// Fold a batch of wire data items into the store. Returns how many items
/// survived normalization and type resolution.
pub fn fold_into_store(
    store: &mut dyn RecordStore,
    registry: &TypeRegistry,
    items: Vec<Value>,
    default_type: Option<TypeId>,
    loaded: bool,
) -> usize {
    let mut folded = Vec::with_capacity(items.len());

    for item in items {
        let Value::Object(mut data) = item else {
            warn!("skipping non-object record item");
            continue;
        };

        // Provider fields come out before case conversion; `_id` wins over
        // `id` when both are present.
        let identity = data.remove("_id").or_else(|| data.remove("id"));
        let revision = data.remove("_rev").or_else(|| data.remove("rev"));
        let type_tag = data
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);

        let type_id = match &type_tag {
            Some(tag) => match registry.resolve_tag(tag) {
                Some(id) => Some(id),
                None => {
                    warn!("skipping record with unresolvable type tag '{tag}'");
                    continue;
                }
            },
            None => default_type,
        };
        let Some(type_id) = type_id else {
            warn!("skipping record with no type tag and no default type");
            continue;
        };

        let mut local = case::map_to_local(data);
        if let Some(rev) = revision {
            local.insert("_rev".to_string(), rev);
        }
        if let Some(id) = identity {
            let pk = registry.get(type_id).primary_key.clone();
            local.insert(pk, id);
        }

        folded.push(FoldedRecord { type_id, data: local });
    }

    let count = folded.len();
    if count > 0 {
        store.bulk_apply_fetched(folded, loaded);
    }
    count
}
