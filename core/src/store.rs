//! The local record store collaborator.
//!
//! # Design
//! The core never owns record state; it talks to a [`RecordStore`] that the
//! host supplies. The trait is the narrow waist the reconciliation code
//! needs: read a record's data hash, learn its type and identity, assign a
//! server-issued primary key, resolve a guid back to a local reference, and
//! apply a batch of fetched hashes as one coherent change. [`MemoryStore`]
//! is a reference implementation backing the test suites and small hosts.
//!
//! Store keys are opaque local identities distinct from business primary
//! keys, and are never reused once a record is removed.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::registry::{TypeId, TypeRegistry};

/// Opaque local handle for one record instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey(pub u64);

/// A record's field data in local naming convention.
pub type DataHash = Map<String, Value>;

/// One normalized, type-resolved item produced by the reconciliation fold,
/// ready for the store to apply.
#[derive(Debug, Clone)]
pub struct FoldedRecord {
    pub type_id: TypeId,
    pub data: DataHash,
}

/// The store collaborator consumed by the lifecycle coordinators.
pub trait RecordStore {
    fn record_data(&self, key: StoreKey) -> Option<DataHash>;

    fn record_type_of(&self, key: StoreKey) -> Option<TypeId>;

    /// Current primary-key value, if the record has one.
    fn id_of(&self, key: StoreKey) -> Option<Value>;

    /// Whether the record was created locally and never acknowledged by a
    /// backend.
    fn is_new(&self, key: StoreKey) -> bool;

    /// Assign the server-issued primary key and clear the new-record flag.
    fn mark_saved(&mut self, key: StoreKey, pk_value: Value);

    /// Resolve a guid to a local reference, creating a placeholder record
    /// when the guid is not yet known locally.
    fn resolve_record(&mut self, guid: &Value, type_id: TypeId) -> StoreKey;

    /// Apply one fetched data hash. `loaded` marks the record as carrying a
    /// complete, authoritative copy rather than partial list data.
    fn apply_fetched(&mut self, key: StoreKey, data: DataHash, loaded: bool);

    /// Apply a batch of fetched records as ONE call, so the store can emit a
    /// single coherent change notification for the whole batch.
    fn bulk_apply_fetched(&mut self, items: Vec<FoldedRecord>, loaded: bool);

    /// Remove records permanently. Their store keys are never reused.
    fn remove_records(&mut self, keys: &[StoreKey]);
}

/// Partition key for resource grouping. Records whose type declares no
/// resource land in `None` (the wildcard group) and bypass the network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceGroup {
    None,
    Url(String),
}

/// Group records by the resource URL their type declares. Computed once per
/// lifecycle operation; the ordering is deterministic so multi-group
/// dispatch order is stable.
pub fn group_by_resource(
    store: &dyn RecordStore,
    registry: &TypeRegistry,
    records: &[StoreKey],
) -> BTreeMap<ResourceGroup, Vec<StoreKey>> {
    let mut groups: BTreeMap<ResourceGroup, Vec<StoreKey>> = BTreeMap::new();
    for &key in records {
        let resource = store
            .record_type_of(key)
            .and_then(|type_id| registry.get(type_id).resource.clone());
        let group = match resource {
            Some(url) => ResourceGroup::Url(url),
            None => ResourceGroup::None,
        };
        groups.entry(group).or_default().push(key);
    }
    groups
}

struct Entry {
    type_id: TypeId,
    data: DataHash,
    new: bool,
    loaded: bool,
}

/// HashMap-backed reference store.
///
/// Tracks an identity index per `(type, primary key)` pair and counts bulk
/// change notifications so tests can assert the one-notification-per-batch
/// contract.
pub struct MemoryStore {
    registry: Rc<TypeRegistry>,
    records: HashMap<StoreKey, Entry>,
    by_identity: HashMap<(TypeId, String), StoreKey>,
    next_key: u64,
    /// Number of coherent change notifications emitted so far.
    pub notifications: u64,
}

impl MemoryStore {
    pub fn new(registry: Rc<TypeRegistry>) -> Self {
        Self {
            registry,
            records: HashMap::new(),
            by_identity: HashMap::new(),
            next_key: 1,
            notifications: 0,
        }
    }

    /// Insert a locally created record. A fresh guid is minted when the data
    /// does not already carry the type's primary key.
    pub fn insert_new(&mut self, type_id: TypeId, mut data: DataHash) -> StoreKey {
        let pk = self.registry.get(type_id).primary_key.clone();
        if !data.contains_key(&pk) {
            data.insert(pk, Value::String(Uuid::new_v4().to_string()));
        }
        self.insert(type_id, data, true, false)
    }

    /// Insert a record that already exists on the backend.
    pub fn insert_existing(&mut self, type_id: TypeId, data: DataHash) -> StoreKey {
        self.insert(type_id, data, false, true)
    }

    fn insert(&mut self, type_id: TypeId, data: DataHash, new: bool, loaded: bool) -> StoreKey {
        let key = StoreKey(self.next_key);
        self.next_key += 1;
        if let Some(identity) = identity_string(&self.registry, type_id, &data) {
            self.by_identity.insert((type_id, identity), key);
        }
        self.records.insert(key, Entry { type_id, data, new, loaded });
        key
    }

    /// Write one field of a record, as a property editor would.
    pub fn set_field(&mut self, key: StoreKey, field: &str, value: Value) {
        if let Some(entry) = self.records.get_mut(&key) {
            entry.data.insert(field.to_string(), value);
        }
    }

    pub fn contains(&self, key: StoreKey) -> bool {
        self.records.contains_key(&key)
    }

    pub fn data(&self, key: StoreKey) -> Option<&DataHash> {
        self.records.get(&key).map(|entry| &entry.data)
    }

    pub fn is_loaded(&self, key: StoreKey) -> bool {
        self.records.get(&key).is_some_and(|entry| entry.loaded)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn primary_key_of(&self, type_id: TypeId) -> String {
        self.registry.get(type_id).primary_key.clone()
    }
}

fn identity_string(registry: &TypeRegistry, type_id: TypeId, data: &DataHash) -> Option<String> {
    let pk = &registry.get(type_id).primary_key;
    data.get(pk).map(value_string)
}

/// Canonical string form of an identity value: strings verbatim, everything
/// else via JSON rendering (so `1` and `"1"` both index as `1`).
pub fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl RecordStore for MemoryStore {
    fn record_data(&self, key: StoreKey) -> Option<DataHash> {
        self.records.get(&key).map(|entry| entry.data.clone())
    }

    fn record_type_of(&self, key: StoreKey) -> Option<TypeId> {
        self.records.get(&key).map(|entry| entry.type_id)
    }

    fn id_of(&self, key: StoreKey) -> Option<Value> {
        let entry = self.records.get(&key)?;
        let pk = self.primary_key_of(entry.type_id);
        entry.data.get(&pk).cloned()
    }

    fn is_new(&self, key: StoreKey) -> bool {
        self.records.get(&key).is_some_and(|entry| entry.new)
    }

    fn mark_saved(&mut self, key: StoreKey, pk_value: Value) {
        let Some(entry) = self.records.get_mut(&key) else { return };
        let type_id = entry.type_id;
        let pk = self.registry.get(type_id).primary_key.clone();
        if let Some(old) = entry.data.get(&pk) {
            let old = value_string(old);
            self.by_identity.remove(&(type_id, old));
        }
        entry.data.insert(pk, pk_value.clone());
        entry.new = false;
        self.by_identity.insert((type_id, value_string(&pk_value)), key);
    }

    fn resolve_record(&mut self, guid: &Value, type_id: TypeId) -> StoreKey {
        let identity = value_string(guid);
        if let Some(&key) = self.by_identity.get(&(type_id, identity)) {
            return key;
        }
        let pk = self.primary_key_of(type_id);
        let mut data = DataHash::new();
        data.insert(pk, guid.clone());
        self.insert(type_id, data, false, false)
    }

    fn apply_fetched(&mut self, key: StoreKey, data: DataHash, loaded: bool) {
        self.notifications += 1;
        if let Some(entry) = self.records.get_mut(&key) {
            entry.data.extend(data);
            entry.loaded |= loaded;
            entry.new = false;
        }
    }

    fn bulk_apply_fetched(&mut self, items: Vec<FoldedRecord>, loaded: bool) {
        self.notifications += 1;
        for item in items {
            let Some(identity) = identity_string(&self.registry, item.type_id, &item.data) else {
                continue;
            };
            let key = match self.by_identity.get(&(item.type_id, identity.clone())) {
                Some(&key) => key,
                None => {
                    let key = self.insert(item.type_id, DataHash::new(), false, false);
                    self.by_identity.insert((item.type_id, identity), key);
                    key
                }
            };
            if let Some(entry) = self.records.get_mut(&key) {
                entry.data.extend(item.data);
                entry.loaded |= loaded;
                entry.new = false;
            }
        }
    }

    fn remove_records(&mut self, keys: &[StoreKey]) {
        for key in keys {
            if let Some(entry) = self.records.remove(key) {
                if let Some(identity) = identity_string(&self.registry, entry.type_id, &entry.data) {
                    self.by_identity.remove(&(entry.type_id, identity));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordType;
    use serde_json::json;

    fn registry() -> Rc<TypeRegistry> {
        let mut registry = TypeRegistry::new(Vec::new());
        registry.register(None, RecordType::named("Task").with_resource("tasks"));
        registry.register(None, RecordType::named("Note"));
        Rc::new(registry)
    }

    fn hash(value: Value) -> DataHash {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn insert_new_mints_a_guid() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let key = store.insert_new(TypeId(0), hash(json!({"title": "a"})));
        assert!(store.is_new(key));
        let guid = store.id_of(key).expect("guid minted");
        assert!(guid.as_str().is_some_and(|s| !s.is_empty()));
    }

    #[test]
    fn mark_saved_reindexes_identity() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let key = store.insert_new(TypeId(0), hash(json!({"title": "a"})));
        store.mark_saved(key, json!("100"));
        assert!(!store.is_new(key));
        assert_eq!(store.resolve_record(&json!("100"), TypeId(0)), key);
    }

    #[test]
    fn resolve_record_creates_placeholder_once() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let a = store.resolve_record(&json!(1), TypeId(0));
        let b = store.resolve_record(&json!(1), TypeId(0));
        assert_eq!(a, b);
        // Numeric and string spellings index the same identity.
        let c = store.resolve_record(&json!("1"), TypeId(0));
        assert_eq!(a, c);
    }

    #[test]
    fn bulk_apply_is_one_notification() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let items = vec![
            FoldedRecord { type_id: TypeId(0), data: hash(json!({"guid": 1, "title": "a"})) },
            FoldedRecord { type_id: TypeId(0), data: hash(json!({"guid": 2, "title": "b"})) },
        ];
        store.bulk_apply_fetched(items, true);
        assert_eq!(store.notifications, 1);
        assert_eq!(store.len(), 2);
        let key = store.resolve_record(&json!(1), TypeId(0));
        assert!(store.is_loaded(key));
    }

    #[test]
    fn apply_fetched_merges_one_record() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let key = store.insert_new(TypeId(0), hash(json!({"title": "a"})));
        store.apply_fetched(key, hash(json!({"title": "b", "position": 4})), true);
        assert_eq!(store.data(key).and_then(|d| d.get("title")).cloned(), Some(json!("b")));
        assert!(store.is_loaded(key));
        assert!(!store.is_new(key));
        assert_eq!(store.notifications, 1);
    }

    #[test]
    fn partial_apply_does_not_mark_loaded() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let items = vec![FoldedRecord {
            type_id: TypeId(0),
            data: hash(json!({"guid": 1, "title": "a"})),
        }];
        store.bulk_apply_fetched(items, false);
        let key = store.resolve_record(&json!(1), TypeId(0));
        assert!(!store.is_loaded(key));
    }

    #[test]
    fn grouping_partitions_by_resource_with_wildcard() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let task = store.insert_new(TypeId(0), hash(json!({"title": "t"})));
        let note = store.insert_new(TypeId(1), hash(json!({"title": "n"})));

        let groups = group_by_resource(&store, &registry, &[task, note]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&ResourceGroup::None], vec![note]);
        assert_eq!(groups[&ResourceGroup::Url("tasks".to_string())], vec![task]);
    }

    #[test]
    fn removed_keys_are_never_reused() {
        let registry = registry();
        let mut store = MemoryStore::new(Rc::clone(&registry));
        let key = store.insert_new(TypeId(0), hash(json!({"title": "a"})));
        store.remove_records(&[key]);
        assert!(!store.contains(key));
        let next = store.insert_new(TypeId(0), hash(json!({"title": "b"})));
        assert_ne!(key, next);
    }
}
