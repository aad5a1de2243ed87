//! Record type descriptors and the type registry.
//!
//! # Design
//! Wire payloads identify their record type with a string tag. Resolution is
//! an explicit registry populated at configuration time: every type is
//! registered under an optional namespace prefix, and a tag is capitalized
//! and looked up through the configured prefix list in order, first hit
//! winning. This replaces any runtime namespace walking with a synchronous
//! map lookup.

use std::collections::HashMap;

/// Index of a registered [`RecordType`]. Cheap to copy and compare; only
/// meaningful against the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub usize);

/// Static description of one record type: where its collection lives on the
/// backend and how its identity is spelled.
#[derive(Debug, Clone)]
pub struct RecordType {
    /// Capitalized type name as it appears in wire `type` tags, e.g. `Task`.
    pub name: String,
    /// Collection URL on the backend. Types without a resource never reach
    /// the network; their records land in the wildcard group.
    pub resource: Option<String>,
    /// Local field holding the business identity. Defaults to `guid`.
    pub primary_key: String,
    /// Full URL overriding the composed refresh URL for single-record reads.
    pub refresh_url: Option<String>,
    /// Full URL overriding the composed update URL for single-record writes.
    pub update_url: Option<String>,
    /// Full URL overriding the composed destroy URL for single-record
    /// deletions.
    pub destroy_url: Option<String>,
    /// Predefined CouchDB view path relative to the resource, e.g.
    /// `_design/tasks/_view/by_title`. When absent the CouchDB backend
    /// synthesizes a temp view filtered on the type name.
    pub default_view: Option<String>,
}

impl RecordType {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: None,
            primary_key: "guid".to_string(),
            refresh_url: None,
            update_url: None,
            destroy_url: None,
            default_view: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Configuration-time mapping from type-tag strings to type descriptors.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    prefixes: Vec<String>,
    types: Vec<RecordType>,
    by_path: HashMap<String, TypeId>,
}

impl TypeRegistry {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self {
            prefixes,
            types: Vec::new(),
            by_path: HashMap::new(),
        }
    }

    /// Register a type, optionally under a namespace prefix. Returns the id
    /// used everywhere else in the crate.
    pub fn register(&mut self, prefix: Option<&str>, record_type: RecordType) -> TypeId {
        let id = TypeId(self.types.len());
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{}", record_type.name),
            None => record_type.name.clone(),
        };
        self.by_path.insert(path, id);
        self.types.push(record_type);
        id
    }

    pub fn get(&self, id: TypeId) -> &RecordType {
        &self.types[id.0]
    }

    /// Resolve a wire type tag: capitalize, then search the prefix list in
    /// order. With no prefixes configured the bare name is looked up
    /// directly.
    pub fn resolve_tag(&self, tag: &str) -> Option<TypeId> {
        let name = capitalize(tag);
        if self.prefixes.is_empty() {
            return self.by_path.get(&name).copied();
        }
        for prefix in &self.prefixes {
            if let Some(id) = self.by_path.get(&format!("{prefix}.{name}")) {
                return Some(*id);
            }
        }
        None
    }
}

fn capitalize(tag: &str) -> String {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
