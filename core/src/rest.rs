//! Record lifecycle coordination for the generic REST dialect.
//!
//! # Design
//! Each lifecycle operation is one self-contained exchange: group the
//! records by resource, shape the outbound payload in the provider's
//! convention, dispatch, and reconcile the response through the shared fold
//! when the host reports completion. The wildcard group (records whose type
//! declares no resource) never reaches the network — destroy completes it
//! locally, the write operations skip it.
//!
//! Acknowledgement matching for `create` is keyed: every submitted record
//! payload carries a `_guid` correlation id and the response is matched back
//! through it, so response array order never decides which record receives
//! which primary key.

use std::collections::HashMap;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::Value;

use crate::case;
use crate::dispatch::{
    ChainOutcome, Completion, Dispatch, Dispatcher, Exchange, Outcome, ResponseHook,
};
use crate::error::SyncError;
use crate::http::{HttpMethod, HttpResponse, RequestId, Transport, TransportError};
use crate::reconcile::fold_into_store;
use crate::registry::{TypeId, TypeRegistry};
use crate::store::{
    group_by_resource, value_string, DataHash, RecordStore, ResourceGroup, StoreKey,
};

pub use crate::dispatch::{FailureHandler, SuccessHandler};

/// How `commit` encodes record data into the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostFormat {
    /// Bracketed `records[0][field]=value` form pairs.
    UrlEncoded,
    /// A single `records=<json array>` form field.
    Json,
}

/// Provider conventions for one REST backend.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Template composing collection URLs; first slot resource, second
    /// action.
    pub url_format: String,
    pub post_format: PostFormat,
    /// Percent-escape the JSON commit payload (only meaningful with
    /// `PostFormat::Json`).
    pub escape_json: bool,
    /// Send Put/Delete as Post with an injected `_method` param.
    pub emulate_uncommon_methods: bool,
    pub destroy_method: HttpMethod,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url_format: "/{}/{}".to_string(),
            post_format: PostFormat::UrlEncoded,
            escape_json: true,
            emulate_uncommon_methods: false,
            destroy_method: HttpMethod::Post,
        }
    }
}

/// Options for [`RestBackend::list`].
#[derive(Default)]
pub struct ListOptions {
    /// Result ordering: a field name or an array of field names (local
    /// convention; decamelized on the wire). Defaults to primary-key order.
    pub order: Option<Value>,
    /// Equality conditions, decamelized key and value.
    pub conditions: Option<DataHash>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Concurrency token from a previous list, for not-modified checks.
    pub cache_code: Option<String>,
    /// Predefined view path (CouchDB dialect only; ignored here).
    pub view: Option<String>,
    pub on_success: Option<SuccessHandler>,
    pub on_failure: Option<FailureHandler>,
    pub on_response: Option<ResponseHook>,
    pub on_response_error: Option<ResponseHook>,
}

/// Options for the write operations (create/refresh/commit/destroy).
#[derive(Default)]
pub struct WriteOptions {
    pub on_success: Option<SuccessHandler>,
    pub on_failure: Option<FailureHandler>,
    pub on_response: Option<ResponseHook>,
    pub on_response_error: Option<ResponseHook>,
}

/// Internal handler selector for a pending exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    List,
    Create,
    Refresh,
    Commit,
    Destroy,
}

#[derive(Deserialize)]
struct ListEnvelope {
    records: Vec<Value>,
    #[serde(default)]
    ids: Vec<Value>,
    #[serde(default)]
    count: Option<u64>,
}

#[derive(Deserialize)]
struct RecordsEnvelope {
    #[serde(default)]
    records: Vec<Value>,
}

/// Lifecycle coordinator for a generic REST resource server.
pub struct RestBackend {
    registry: Rc<TypeRegistry>,
    dispatcher: Dispatcher<ResponseKind>,
    config: RestConfig,
}

impl RestBackend {
    pub fn new(registry: Rc<TypeRegistry>, config: RestConfig) -> Self {
        let dispatcher = Dispatcher::new(config.url_format.clone());
        Self { registry, dispatcher, config }
    }

    /// Backend-wide success hook, run on every completed request after the
    /// per-call hook.
    pub fn set_on_success(&mut self, hook: ResponseHook) {
        self.dispatcher.set_on_success(hook);
    }

    /// Backend-wide failure hook.
    pub fn set_on_failure(&mut self, hook: ResponseHook) {
        self.dispatcher.set_on_failure(hook);
    }

    /// Fold server-embedded bootstrap data into the store without touching
    /// the network. Returns how many items survived.
    pub fn preload(&self, store: &mut dyn RecordStore, items: Vec<Value>) -> usize {
        fold_into_store(store, &self.registry, items, None, false)
    }

    /// Query the collection for `type_id`. One dispatch; the response's
    /// `records` fold as partial data and its `ids` resolve to ordered local
    /// references for the success continuation.
    pub fn list(
        &mut self,
        transport: &mut dyn Transport,
        type_id: TypeId,
        options: ListOptions,
    ) -> Result<RequestId, SyncError> {
        let record_type = self.registry.get(type_id);
        let resource = record_type
            .resource
            .clone()
            .ok_or_else(|| SyncError::MissingResource(record_type.name.clone()))?;

        let mut dispatch = Dispatch::new(resource, "list", HttpMethod::Get);
        dispatch.cache_code = options.cache_code;

        if let Some(conditions) = options.conditions {
            dispatch.params.extend(case::map_to_wire(conditions));
        }
        let order = match options.order.unwrap_or_else(|| Value::String("id".to_string())) {
            Value::Array(fields) => fields
                .iter()
                .map(|field| case::decamelize(&value_string(field)))
                .collect::<Vec<_>>()
                .join(","),
            other => case::decamelize(&value_string(&other)),
        };
        dispatch.params.insert("order".to_string(), Value::String(order));
        if let Some(offset) = options.offset {
            dispatch.params.insert("offset".to_string(), Value::from(offset));
        }
        if let Some(limit) = options.limit {
            dispatch.params.insert("limit".to_string(), Value::from(limit));
        }

        let mut exchange = Exchange::new(ResponseKind::List);
        exchange.default_type = Some(type_id);
        exchange.on_success = options.on_success;
        exchange.on_failure = options.on_failure;
        exchange.on_response = options.on_response;
        exchange.on_response_error = options.on_response_error;

        Ok(self.dispatcher.dispatch(transport, dispatch, exchange))
    }

    /// Create `records` on their backends. One dispatch per resource group;
    /// the wildcard group is skipped — there is nothing to create remotely.
    pub fn create(
        &mut self,
        transport: &mut dyn Transport,
        store: &mut dyn RecordStore,
        records: &[StoreKey],
        options: &WriteOptions,
    ) -> Result<Vec<RequestId>, SyncError> {
        let mut issued = Vec::new();
        for (group, keys) in group_by_resource(store, &self.registry, records) {
            let ResourceGroup::Url(resource) = group else { continue };

            let mut payload = Vec::new();
            let mut correlation = HashMap::new();
            let mut default_type = None;
            for &key in &keys {
                let Some(data) = store.record_data(key) else { continue };
                let Some(local_id) = store.id_of(key) else { continue };
                if default_type.is_none() {
                    default_type = store.record_type_of(key);
                }
                let guid = value_string(&local_id);
                let mut wire = case::map_to_wire(data);
                // The provider assigns identity; the local temp guid rides
                // only in the correlation tag.
                wire.remove("id");
                wire.insert("_guid".to_string(), Value::String(guid.clone()));
                correlation.insert(guid, key);
                payload.push(Value::Object(wire));
            }
            if payload.is_empty() {
                continue;
            }

            let mut dispatch = Dispatch::new(resource, "create", HttpMethod::Post);
            dispatch.emulate_uncommon_methods = self.config.emulate_uncommon_methods;
            dispatch.params.insert("records".to_string(), Value::Array(payload));

            let mut exchange = Exchange::new(ResponseKind::Create);
            exchange.records = keys;
            exchange.default_type = default_type;
            exchange.correlation = correlation;
            apply_write_options(&mut exchange, options);

            issued.push(self.dispatcher.dispatch(transport, dispatch, exchange));
        }
        Ok(issued)
    }

    /// Re-fetch `records` from their backends: one combined read per
    /// resource group.
    pub fn refresh(
        &mut self,
        transport: &mut dyn Transport,
        store: &mut dyn RecordStore,
        records: &[StoreKey],
        options: &WriteOptions,
    ) -> Result<Vec<RequestId>, SyncError> {
        let mut issued = Vec::new();
        for (group, keys) in group_by_resource(store, &self.registry, records) {
            let ResourceGroup::Url(resource) = group else { continue };

            let mut ids = Vec::new();
            let mut default_type = None;
            for &key in &keys {
                if default_type.is_none() {
                    default_type = store.record_type_of(key);
                }
                if let Some(id) = store.id_of(key) {
                    ids.push(value_string(&id));
                }
            }
            if ids.is_empty() {
                continue;
            }

            let mut dispatch = Dispatch::new(resource, "show", HttpMethod::Get);
            dispatch.ids = ids;
            if keys.len() == 1 {
                if let Some(url) = default_type
                    .map(|type_id| self.registry.get(type_id))
                    .and_then(|record_type| record_type.refresh_url.clone())
                {
                    dispatch.url = Some(url);
                }
            }

            let mut exchange = Exchange::new(ResponseKind::Refresh);
            exchange.records = keys;
            exchange.default_type = default_type;
            apply_write_options(&mut exchange, options);

            issued.push(self.dispatcher.dispatch(transport, dispatch, exchange));
        }
        Ok(issued)
    }

    /// Push local changes for `records`. A group whose effective payload is
    /// empty issues no request and completes immediately.
    pub fn commit(
        &mut self,
        transport: &mut dyn Transport,
        store: &mut dyn RecordStore,
        records: &[StoreKey],
        options: &WriteOptions,
    ) -> Result<Vec<RequestId>, SyncError> {
        let mut issued = Vec::new();
        for (group, keys) in group_by_resource(store, &self.registry, records) {
            let ResourceGroup::Url(resource) = group else { continue };

            let mut wire_records = Vec::new();
            let mut default_type = None;
            for &key in &keys {
                let Some(data) = store.record_data(key) else { continue };
                if data.is_empty() {
                    continue;
                }
                if default_type.is_none() {
                    default_type = store.record_type_of(key);
                }
                wire_records.push(Value::Object(case::map_to_wire(data)));
            }
            if wire_records.is_empty() {
                // Nothing dirty to send; synthesize completion.
                let completion = Completion::Committed { records: keys };
                if let Some(on_success) = &options.on_success {
                    on_success(&completion);
                }
                continue;
            }

            let mut dispatch = Dispatch::new(resource, "update", HttpMethod::Post);
            dispatch.emulate_uncommon_methods = self.config.emulate_uncommon_methods;
            match self.config.post_format {
                PostFormat::UrlEncoded => {
                    dispatch
                        .params
                        .insert("records".to_string(), Value::Array(wire_records));
                }
                PostFormat::Json => {
                    let json = serde_json::to_string(&wire_records)
                        .map_err(|e| SyncError::Serialization(e.to_string()))?;
                    let json = if self.config.escape_json { js_escape(&json) } else { json };
                    dispatch.params.insert("records".to_string(), Value::String(json));
                }
            }

            if keys.len() == 1 {
                if let Some(id) = store.id_of(keys[0]) {
                    dispatch.ids = vec![value_string(&id)];
                }
                if let Some(url) = default_type
                    .map(|type_id| self.registry.get(type_id))
                    .and_then(|record_type| record_type.update_url.clone())
                {
                    dispatch.url = Some(url);
                }
            }

            let mut exchange = Exchange::new(ResponseKind::Commit);
            exchange.records = keys;
            exchange.default_type = default_type;
            apply_write_options(&mut exchange, options);

            issued.push(self.dispatcher.dispatch(transport, dispatch, exchange));
        }
        Ok(issued)
    }

    /// Delete `records` from their backends. The wildcard group and groups
    /// holding only never-persisted records complete locally with zero
    /// network requests.
    pub fn destroy(
        &mut self,
        transport: &mut dyn Transport,
        store: &mut dyn RecordStore,
        records: &[StoreKey],
        options: &WriteOptions,
    ) -> Result<Vec<RequestId>, SyncError> {
        let mut issued = Vec::new();
        for (group, keys) in group_by_resource(store, &self.registry, records) {
            let resource = match group {
                ResourceGroup::Url(resource) => resource,
                ResourceGroup::None => {
                    destroy_locally(store, keys, options);
                    continue;
                }
            };

            let mut ids = Vec::new();
            let mut default_type = None;
            for &key in &keys {
                if default_type.is_none() {
                    default_type = store.record_type_of(key);
                }
                if store.is_new(key) {
                    continue;
                }
                if let Some(id) = store.id_of(key) {
                    ids.push(value_string(&id));
                }
            }
            if ids.is_empty() {
                // Every record was still unsaved; nothing to delete remotely.
                destroy_locally(store, keys, options);
                continue;
            }

            let mut dispatch = Dispatch::new(resource, "destroy", self.config.destroy_method);
            dispatch.emulate_uncommon_methods = self.config.emulate_uncommon_methods;
            dispatch.ids = ids;
            if keys.len() == 1 {
                if let Some(url) = default_type
                    .map(|type_id| self.registry.get(type_id))
                    .and_then(|record_type| record_type.destroy_url.clone())
                {
                    dispatch.url = Some(url);
                }
            }

            let mut exchange = Exchange::new(ResponseKind::Destroy);
            exchange.records = keys;
            exchange.default_type = default_type;
            apply_write_options(&mut exchange, options);

            issued.push(self.dispatcher.dispatch(transport, dispatch, exchange));
        }
        Ok(issued)
    }

    /// Feed a host-reported completion back in. Runs the continuation chain,
    /// reconciles on success, and fires the operation-level continuations.
    pub fn complete(
        &mut self,
        store: &mut dyn RecordStore,
        id: RequestId,
        result: Result<HttpResponse, TransportError>,
    ) -> Outcome {
        match self.dispatcher.complete(id, result) {
            ChainOutcome::Discarded => Outcome::Discarded,
            ChainOutcome::Halted => Outcome::Halted,
            ChainOutcome::Failure { exchange, error } => {
                if let Some(on_failure) = &exchange.on_failure {
                    on_failure(&error);
                }
                Outcome::Failed(error)
            }
            ChainOutcome::Success { exchange, response, cache_code, not_modified } => {
                if not_modified {
                    if exchange.kind == ResponseKind::List {
                        if let Some(on_success) = &exchange.on_success {
                            on_success(&Completion::NotModified);
                        }
                    }
                    return Outcome::Done(Completion::NotModified);
                }
                let handled = match exchange.kind {
                    ResponseKind::List => self.finish_list(store, &exchange, &response, cache_code),
                    ResponseKind::Create => self.finish_create(store, &exchange, &response),
                    ResponseKind::Refresh | ResponseKind::Commit => {
                        self.finish_loaded(store, &exchange, &response)
                    }
                    ResponseKind::Destroy => {
                        store.remove_records(&exchange.records);
                        Ok(Completion::Destroyed { records: exchange.records.clone() })
                    }
                };
                match handled {
                    Ok(completion) => {
                        if let Some(on_success) = &exchange.on_success {
                            on_success(&completion);
                        }
                        Outcome::Done(completion)
                    }
                    Err(error) => {
                        if let Some(on_failure) = &exchange.on_failure {
                            on_failure(&error);
                        }
                        Outcome::Failed(error)
                    }
                }
            }
        }
    }

    fn finish_list(
        &self,
        store: &mut dyn RecordStore,
        exchange: &Exchange<ResponseKind>,
        response: &HttpResponse,
        cache_code: Option<String>,
    ) -> Result<Completion, SyncError> {
        let envelope: ListEnvelope = parse_body(&response.body)?;
        fold_into_store(store, &self.registry, envelope.records, exchange.default_type, false);

        let mut resolved = Vec::with_capacity(envelope.ids.len());
        if let Some(type_id) = exchange.default_type {
            for guid in &envelope.ids {
                resolved.push(store.resolve_record(guid, type_id));
            }
        }
        Ok(Completion::Listed { records: resolved, count: envelope.count, cache_code })
    }

    fn finish_create(
        &self,
        store: &mut dyn RecordStore,
        exchange: &Exchange<ResponseKind>,
        response: &HttpResponse,
    ) -> Result<Completion, SyncError> {
        let envelope: RecordsEnvelope = parse_body(&response.body)?;

        let mut items = Vec::with_capacity(envelope.records.len());
        for item in envelope.records {
            let Value::Object(mut map) = item else { continue };
            let correlated = map
                .get("_guid")
                .and_then(Value::as_str)
                .and_then(|guid| exchange.correlation.get(guid))
                .copied();
            if let Some(key) = correlated {
                let pk = self.primary_key_for(store, key);
                let wire_key = if pk == "guid" { "id".to_string() } else { case::decamelize(&pk) };
                if let Some(value) = map.get(&wire_key) {
                    store.mark_saved(key, value.clone());
                }
            }
            map.remove("_guid");
            items.push(Value::Object(map));
        }
        fold_into_store(store, &self.registry, items, exchange.default_type, true);
        Ok(Completion::Created { records: exchange.records.clone() })
    }

    fn finish_loaded(
        &self,
        store: &mut dyn RecordStore,
        exchange: &Exchange<ResponseKind>,
        response: &HttpResponse,
    ) -> Result<Completion, SyncError> {
        let envelope: RecordsEnvelope = parse_body(&response.body)?;
        fold_into_store(store, &self.registry, envelope.records, exchange.default_type, true);
        let records = exchange.records.clone();
        Ok(match exchange.kind {
            ResponseKind::Commit => Completion::Committed { records },
            _ => Completion::Refreshed { records },
        })
    }

    fn primary_key_for(&self, store: &dyn RecordStore, key: StoreKey) -> String {
        store
            .record_type_of(key)
            .map(|type_id| self.registry.get(type_id).primary_key.clone())
            .unwrap_or_else(|| "guid".to_string())
    }
}

pub(crate) fn apply_write_options<K>(exchange: &mut Exchange<K>, options: &WriteOptions) {
    exchange.on_success = options.on_success.clone();
    exchange.on_failure = options.on_failure.clone();
    exchange.on_response = options.on_response.clone();
    exchange.on_response_error = options.on_response_error.clone();
}

pub(crate) fn destroy_locally(
    store: &mut dyn RecordStore,
    keys: Vec<StoreKey>,
    options: &WriteOptions,
) {
    store.remove_records(&keys);
    if let Some(on_success) = &options.on_success {
        on_success(&Completion::Destroyed { records: keys });
    }
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, SyncError> {
    serde_json::from_str(body).map_err(|e| SyncError::MalformedPayload(e.to_string()))
}

/// Percent-escape in the style legacy providers expect around JSON form
/// fields: ASCII alphanumerics and `@*_+-./` pass through, other code points
/// below 256 become `%XX`, the rest `%uXXXX`.
fn js_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || "@*_+-./".contains(ch) {
            out.push(ch);
        } else {
            let code = ch as u32;
            if code < 256 {
                out.push_str(&format!("%{code:02X}"));
            } else {
                out.push_str(&format!("%u{code:04X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordType;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeTransport {
        submitted: Vec<(RequestId, crate::http::HttpRequest)>,
    }

    impl Transport for FakeTransport {
        fn submit(&mut self, id: RequestId, request: crate::http::HttpRequest) {
            self.submitted.push((id, request));
        }

        fn abort(&mut self, _id: RequestId) -> bool {
            false
        }
    }

    struct Fixture {
        registry: Rc<TypeRegistry>,
        backend: RestBackend,
        store: MemoryStore,
        transport: FakeTransport,
        task: TypeId,
        note: TypeId,
    }

    fn fixture() -> Fixture {
        let mut registry = TypeRegistry::new(vec!["App".to_string()]);
        let task = registry.register(Some("App"), RecordType::named("Task").with_resource("tasks"));
        let note = registry.register(Some("App"), RecordType::named("Note"));
        let registry = Rc::new(registry);
        Fixture {
            backend: RestBackend::new(Rc::clone(&registry), RestConfig::default()),
            store: MemoryStore::new(Rc::clone(&registry)),
            registry,
            transport: FakeTransport::default(),
            task,
            note,
        }
    }

    fn hash(value: Value) -> DataHash {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn ok(body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse { status: 200, headers: Vec::new(), body: body.to_string() })
    }

    #[test]
    fn list_builds_ordered_query() {
        let mut f = fixture();
        let id = f
            .backend
            .list(
                &mut f.transport,
                f.task,
                ListOptions {
                    order: Some(json!(["position", "commentCount"])),
                    conditions: Some(hash(json!({"isDone": false}))),
                    ..Default::default()
                },
            )
            .expect("resource known");
        assert_eq!(id, 1);
        let request = &f.transport.submitted[0].1;
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url, "/tasks/list?is_done=false&order=position,comment_count");
    }

    #[test]
    fn list_defaults_to_primary_key_order() {
        let mut f = fixture();
        f.backend
            .list(&mut f.transport, f.task, ListOptions::default())
            .expect("resource known");
        assert_eq!(f.transport.submitted[0].1.url, "/tasks/list?order=id");
    }

    #[test]
    fn list_without_resource_is_an_error() {
        let mut f = fixture();
        let err = f
            .backend
            .list(&mut f.transport, f.note, ListOptions::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingResource(_)));
    }

    #[test]
    fn list_reconciles_and_resolves_ids() {
        let mut f = fixture();
        let seen: Rc<RefCell<Option<(usize, Option<u64>)>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        let id = f
            .backend
            .list(
                &mut f.transport,
                f.task,
                ListOptions {
                    on_success: Some(Rc::new(move |completion| {
                        if let Completion::Listed { records, count, .. } = completion {
                            *sink.borrow_mut() = Some((records.len(), *count));
                        }
                    })),
                    ..Default::default()
                },
            )
            .expect("resource known");

        let outcome = f.backend.complete(
            &mut f.store,
            id,
            ok(r#"{"records":[{"id":1,"type":"Task","title":"a"}],"ids":[1],"count":1}"#),
        );

        let Outcome::Done(Completion::Listed { records, count, .. }) = outcome else {
            panic!("expected listed completion");
        };
        assert_eq!(count, Some(1));
        assert_eq!(records.len(), 1);
        let data = f.store.data(records[0]).expect("resolved record");
        assert_eq!(data.get("guid"), Some(&json!(1)));
        assert_eq!(data.get("title"), Some(&json!("a")));
        assert_eq!(*seen.borrow(), Some((1, Some(1))));
    }

    #[test]
    fn list_not_modified_completes_empty() {
        let mut f = fixture();
        let called = Rc::new(RefCell::new(false));
        let sink = Rc::clone(&called);
        let id = f
            .backend
            .list(
                &mut f.transport,
                f.task,
                ListOptions {
                    cache_code: Some("tok".to_string()),
                    on_success: Some(Rc::new(move |completion| {
                        assert!(matches!(completion, Completion::NotModified));
                        *sink.borrow_mut() = true;
                    })),
                    ..Default::default()
                },
            )
            .expect("resource known");

        let outcome = f.backend.complete(&mut f.store, id, ok("304 Not Modified"));
        assert!(matches!(outcome, Outcome::Done(Completion::NotModified)));
        assert!(*called.borrow());
        assert!(f.store.is_empty());
    }

    #[test]
    fn create_batches_one_dispatch_per_resource() {
        let mut f = fixture();
        let a = f.store.insert_new(f.task, hash(json!({"guid": "a", "title": "first"})));
        let b = f.store.insert_new(f.task, hash(json!({"guid": "b", "title": "second"})));

        let mut store = f.store;
        let issued = f
            .backend
            .create(&mut f.transport, &mut store, &[a, b], &WriteOptions::default())
            .expect("create dispatches");
        assert_eq!(issued.len(), 1);

        let request = &f.transport.submitted[0].1;
        assert_eq!(request.url, "/tasks/create");
        let body = request.body.as_deref().expect("form body");
        assert!(body.contains("records[0][_guid]=a"));
        assert!(body.contains("records[1][_guid]=b"));
        assert!(body.contains("records[0][title]=first"));
        // The local temp guid is not sent as a provider id.
        assert!(!body.contains("records[0][id]"));
    }

    #[test]
    fn create_correlates_by_guid_not_position() {
        let mut f = fixture();
        let a = f.store.insert_new(f.task, hash(json!({"guid": "a", "title": "first"})));
        let b = f.store.insert_new(f.task, hash(json!({"guid": "b", "title": "second"})));

        let mut store = f.store;
        let issued = f
            .backend
            .create(&mut f.transport, &mut store, &[a, b], &WriteOptions::default())
            .expect("create dispatches");

        // Response deliberately reversed relative to submission order.
        let outcome = f.backend.complete(
            &mut store,
            issued[0],
            ok(r#"{"records":[{"_guid":"b","id":"101"},{"_guid":"a","id":"100"}]}"#),
        );
        assert!(matches!(outcome, Outcome::Done(Completion::Created { .. })));

        assert_eq!(store.id_of(a), Some(json!("100")));
        assert_eq!(store.id_of(b), Some(json!("101")));
        assert!(!store.is_new(a));
        assert!(!store.is_new(b));
    }

    #[test]
    fn create_skips_the_wildcard_group() {
        let mut f = fixture();
        let n = f.store.insert_new(f.note, hash(json!({"title": "local only"})));
        let mut store = f.store;
        let issued = f
            .backend
            .create(&mut f.transport, &mut store, &[n], &WriteOptions::default())
            .expect("create dispatches");
        assert!(issued.is_empty());
        assert!(f.transport.submitted.is_empty());
    }

    #[test]
    fn refresh_combines_ids_into_one_read() {
        let mut f = fixture();
        let a = f.store.insert_existing(f.task, hash(json!({"guid": 1, "title": "a"})));
        let b = f.store.insert_existing(f.task, hash(json!({"guid": 2, "title": "b"})));
        let mut store = f.store;
        let issued = f
            .backend
            .refresh(&mut f.transport, &mut store, &[a, b], &WriteOptions::default())
            .expect("refresh dispatches");
        assert_eq!(issued.len(), 1);
        assert_eq!(f.transport.submitted[0].1.url, "/tasks/show?ids=1,2");
    }

    #[test]
    fn refresh_single_record_appends_id() {
        let mut f = fixture();
        let a = f.store.insert_existing(f.task, hash(json!({"guid": 7, "title": "a"})));
        let mut store = f.store;
        let issued = f
            .backend
            .refresh(&mut f.transport, &mut store, &[a], &WriteOptions::default())
            .expect("refresh dispatches");
        let outcome = f.backend.complete(
            &mut store,
            issued[0],
            ok(r#"{"records":[{"id":7,"type":"Task","title":"fresh"}]}"#),
        );
        assert!(matches!(outcome, Outcome::Done(Completion::Refreshed { .. })));
        assert_eq!(f.transport.submitted[0].1.url, "/tasks/show7");
        assert_eq!(store.data(a).and_then(|d| d.get("title")).cloned(), Some(json!("fresh")));
        assert!(store.is_loaded(a));
    }

    #[test]
    fn commit_url_encoded_posts_bracketed_records() {
        let mut f = fixture();
        let a = f.store.insert_existing(f.task, hash(json!({"guid": 7, "title": "edited"})));
        let mut store = f.store;
        let issued = f
            .backend
            .commit(&mut f.transport, &mut store, &[a], &WriteOptions::default())
            .expect("commit dispatches");
        assert_eq!(issued.len(), 1);
        let request = &f.transport.submitted[0].1;
        assert_eq!(request.url, "/tasks/update7");
        let body = request.body.as_deref().expect("form body");
        assert!(body.contains("records[0][id]=7"));
        assert!(body.contains("records[0][title]=edited"));
    }

    #[test]
    fn commit_json_format_escapes_payload() {
        let mut f = fixture();
        f.backend = RestBackend::new(
            Rc::clone(&f.registry),
            RestConfig { post_format: PostFormat::Json, ..Default::default() },
        );
        let a = f.store.insert_existing(f.task, hash(json!({"guid": 7, "title": "x"})));
        let mut store = f.store;
        f.backend
            .commit(&mut f.transport, &mut store, &[a], &WriteOptions::default())
            .expect("commit dispatches");
        let body = f.transport.submitted[0].1.body.as_deref().expect("form body");
        // The JSON array is a single escaped form field.
        assert!(body.starts_with("records=%5B%7B"));
        assert!(!body.contains('{'));
    }

    #[test]
    fn commit_with_no_payload_synthesizes_completion() {
        let mut f = fixture();
        let a = f.store.insert_existing(f.task, DataHash::new());
        let called = Rc::new(RefCell::new(false));
        let sink = Rc::clone(&called);
        let mut store = f.store;
        let issued = f
            .backend
            .commit(
                &mut f.transport,
                &mut store,
                &[a],
                &WriteOptions {
                    on_success: Some(Rc::new(move |completion| {
                        assert!(matches!(completion, Completion::Committed { .. }));
                        *sink.borrow_mut() = true;
                    })),
                    ..Default::default()
                },
            )
            .expect("commit dispatches");
        assert!(issued.is_empty());
        assert!(f.transport.submitted.is_empty());
        assert!(*called.borrow());
    }

    #[test]
    fn destroy_of_unsaved_records_never_touches_the_network() {
        let mut f = fixture();
        let a = f.store.insert_new(f.task, hash(json!({"title": "draft"})));
        let b = f.store.insert_new(f.task, hash(json!({"title": "draft 2"})));
        let called = Rc::new(RefCell::new(false));
        let sink = Rc::clone(&called);
        let mut store = f.store;
        let issued = f
            .backend
            .destroy(
                &mut f.transport,
                &mut store,
                &[a, b],
                &WriteOptions {
                    on_success: Some(Rc::new(move |_| *sink.borrow_mut() = true)),
                    ..Default::default()
                },
            )
            .expect("destroy dispatches");
        assert!(issued.is_empty());
        assert!(f.transport.submitted.is_empty());
        assert!(!store.contains(a));
        assert!(!store.contains(b));
        assert!(*called.borrow());
    }

    #[test]
    fn destroy_persisted_records_dispatches_and_removes_on_success() {
        let mut f = fixture();
        let a = f.store.insert_existing(f.task, hash(json!({"guid": 5})));
        let mut store = f.store;
        let issued = f
            .backend
            .destroy(&mut f.transport, &mut store, &[a], &WriteOptions::default())
            .expect("destroy dispatches");
        assert_eq!(issued.len(), 1);
        assert_eq!(f.transport.submitted[0].1.url, "/tasks/destroy5");
        assert!(store.contains(a), "record survives until the server acknowledges");

        let outcome = f.backend.complete(&mut store, issued[0], ok("{}"));
        assert!(matches!(outcome, Outcome::Done(Completion::Destroyed { .. })));
        assert!(!store.contains(a));
    }

    #[test]
    fn destroy_emulation_injects_method_param() {
        let mut f = fixture();
        f.backend = RestBackend::new(
            Rc::clone(&f.registry),
            RestConfig {
                destroy_method: HttpMethod::Delete,
                emulate_uncommon_methods: true,
                ..Default::default()
            },
        );
        let a = f.store.insert_existing(f.task, hash(json!({"guid": 5})));
        let mut store = f.store;
        f.backend
            .destroy(&mut f.transport, &mut store, &[a], &WriteOptions::default())
            .expect("destroy dispatches");
        let request = &f.transport.submitted[0].1;
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.body.as_deref(), Some("_method=delete"));
    }

    #[test]
    fn malformed_payload_fails_without_reconciling() {
        let mut f = fixture();
        let failed = Rc::new(RefCell::new(false));
        let sink = Rc::clone(&failed);
        let id = f
            .backend
            .list(
                &mut f.transport,
                f.task,
                ListOptions {
                    on_failure: Some(Rc::new(move |error| {
                        assert!(matches!(error, SyncError::MalformedPayload(_)));
                        *sink.borrow_mut() = true;
                    })),
                    ..Default::default()
                },
            )
            .expect("resource known");

        let outcome = f.backend.complete(&mut f.store, id, ok("not json at all"));
        assert!(matches!(outcome, Outcome::Failed(SyncError::MalformedPayload(_))));
        assert!(f.store.is_empty());
        assert_eq!(f.store.notifications, 0);
        assert!(*failed.borrow());
    }

    #[test]
    fn transport_failure_reaches_the_failure_continuation() {
        let mut f = fixture();
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        let id = f
            .backend
            .list(
                &mut f.transport,
                f.task,
                ListOptions {
                    on_failure: Some(Rc::new(move |error| {
                        *sink.borrow_mut() = Some(error.to_string());
                    })),
                    ..Default::default()
                },
            )
            .expect("resource known");

        let response = HttpResponse { status: 503, headers: Vec::new(), body: "down".into() };
        let outcome = f.backend.complete(&mut f.store, id, Ok(response));
        assert!(matches!(outcome, Outcome::Failed(SyncError::Transport { status: 503, .. })));
        assert_eq!(seen.borrow().as_deref(), Some("HTTP 503: down"));
    }

    #[test]
    fn preload_folds_without_network() {
        let mut f = fixture();
        let folded = f.backend.preload(
            &mut f.store,
            vec![json!({"id": 1, "type": "Task", "title": "seeded"})],
        );
        assert_eq!(folded, 1);
        let key = f.store.resolve_record(&json!(1), f.task);
        assert!(!f.store.is_loaded(key));
    }

    #[test]
    fn js_escape_matches_legacy_rules() {
        assert_eq!(js_escape("a1@*_+-./"), "a1@*_+-./");
        assert_eq!(js_escape(r#"{"a":1}"#), "%7B%22a%22%3A1%7D");
        assert_eq!(js_escape("é"), "%E9");
        assert_eq!(js_escape("€"), "%u20AC");
    }
}
