//! Record lifecycle coordination for the CouchDB dialect.
//!
//! # Design
//! CouchDB has no REST-style collection verbs, so the coordinator speaks the
//! design-document/view/bulk-docs dialect instead: `list` reads a predefined
//! view or posts a synthesized temp view, and every write goes through one
//! `_bulk_docs` batch per resource group. Bulk acknowledgements correlate by
//! POSITION — the provider's contract is that the response array preserves
//! submission order. That invariant is verified rather than assumed: the
//! response must be exactly as long as the submission, and wherever a
//! submitted doc carried a known `_id`, the acknowledgement at the same
//! index must repeat it. Any violation fails the whole batch instead of
//! silently attaching identities to the wrong records.
//!
//! Every record-scoped dispatch lands in a cancellation registry keyed by
//! store key. Cancellation aborts best-effort and forgets the exchange, so
//! a response that arrives after a cancel is discarded instead of
//! reconciling stale data. A second dispatch for a key that is already
//! pending supersedes (aborts) the prior request, keeping at most one
//! in-flight request per record identity.

use std::collections::HashMap;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::case;
use crate::dispatch::{
    ChainOutcome, Completion, Dispatch, Dispatcher, Exchange, Outcome, ResponseHook,
};
use crate::error::SyncError;
use crate::http::{HttpMethod, HttpResponse, RequestId, Transport, TransportError};
use crate::reconcile::fold_into_store;
use crate::registry::{TypeId, TypeRegistry};
use crate::rest::{apply_write_options, destroy_locally, parse_body, ListOptions, WriteOptions};
use crate::store::{
    group_by_resource, value_string, FoldedRecord, RecordStore, ResourceGroup, StoreKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkOp {
    Create,
    Commit,
    Destroy,
}

enum CouchKind {
    List,
    Refresh,
    Bulk {
        op: BulkOp,
        /// Submission order, with the `_id` each doc carried (None for
        /// creates, whose identity the provider assigns).
        submitted: Vec<(StoreKey, Option<String>)>,
    },
}

#[derive(Deserialize)]
struct ViewEnvelope {
    #[serde(default)]
    total_rows: Option<u64>,
    rows: Vec<ViewRow>,
}

#[derive(Deserialize)]
struct ViewRow {
    id: Value,
    value: Value,
}

#[derive(Deserialize)]
struct BulkEnvelope {
    new_revs: Vec<Map<String, Value>>,
}

/// Lifecycle coordinator for a CouchDB-flavored server.
pub struct CouchBackend {
    registry: Rc<TypeRegistry>,
    dispatcher: Dispatcher<CouchKind>,
    pending_records: HashMap<StoreKey, RequestId>,
}

impl CouchBackend {
    pub fn new(registry: Rc<TypeRegistry>) -> Self {
        Self {
            registry,
            // The dialect builds explicit URLs everywhere; the template only
            // backs odd custom dispatches.
            dispatcher: Dispatcher::new("/{}/{}"),
            pending_records: HashMap::new(),
        }
    }

    pub fn set_on_success(&mut self, hook: ResponseHook) {
        self.dispatcher.set_on_success(hook);
    }

    pub fn set_on_failure(&mut self, hook: ResponseHook) {
        self.dispatcher.set_on_failure(hook);
    }

    /// The in-flight request registered for `key`, if any.
    pub fn pending_for(&self, key: StoreKey) -> Option<RequestId> {
        self.pending_records.get(&key).copied()
    }

    /// Query the records of `type_id`. A predefined view (caller-supplied or
    /// declared on the type) is read directly; otherwise a temp view
    /// filtering on the type name is posted, since temp-view execution
    /// requires a request body.
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

        let view = options.view.or_else(|| record_type.default_view.clone());
        let mut dispatch = match view {
            Some(view) => {
                let mut dispatch = Dispatch::new(resource.clone(), "list", HttpMethod::Get);
                dispatch.url = Some(format!("{resource}/{view}"));
                dispatch
            }
            None => {
                let mut dispatch = Dispatch::new(resource.clone(), "list", HttpMethod::Post);
                dispatch.url = Some(format!("{resource}/_temp_view"));
                dispatch.body = Some(serde_json::json!({
                    "map": format!(
                        "function(doc) {{ if (doc.type == '{}') {{ emit(doc._id, doc) }}}}",
                        record_type.name
                    ),
                }));
                dispatch
            }
        };
        dispatch.cache_code = options.cache_code;
        if let Some(conditions) = options.conditions {
            dispatch.params.extend(case::map_to_wire(conditions));
        }

        let mut exchange = Exchange::new(CouchKind::List);
        exchange.default_type = Some(type_id);
        exchange.on_success = options.on_success;
        exchange.on_failure = options.on_failure;
        exchange.on_response = options.on_response;
        exchange.on_response_error = options.on_response_error;

        Ok(self.dispatcher.dispatch(transport, dispatch, exchange))
    }

    /// Create `records`: one `_bulk_docs` batch per resource group. New docs
    /// go up without identity — the provider assigns `_id`/`_rev`.
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

            let mut docs = Vec::new();
            let mut submitted = Vec::new();
            let mut default_type = None;
            for &key in &keys {
                let Some(data) = store.record_data(key) else { continue };
                let Some(type_id) = store.record_type_of(key) else { continue };
                if default_type.is_none() {
                    default_type = Some(type_id);
                }
                let mut doc = case::map_to_wire(data);
                // No identity on create; the local temp guid stays local.
                doc.remove("id");
                doc.remove("_rev");
                doc.insert(
                    "type".to_string(),
                    Value::String(self.registry.get(type_id).name.clone()),
                );
                docs.push(Value::Object(doc));
                submitted.push((key, None));
            }
            if docs.is_empty() {
                continue;
            }

            let id = self.dispatch_bulk(
                transport,
                &resource,
                "create",
                docs,
                BulkOp::Create,
                submitted,
                keys,
                default_type,
                options,
            );
            issued.push(id);
        }
        Ok(issued)
    }

    /// Update `records`: one `_bulk_docs` batch per resource group, each doc
    /// carrying its `_id` (and the `_rev` proving the local copy's vintage).
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

            let mut docs = Vec::new();
            let mut submitted = Vec::new();
            let mut default_type = None;
            for &key in &keys {
                let Some(data) = store.record_data(key) else { continue };
                let Some(id_value) = store.id_of(key) else { continue };
                if default_type.is_none() {
                    default_type = store.record_type_of(key);
                }
                let doc_id = value_string(&id_value);
                let mut doc = case::map_to_wire(data);
                doc.remove("id");
                doc.insert("_id".to_string(), Value::String(doc_id.clone()));
                if !doc.contains_key("type") {
                    if let Some(type_id) = store.record_type_of(key) {
                        doc.insert(
                            "type".to_string(),
                            Value::String(self.registry.get(type_id).name.clone()),
                        );
                    }
                }
                docs.push(Value::Object(doc));
                submitted.push((key, Some(doc_id)));
            }
            if docs.is_empty() {
                continue;
            }

            let id = self.dispatch_bulk(
                transport,
                &resource,
                "update",
                docs,
                BulkOp::Commit,
                submitted,
                keys,
                default_type,
                options,
            );
            issued.push(id);
        }
        Ok(issued)
    }

    /// Delete `records`: `{_id, _rev, _deleted: true}` docs in one
    /// `_bulk_docs` batch per group. The wildcard group and groups of only
    /// never-persisted records complete locally.
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

            let mut docs = Vec::new();
            let mut submitted = Vec::new();
            let mut default_type = None;
            for &key in &keys {
                if default_type.is_none() {
                    default_type = store.record_type_of(key);
                }
                if store.is_new(key) {
                    continue;
                }
                let Some(id_value) = store.id_of(key) else { continue };
                let doc_id = value_string(&id_value);
                let mut doc = Map::new();
                doc.insert("_id".to_string(), Value::String(doc_id.clone()));
                if let Some(rev) = store.record_data(key).and_then(|data| data.get("_rev").cloned())
                {
                    doc.insert("_rev".to_string(), rev);
                }
                doc.insert("_deleted".to_string(), Value::Bool(true));
                docs.push(Value::Object(doc));
                submitted.push((key, Some(doc_id)));
            }
            if docs.is_empty() {
                // Nothing was ever persisted; complete locally.
                destroy_locally(store, keys, options);
                continue;
            }

            let id = self.dispatch_bulk(
                transport,
                &resource,
                "destroy",
                docs,
                BulkOp::Destroy,
                submitted,
                keys,
                default_type,
                options,
            );
            issued.push(id);
        }
        Ok(issued)
    }

    /// Re-fetch `records` one document read at a time — the dialect has no
    /// combined fetch. Slow for large sets; prefer `list` with a view.
    pub fn refresh(
        &mut self,
        transport: &mut dyn Transport,
        store: &mut dyn RecordStore,
        records: &[StoreKey],
        options: &WriteOptions,
    ) -> Result<Vec<RequestId>, SyncError> {
        let mut issued = Vec::new();
        for &key in records {
            let Some(type_id) = store.record_type_of(key) else { continue };
            let Some(resource) = self.registry.get(type_id).resource.clone() else { continue };
            let Some(id_value) = store.id_of(key) else { continue };
            let doc_id = value_string(&id_value);

            let mut dispatch = Dispatch::new(resource.clone(), "show", HttpMethod::Get);
            dispatch.url = Some(format!("{resource}/{doc_id}"));

            let mut exchange = Exchange::new(CouchKind::Refresh);
            exchange.records = vec![key];
            exchange.default_type = Some(type_id);
            apply_write_options(&mut exchange, options);

            let id = self.dispatcher.dispatch(transport, dispatch, exchange);
            self.register_pending(transport, &[key], id);
            issued.push(id);
        }
        Ok(issued)
    }

    /// Best-effort cancellation for the requests registered under `keys`.
    /// Forgotten exchanges discard any late response instead of reconciling
    /// it. Returns how many requests were dropped from the pending set.
    pub fn cancel(&mut self, transport: &mut dyn Transport, keys: &[StoreKey]) -> usize {
        let mut cancelled = 0;
        for key in keys {
            if let Some(id) = self.pending_records.remove(key) {
                transport.abort(id);
                if self.dispatcher.forget(id) {
                    cancelled += 1;
                }
                // A bulk request covers several records; drop them all.
                self.pending_records.retain(|_, pending| *pending != id);
            }
        }
        cancelled
    }

    /// Feed a host-reported completion back in.
    pub fn complete(
        &mut self,
        store: &mut dyn RecordStore,
        id: RequestId,
        result: Result<HttpResponse, TransportError>,
    ) -> Outcome {
        // The request is no longer in flight whatever the outcome.
        self.pending_records.retain(|_, pending| *pending != id);

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
                    if matches!(exchange.kind, CouchKind::List) {
                        if let Some(on_success) = &exchange.on_success {
                            on_success(&Completion::NotModified);
                        }
                    }
                    return Outcome::Done(Completion::NotModified);
                }
                let handled = match &exchange.kind {
                    CouchKind::List => self.finish_list(store, &exchange, &response, cache_code),
                    CouchKind::Refresh => self.finish_refresh(store, &exchange, &response),
                    CouchKind::Bulk { op, submitted } => {
                        self.finish_bulk(store, &exchange, *op, submitted, &response)
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

    #[allow(clippy::too_many_arguments)]
    fn dispatch_bulk(
        &mut self,
        transport: &mut dyn Transport,
        resource: &str,
        action: &'static str,
        docs: Vec<Value>,
        op: BulkOp,
        submitted: Vec<(StoreKey, Option<String>)>,
        keys: Vec<StoreKey>,
        default_type: Option<TypeId>,
        options: &WriteOptions,
    ) -> RequestId {
        let mut dispatch = Dispatch::new(resource.to_string(), action, HttpMethod::Post);
        dispatch.url = Some(format!("{resource}/_bulk_docs"));
        dispatch.body = Some(serde_json::json!({ "docs": docs }));

        let mut exchange = Exchange::new(CouchKind::Bulk { op, submitted });
        exchange.records = keys.clone();
        exchange.default_type = default_type;
        apply_write_options(&mut exchange, options);

        let id = self.dispatcher.dispatch(transport, dispatch, exchange);
        self.register_pending(transport, &keys, id);
        id
    }

    /// Record `id` as the in-flight request for each key. An already-pending
    /// key supersedes: the prior request is aborted and its exchange
    /// forgotten, so at most one request is in flight per record identity.
    fn register_pending(&mut self, transport: &mut dyn Transport, keys: &[StoreKey], id: RequestId) {
        for &key in keys {
            if let Some(prior) = self.pending_records.insert(key, id) {
                if prior != id {
                    transport.abort(prior);
                    self.dispatcher.forget(prior);
                    self.pending_records.retain(|_, pending| *pending != prior);
                }
            }
        }
    }

    fn finish_list(
        &self,
        store: &mut dyn RecordStore,
        exchange: &Exchange<CouchKind>,
        response: &HttpResponse,
        cache_code: Option<String>,
    ) -> Result<Completion, SyncError> {
        let envelope: ViewEnvelope = parse_body(&response.body)?;

        let mut row_ids = Vec::with_capacity(envelope.rows.len());
        let mut items = Vec::with_capacity(envelope.rows.len());
        for row in envelope.rows {
            let mut value = row.value;
            if let Value::Object(map) = &mut value {
                // Predefined views may emit bare payloads; seed identity
                // from the row id so the fold can seat a primary key.
                if !map.contains_key("_id") && !map.contains_key("id") {
                    map.insert("_id".to_string(), row.id.clone());
                }
            }
            row_ids.push(row.id);
            items.push(value);
        }
        fold_into_store(store, &self.registry, items, exchange.default_type, false);

        let mut resolved = Vec::with_capacity(row_ids.len());
        if let Some(type_id) = exchange.default_type {
            for row_id in &row_ids {
                resolved.push(store.resolve_record(row_id, type_id));
            }
        }
        Ok(Completion::Listed { records: resolved, count: envelope.total_rows, cache_code })
    }

    fn finish_refresh(
        &self,
        store: &mut dyn RecordStore,
        exchange: &Exchange<CouchKind>,
        response: &HttpResponse,
    ) -> Result<Completion, SyncError> {
        let doc: Value = parse_body(&response.body)?;
        if !doc.is_object() {
            return Err(SyncError::MalformedPayload(
                "expected a document object".to_string(),
            ));
        }
        fold_into_store(store, &self.registry, vec![doc], exchange.default_type, true);
        Ok(Completion::Refreshed { records: exchange.records.clone() })
    }

    fn finish_bulk(
        &self,
        store: &mut dyn RecordStore,
        exchange: &Exchange<CouchKind>,
        op: BulkOp,
        submitted: &[(StoreKey, Option<String>)],
        response: &HttpResponse,
    ) -> Result<Completion, SyncError> {
        let envelope: BulkEnvelope = parse_body(&response.body)?;
        let acks = envelope.new_revs;

        // Positional correlation is only sound if the provider really did
        // preserve submission order; check what is checkable before touching
        // any record.
        if acks.len() != submitted.len() {
            return Err(SyncError::MalformedPayload(format!(
                "bulk response carries {} acknowledgements for {} submitted docs",
                acks.len(),
                submitted.len()
            )));
        }
        for (index, ((_, expected), ack)) in submitted.iter().zip(&acks).enumerate() {
            let Some(expected_id) = expected else { continue };
            let ack_id = ack.get("id").and_then(Value::as_str);
            if ack_id != Some(expected_id.as_str()) {
                return Err(SyncError::MalformedPayload(format!(
                    "bulk response out of order at index {index}: expected id {expected_id}, got {}",
                    ack_id.unwrap_or("<missing>")
                )));
            }
        }

        if op == BulkOp::Destroy {
            store.remove_records(&exchange.records);
            return Ok(Completion::Destroyed { records: exchange.records.clone() });
        }

        let mut items = Vec::with_capacity(acks.len());
        for ((key, _), ack) in submitted.iter().zip(acks) {
            let Some(ack_id) = ack.get("id").and_then(Value::as_str).map(str::to_string) else {
                return Err(SyncError::MalformedPayload(
                    "bulk acknowledgement without id".to_string(),
                ));
            };
            let Some(type_id) = store.record_type_of(*key) else { continue };
            let pk = self.registry.get(type_id).primary_key.clone();

            // The acknowledged identity lands on the primary key; a custom
            // primary key reads its decamelized field from the ack when the
            // provider echoes one.
            let pk_value = if pk == "guid" {
                Value::String(ack_id.clone())
            } else {
                ack.get(&case::decamelize(&pk))
                    .cloned()
                    .unwrap_or_else(|| Value::String(ack_id.clone()))
            };
            store.mark_saved(*key, pk_value);

            let mut data = store.record_data(*key).unwrap_or_default();
            if let Some(rev) = ack.get("rev") {
                data.insert("_rev".to_string(), rev.clone());
            }
            items.push(FoldedRecord { type_id, data });
        }
        store.bulk_apply_fetched(items, true);

        let records = exchange.records.clone();
        Ok(match op {
            BulkOp::Create => Completion::Created { records },
            _ => Completion::Committed { records },
        })
    }
}
