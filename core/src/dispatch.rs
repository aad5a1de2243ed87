//! Request dispatch: building HTTP request descriptors and demultiplexing
//! transport completions into context-specific continuations.
//!
//! # Design
//! `Dispatcher` turns a `(resource, action, ids, params, method)` tuple into
//! a fresh `HttpRequest` per call — descriptors are never shared or reused
//! across dispatches — submits it through the transport, and parks an
//! [`Exchange`] until the host reports completion. Completion runs a chain
//! of hooks: the per-call hook, then the dispatcher-wide hook; each returns
//! [`Flow`], and `Flow::Halt` short-circuits the rest of the chain. What
//! survives the chain is handed back to the owning backend as a
//! [`ChainOutcome`] so the backend can run its internal handler for the
//! exchange's kind.
//!
//! A completion for an id with no pending exchange (cancelled, or simply
//! unknown) is discarded with a debug log — a late response for a cancelled
//! operation must never reconcile stale data.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use serde_json::Value;

use crate::error::SyncError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, RequestId, Transport, TransportError};
use crate::query_string;
use crate::registry::TypeId;
use crate::store::{DataHash, StoreKey};

/// Continuation-chain verdict. `Halt` stops propagation to later handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

/// Hook observing a raw response (or failure) before the internal handlers
/// run. The second argument is the concurrency token from the response.
pub type ResponseHook = Rc<dyn Fn(&HttpResponse, Option<&str>) -> Flow>;

/// Everything needed to build one HTTP request.
///
/// `params` is the wire payload/query bag left after the recognized control
/// options have been pulled out into the dedicated fields.
pub struct Dispatch {
    pub resource: String,
    pub action: &'static str,
    pub ids: Vec<String>,
    pub params: DataHash,
    pub method: HttpMethod,
    /// Explicit URL override; wins over the composed format-template URL.
    pub url: Option<String>,
    /// `Accept` header override.
    pub accept: Option<String>,
    /// Concurrency token sent back to the provider for not-modified checks.
    pub cache_code: Option<String>,
    /// Raw JSON body. When present it wins over form-encoded `params` and
    /// the request goes out as `application/json`.
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Rewrite Put/Delete into Post with an injected `_method` param, for
    /// providers fronting clients that cannot speak uncommon methods.
    pub emulate_uncommon_methods: bool,
}

impl Dispatch {
    pub fn new(resource: impl Into<String>, action: &'static str, method: HttpMethod) -> Self {
        Self {
            resource: resource.into(),
            action,
            ids: Vec::new(),
            params: DataHash::new(),
            method,
            url: None,
            accept: None,
            cache_code: None,
            body: None,
            headers: Vec::new(),
            emulate_uncommon_methods: false,
        }
    }
}

/// Per-dispatch context threaded from issue to completion. `kind` selects
/// the owning backend's internal handler; the rest is the state that handler
/// needs to reconcile the response.
pub struct Exchange<K> {
    pub kind: K,
    /// Records under operation, in submission order.
    pub records: Vec<StoreKey>,
    /// Fallback type for response items without a resolvable type tag.
    pub default_type: Option<TypeId>,
    /// Correlation-id → record map for keyed (non-positional) acknowledgement
    /// matching.
    pub correlation: HashMap<String, StoreKey>,
    pub on_response: Option<ResponseHook>,
    pub on_response_error: Option<ResponseHook>,
    pub on_success: Option<SuccessHandler>,
    pub on_failure: Option<FailureHandler>,
}

/// Operation-level success continuation.
pub type SuccessHandler = Rc<dyn Fn(&Completion)>;
/// Operation-level failure continuation.
pub type FailureHandler = Rc<dyn Fn(&SyncError)>;

/// What a lifecycle operation ultimately delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Listed {
        records: Vec<StoreKey>,
        count: Option<u64>,
        cache_code: Option<String>,
    },
    NotModified,
    Created { records: Vec<StoreKey> },
    Refreshed { records: Vec<StoreKey> },
    Committed { records: Vec<StoreKey> },
    Destroyed { records: Vec<StoreKey> },
}

/// What `complete` delivered for one request, after callbacks have fired.
#[derive(Debug)]
pub enum Outcome {
    Done(Completion),
    Halted,
    Discarded,
    Failed(SyncError),
}

impl<K> Exchange<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            records: Vec::new(),
            default_type: None,
            correlation: HashMap::new(),
            on_response: None,
            on_response_error: None,
            on_success: None,
            on_failure: None,
        }
    }
}

/// Result of running the completion chain for one request.
pub enum ChainOutcome<K> {
    /// Chain ran through; the backend's internal handler should reconcile.
    Success {
        exchange: Exchange<K>,
        response: HttpResponse,
        cache_code: Option<String>,
        not_modified: bool,
    },
    /// The transport or the provider failed; hooks have run, the backend's
    /// failure handler still owes the user continuation.
    Failure { exchange: Exchange<K>, error: SyncError },
    /// A hook returned `Flow::Halt`.
    Halted,
    /// No pending exchange for this id.
    Discarded,
}

/// Builds request descriptors, submits them, and demultiplexes completions.
pub struct Dispatcher<K> {
    url_format: String,
    cache_header: String,
    next_id: RequestId,
    pending: HashMap<RequestId, Exchange<K>>,
    on_success: Option<ResponseHook>,
    on_failure: Option<ResponseHook>,
}

impl<K> Dispatcher<K> {
    pub fn new(url_format: impl Into<String>) -> Self {
        Self {
            url_format: url_format.into(),
            cache_header: "X-Cache-Token".to_string(),
            next_id: 1,
            pending: HashMap::new(),
            on_success: None,
            on_failure: None,
        }
    }

    /// Dispatcher-wide success hook, run after the per-call hook on every
    /// completed request.
    pub fn set_on_success(&mut self, hook: ResponseHook) {
        self.on_success = Some(hook);
    }

    /// Dispatcher-wide failure hook.
    pub fn set_on_failure(&mut self, hook: ResponseHook) {
        self.on_failure = Some(hook);
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Drop the pending exchange for `id`, so a later completion is
    /// discarded. Returns true if there was one.
    pub fn forget(&mut self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Build the request for `dispatch`, submit it, and park `exchange`
    /// until completion. Issues exactly one request; never retries.
    pub fn dispatch(
        &mut self,
        transport: &mut dyn Transport,
        dispatch: Dispatch,
        exchange: Exchange<K>,
    ) -> RequestId {
        let request = self.build_request(dispatch);
        let id = self.next_id;
        self.next_id += 1;
        debug!("-> {} {}", request.method.as_str(), request.url);
        self.pending.insert(id, exchange);
        transport.submit(id, request);
        id
    }

    fn build_request(&self, dispatch: Dispatch) -> HttpRequest {
        let Dispatch {
            resource,
            action,
            ids,
            mut params,
            mut method,
            url,
            accept,
            cache_code,
            body,
            headers,
            emulate_uncommon_methods,
        } = dispatch;

        if emulate_uncommon_methods
            && matches!(method, HttpMethod::Put | HttpMethod::Delete)
        {
            let emulated = method.as_str().to_ascii_lowercase();
            params.insert("_method".to_string(), Value::String(emulated));
            method = HttpMethod::Post;
        }

        let mut url = url.unwrap_or_else(|| {
            let id_part = if ids.len() == 1 { ids[0].as_str() } else { "" };
            format!("{}{id_part}", apply_format(&self.url_format, &resource, action))
        });

        if ids.len() > 1 {
            params.insert("ids".to_string(), Value::String(ids.join(",")));
        }

        let mut out_headers = Vec::new();
        out_headers.push((
            "Accept".to_string(),
            accept.unwrap_or_else(|| "application/json, */*".to_string()),
        ));
        if let Some(code) = cache_code {
            out_headers.push((self.cache_header.clone(), code));
        }
        out_headers.extend(headers);

        let mut out_body = None;
        if let Some(json_body) = body {
            out_headers.push(("Content-Type".to_string(), "application/json".to_string()));
            out_body = Some(json_body.to_string());
        } else if !params.is_empty() {
            let encoded = query_string::encode(&params);
            // Safe reads and non-emulated deletes carry parameters in the
            // URL; a delete body may be refused by the transport.
            if matches!(method, HttpMethod::Get | HttpMethod::Delete) {
                let join = if url.contains('?') { '&' } else { '?' };
                url.push(join);
                url.push_str(&encoded);
            } else {
                out_headers.push((
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ));
                out_body = Some(encoded);
            }
        }

        HttpRequest { method, url, headers: out_headers, body: out_body }
    }

    /// Pop the exchange for `id` and run the continuation chain against the
    /// host-reported result.
    pub fn complete(
        &mut self,
        id: RequestId,
        result: Result<HttpResponse, TransportError>,
    ) -> ChainOutcome<K> {
        let Some(exchange) = self.pending.remove(&id) else {
            debug!("discarding completion for request {id}: no pending exchange");
            return ChainOutcome::Discarded;
        };

        match result {
            Ok(response) if response.status < 400 => {
                let cache_code = response.header("Last-Modified").map(str::to_string);
                let token = cache_code.as_deref();
                if let Some(hook) = &exchange.on_response {
                    if hook(&response, token) == Flow::Halt {
                        return ChainOutcome::Halted;
                    }
                }
                if let Some(hook) = &self.on_success {
                    if hook(&response, token) == Flow::Halt {
                        return ChainOutcome::Halted;
                    }
                }
                let not_modified = response.is_not_modified();
                ChainOutcome::Success { exchange, response, cache_code, not_modified }
            }
            Ok(response) => {
                let error = SyncError::Transport {
                    status: response.status,
                    body: response.body.clone(),
                };
                self.run_failure_chain(exchange, response, error)
            }
            Err(failure) => {
                let error = SyncError::Transport { status: 0, body: failure.message.clone() };
                let response = HttpResponse {
                    status: 0,
                    headers: Vec::new(),
                    body: failure.message,
                };
                self.run_failure_chain(exchange, response, error)
            }
        }
    }

    fn run_failure_chain(
        &self,
        exchange: Exchange<K>,
        response: HttpResponse,
        error: SyncError,
    ) -> ChainOutcome<K> {
        let token = response.header("Last-Modified");
        if let Some(hook) = &exchange.on_response_error {
            if hook(&response, token) == Flow::Halt {
                return ChainOutcome::Halted;
            }
        }
        if let Some(hook) = &self.on_failure {
            if hook(&response, token) == Flow::Halt {
                return ChainOutcome::Halted;
            }
        }
        ChainOutcome::Failure { exchange, error }
    }
}

/// Apply a two-slot format template: the first `{}` takes the resource, the
/// second takes the action.
fn apply_format(format: &str, resource: &str, action: &str) -> String {
    let with_resource = format.replacen("{}", resource, 1);
    with_resource.replacen("{}", action, 1)
}
