//! Client-side record synchronization core.
//!
//! # Overview
//! Reconciles a local record store with remote HTTP resource backends — a
//! generic REST-style server ([`RestBackend`]) and a CouchDB-flavored server
//! ([`CouchBackend`]) — without touching the network (host-does-IO pattern).
//! Lifecycle operations translate local create/update/delete/fetch intents
//! into `HttpRequest` values submitted through a [`Transport`]; the host
//! executes the I/O and feeds each result back through `complete`, which
//! folds server-assigned identities, revisions, and record data into the
//! store.
//!
//! # Design
//! - The core is single-threaded and continuation-driven; all concurrency
//!   is host I/O latency. Operations return immediately after submitting.
//! - Record state lives in a host-supplied [`RecordStore`]; the core mutates
//!   it only from completion handling, one coherent batch at a time.
//! - Record types are an explicit [`TypeRegistry`] populated at
//!   configuration time; wire type tags resolve through a namespace-prefix
//!   search.
//! - Request descriptors are built fresh per dispatch and never reused.
//! - Completion hooks chain with an explicit [`Flow`] verdict; `Flow::Halt`
//!   short-circuits later handlers.
//! - JSON parsing is strict: a malformed response surfaces as a typed error
//!   on the failure path and reconciles nothing.

pub mod case;
pub mod couchdb;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod query_string;
pub mod reconcile;
pub mod registry;
pub mod rest;
pub mod store;

pub use couchdb::CouchBackend;
pub use dispatch::{Completion, Dispatch, Dispatcher, Exchange, Flow, Outcome, ResponseHook};
pub use error::SyncError;
pub use http::{HttpMethod, HttpRequest, HttpResponse, RequestId, Transport, TransportError};
pub use registry::{RecordType, TypeId, TypeRegistry};
pub use rest::{ListOptions, PostFormat, RestBackend, RestConfig, WriteOptions};
pub use store::{
    group_by_resource, DataHash, FoldedRecord, MemoryStore, RecordStore, ResourceGroup, StoreKey,
};
