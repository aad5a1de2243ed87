//! Error types for the synchronization core.
//!
//! # Design
//! `Transport` gets the raw status code and body because callers frequently
//! want to branch on "the server said no" versus everything else, and the
//! body is the only diagnostic the provider gives back. `MalformedPayload`
//! is a distinct variant so a parse failure reaches the failure path as a
//! typed event instead of being swallowed by a log line.

use std::fmt;

/// Errors produced while issuing lifecycle operations or reconciling their
/// responses.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The request failed at the HTTP or network level. `status` is 0 for
    /// network-level failures that never produced a response.
    Transport { status: u16, body: String },

    /// The response body could not be parsed as the structure the operation
    /// expects. No reconciliation is performed for such a response.
    MalformedPayload(String),

    /// The record type has no resource URL, so no collection endpoint can be
    /// derived for it.
    MissingResource(String),

    /// A request payload could not be serialized.
    Serialization(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Transport { status: 0, body } => {
                write!(f, "network failure: {body}")
            }
            SyncError::Transport { status, body } => {
                write!(f, "HTTP {status}: {body}")
            }
            SyncError::MalformedPayload(msg) => {
                write!(f, "malformed response payload: {msg}")
            }
            SyncError::MissingResource(name) => {
                write!(f, "record type {name} declares no resource URL")
            }
            SyncError::Serialization(msg) => {
                write!(f, "serialization failed: {msg}")
            }
        }
    }
}

impl std::error::Error for SyncError {}
