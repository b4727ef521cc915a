//! Provider error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::client::StoreError;
use crate::resource::ResourceState;
use crate::schema::ValidationError;

/// Lifecycle operation an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Import,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Import => "import",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the provider to its caller.
///
/// Nothing is retried or recovered locally; remote failures are passed
/// through with the identifier and operation attached.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Namespace or name is empty or contains the separator.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Identifier is not of the form `<namespace>/<name>`.
    #[error("malformed identifier: {0:?}")]
    MalformedIdentifier(String),

    /// Configuration record does not satisfy the schema.
    #[error("{operation} {kind} {id}: validation failed: {source}")]
    Validation {
        operation: Operation,
        kind: &'static str,
        id: String,
        #[source]
        source: ValidationError,
    },

    /// Remote object does not exist.
    #[error("{operation} {kind} {id}: not found")]
    NotFound {
        operation: Operation,
        kind: &'static str,
        id: String,
    },

    /// Remote store call failed.
    #[error("{operation} {kind} {id}: {source}")]
    Remote {
        operation: Operation,
        kind: &'static str,
        id: String,
        #[source]
        source: StoreError,
    },

    /// Operation or wait exceeded its deadline.
    #[error("{operation} {kind} {id}: timed out after {elapsed:?}")]
    Timeout {
        operation: Operation,
        kind: &'static str,
        id: String,
        elapsed: Duration,
    },

    /// Caller cancelled the wait.
    #[error("{operation} {kind} {id}: cancelled")]
    Cancelled {
        operation: Operation,
        kind: &'static str,
        id: String,
    },

    /// A poll of the remote object failed while waiting.
    #[error("{operation} {kind} {id}: poll failed: {source}")]
    PollError {
        operation: Operation,
        kind: &'static str,
        id: String,
        #[source]
        source: StoreError,
    },

    /// Operation is not valid from the instance's current state.
    #[error("cannot {operation} {kind} {id} while {state}")]
    InvalidState {
        operation: Operation,
        kind: &'static str,
        id: String,
        state: ResourceState,
    },
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
