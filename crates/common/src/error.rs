//! Error types for the metal provider

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using the provider Error
pub type Result<T> = std::result::Result<T, Error>;

/// Operation being attempted when an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Delete,
    Wait,
    ImageLookup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Read => write!(f, "read"),
            Operation::Delete => write!(f, "delete"),
            Operation::Wait => write!(f, "wait"),
            Operation::ImageLookup => write!(f, "image lookup"),
        }
    }
}

/// Provider error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid machine spec: {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Transport error during {operation} of {key}: {message}")]
    Transport {
        operation: Operation,
        key: String,
        message: String,
    },

    #[error("Resource not found during {operation}: {kind} with id {id}")]
    NotFound {
        operation: Operation,
        kind: String,
        id: String,
    },

    #[error(
        "Timed out after {elapsed:?} waiting for {attribute} of {key} to become {target:?} (last observed: {last_observed:?})"
    )]
    Timeout {
        key: String,
        attribute: String,
        target: String,
        last_observed: Option<String>,
        elapsed: Duration,
    },

    #[error("Machine {id} failed during provisioning (last event: {last_event:?})")]
    ProvisioningFailed { id: String, last_event: Option<String> },

    #[error("Conflicting concurrent {operation} on {key}")]
    Conflict { key: String, operation: Operation },

    #[error("Machine {id} has no network attachment after {operation}")]
    MissingNetwork { operation: Operation, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn transport(operation: Operation, key: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Transport {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn machine_not_found(operation: Operation, id: impl Into<String>) -> Self {
        Error::NotFound {
            operation,
            kind: "machine".to_string(),
            id: id.into(),
        }
    }

    /// True when the remote system has no record of the resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Attribute a not-found or missing-network error to the enclosing operation
    ///
    /// Transport errors keep the exact call that failed.
    pub fn during(self, operation: Operation) -> Self {
        match self {
            Error::NotFound { kind, id, .. } => Error::NotFound { operation, kind, id },
            Error::MissingNetwork { id, .. } => Error::MissingNetwork { operation, id },
            other => other,
        }
    }
}
