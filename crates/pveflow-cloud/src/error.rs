//! Reconciliation and client error types

use pveflow_core::{ResourceId, ValidationError};
use thiserror::Error;

/// Errors raised by a [`crate::ResourceClient`] call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rejected by API: {0}")]
    Rejected(String),
}

impl ClientError {
    /// Only transient errors are eligible for retry
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors that abort a whole run or a state operation.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Dependency cycle detected: {}", format_ids(.0))]
    Cycle(Vec<ResourceId>),

    #[error("{resource} depends on unknown resource {target}")]
    UnknownDependency {
        resource: ResourceId,
        target: ResourceId,
    },

    #[error("{resource} cannot depend on {target}, which belongs to a later phase")]
    PhaseViolation {
        resource: ResourceId,
        target: ResourceId,
    },

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, CloudError>;
