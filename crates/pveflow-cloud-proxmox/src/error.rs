//! Proxmox client error types

use pveflow_cloud::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxmoxError {
    #[error("Environment variable not set: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Refusing to disable TLS verification for production environment '{0}'. Use a lab profile or a trusted certificate"
    )]
    InsecureTlsRefused(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Proxmox API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Task {upid} failed: {reason}")]
    TaskFailed { upid: String, reason: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProxmoxError>;

/// Classify an API error reported with HTTP status `status`
fn classify(status: u16, message: String) -> ClientError {
    let lower = message.to_lowercase();
    match status {
        401 => ClientError::AuthenticationFailed(message),
        404 => ClientError::NotFound(message),
        408 | 429 => ClientError::Transient(message),
        500 if lower.contains("does not exist") || lower.contains("no such") => {
            ClientError::NotFound(message)
        }
        500 if lower.contains("already exists") || lower.contains("already defined") => {
            ClientError::Conflict(message)
        }
        // lock contention on the cluster filesystem
        500 if lower.contains("got timeout") || lower.contains("can't lock") => {
            ClientError::Transient(message)
        }
        501..=599 => ClientError::Transient(message),
        _ => ClientError::Rejected(format!("HTTP {}: {}", status, message)),
    }
}

impl From<ProxmoxError> for ClientError {
    fn from(err: ProxmoxError) -> Self {
        match err {
            ProxmoxError::Api { status, message } => classify(status, message),
            ProxmoxError::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                ClientError::Transient(e.to_string())
            }
            other => ClientError::Rejected(other.to_string()),
        }
    }
}
