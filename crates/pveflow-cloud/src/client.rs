//! Hypervisor client abstraction

use crate::error::ClientResult;
use async_trait::async_trait;
use pveflow_core::{AttrValue, Attributes, ResourceId, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default deadline for create, clone, update and delete tasks
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default deadline for start and stop tasks
pub const DEFAULT_POWER_TIMEOUT: Duration = Duration::from_secs(60);

/// Capability set over the hypervisor's management surface.
///
/// Implementations dispatch on [`ResourceId::kind`] and must be safe for
/// concurrent use: the engine calls them from several workers at once.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Returns the client name (e.g., "proxmox", "in-memory")
    fn name(&self) -> &str;

    /// Read the observed state; `ClientError::NotFound` when absent.
    async fn read(&self, id: &ResourceId) -> ClientResult<ObservedState>;

    /// Create the resource described by `spec`
    async fn create(&self, spec: &ResourceSpec) -> ClientResult<Completion>;

    /// Apply `attributes` (the full desired set) to an existing resource
    async fn update(&self, id: &ResourceId, attributes: &Attributes) -> ClientResult<Completion>;

    /// Delete the resource; `ClientError::NotFound` when already absent.
    async fn delete(&self, id: &ResourceId) -> ClientResult<Completion>;

    /// Current status of an asynchronous task
    async fn task_status(&self, handle: &TaskHandle) -> ClientResult<TaskStatus>;
}

/// Kind of long-running operation behind a task handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Create,
    Update,
    Delete,
    Start,
    Stop,
}

impl TaskOperation {
    pub fn default_timeout(&self) -> Duration {
        match self {
            TaskOperation::Start | TaskOperation::Stop => DEFAULT_POWER_TIMEOUT,
            TaskOperation::Create | TaskOperation::Update | TaskOperation::Delete => {
                DEFAULT_CREATE_TIMEOUT
            }
        }
    }
}

impl std::fmt::Display for TaskOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOperation::Create => write!(f, "create"),
            TaskOperation::Update => write!(f, "update"),
            TaskOperation::Delete => write!(f, "delete"),
            TaskOperation::Start => write!(f, "start"),
            TaskOperation::Stop => write!(f, "stop"),
        }
    }
}

/// Reference to an asynchronous hypervisor job (a Proxmox UPID)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
    pub operation: TaskOperation,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>, operation: TaskOperation) -> Self {
        Self {
            id: id.into(),
            operation,
        }
    }
}

/// Result of a mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The change is already in effect
    Done,
    /// The change runs asynchronously and must be awaited
    Task(TaskHandle),
}

/// Status reported for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// Status of an observed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Network object in effect
    Active,
    /// Network object with pending, unapplied changes
    Pending,
    /// Guest is running
    Running,
    /// Guest is stopped
    Stopped,
    /// Resource is in error state
    Error,
    /// Status is unknown
    Unknown,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Active => write!(f, "active"),
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Running => write!(f, "running"),
            ResourceStatus::Stopped => write!(f, "stopped"),
            ResourceStatus::Error => write!(f, "error"),
            ResourceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// State of a resource as reported by the hypervisor.
///
/// Only keys present in `attributes` take part in diffs; create-only
/// settings the API does not report back are simply left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub id: ResourceId,
    pub status: ResourceStatus,
    pub attributes: Attributes,
    /// Primary IP address for guests
    pub address: Option<String>,
}

impl ObservedState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            status: ResourceStatus::Unknown,
            attributes: Attributes::new(),
            address: None,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == ResourceStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        assert_eq!(
            TaskOperation::Create.default_timeout(),
            Duration::from_secs(300)
        );
        assert_eq!(TaskOperation::Start.default_timeout(), Duration::from_secs(60));
        assert_eq!(TaskOperation::Stop.default_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_observed_state_builder() {
        let state = ObservedState::new(ResourceId::vm(301))
            .with_status(ResourceStatus::Running)
            .with_attribute("memory", 4096u32)
            .with_address("10.100.2.21");

        assert!(state.is_running());
        assert_eq!(state.address.as_deref(), Some("10.100.2.21"));
        assert_eq!(state.attributes.get("memory"), Some(&AttrValue::Int(4096)));
    }
}
