//! [`ResourceClient`] implementation for Proxmox VE

use crate::api::ApiClient;
use crate::config::ProxmoxConfig;
use crate::error::Result;
use crate::guest::Guests;
use crate::sdn;
use async_trait::async_trait;
use pveflow_cloud::{
    ClientError, ClientResult, Completion, ObservedState, PollPolicy, ResourceClient, TaskHandle,
    TaskStatus,
};
use pveflow_core::{Attributes, ResourceId, ResourceSpec};
use serde_json::Value;

/// Proxmox VE client
pub struct ProxmoxClient {
    api: ApiClient,
    poll: PollPolicy,
}

impl ProxmoxClient {
    pub fn new(config: &ProxmoxConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
            poll: PollPolicy::default(),
        })
    }

    /// Polling used for intermediate tasks (clone, stop before delete)
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn guests(&self) -> Guests<'_> {
        Guests::new(&self.api, &self.poll)
    }

    /// Verify the token by reading the API version
    pub async fn check_auth(&self) -> ClientResult<String> {
        let data = self.api.get(&["version"]).await?;
        let version = data
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Rejected(format!("unexpected version response: {}", data)))?;
        tracing::info!(version, node = self.api.node(), "Connected to Proxmox VE");
        Ok(version.to_string())
    }
}

#[async_trait]
impl ResourceClient for ProxmoxClient {
    fn name(&self) -> &str {
        "proxmox"
    }

    async fn read(&self, id: &ResourceId) -> ClientResult<ObservedState> {
        if id.kind.is_guest() {
            self.guests().read(id).await
        } else {
            sdn::read(&self.api, id).await
        }
    }

    async fn create(&self, spec: &ResourceSpec) -> ClientResult<Completion> {
        if spec.kind().is_guest() {
            self.guests().create(spec).await
        } else {
            sdn::create(&self.api, spec).await
        }
    }

    async fn update(&self, id: &ResourceId, attributes: &Attributes) -> ClientResult<Completion> {
        if id.kind.is_guest() {
            self.guests().update(id, attributes).await
        } else {
            sdn::update(&self.api, id, attributes).await
        }
    }

    async fn delete(&self, id: &ResourceId) -> ClientResult<Completion> {
        if id.kind.is_guest() {
            self.guests().delete(id).await
        } else {
            sdn::delete(&self.api, id).await
        }
    }

    async fn task_status(&self, handle: &TaskHandle) -> ClientResult<TaskStatus> {
        Ok(self.api.task_status(&handle.id).await?)
    }
}
