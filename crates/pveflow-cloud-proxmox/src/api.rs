//! Thin HTTP layer over the Proxmox VE REST API
//!
//! Every response is wrapped in a `{"data": ...}` envelope. Mutations take
//! form-encoded parameters and long-running ones answer with a task id
//! (UPID) whose status is read from the node that runs it.

use crate::config::ProxmoxConfig;
use crate::error::{ProxmoxError, Result};
use pveflow_cloud::{PollPolicy, TaskOperation, TaskStatus};
use reqwest::{Method, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

/// Form parameters of a mutating request
pub type Params = Vec<(&'static str, String)>;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    message: Option<String>,
}

/// Authenticated API client bound to one endpoint
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    auth: String,
    node: String,
}

impl ApiClient {
    pub fn new(config: &ProxmoxConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ProxmoxError::InvalidConfig(format!("{}: {}", config.base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ProxmoxError::InvalidConfig(format!(
                "{} is not a base URL",
                config.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base,
            auth: config.auth_header(),
            node: config.node.clone(),
        })
    }

    /// Node that guests are created on
    pub fn node(&self) -> &str {
        &self.node
    }

    /// `/api2/json/<segments...>` with every segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ProxmoxError::InvalidConfig(format!("{} is not a base URL", self.base)))?
            .pop_if_empty()
            .extend(["api2", "json"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self
            .http
            .request(method, self.url(segments)?)
            .header(reqwest::header::AUTHORIZATION, &self.auth))
    }

    pub async fn get(&self, segments: &[&str]) -> Result<Value> {
        self.send(self.request(Method::GET, segments)?).await
    }

    pub async fn get_query(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Value> {
        self.send(self.request(Method::GET, segments)?.query(query))
            .await
    }

    pub async fn post(&self, segments: &[&str], params: &Params) -> Result<Value> {
        self.send(self.request(Method::POST, segments)?.form(params))
            .await
    }

    pub async fn put(&self, segments: &[&str], params: &Params) -> Result<Value> {
        self.send(self.request(Method::PUT, segments)?.form(params))
            .await
    }

    pub async fn delete(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Value> {
        self.send(self.request(Method::DELETE, segments)?.query(query))
            .await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let envelope: Option<Envelope> = serde_json::from_str(&body).ok();

        if status.is_success() {
            let envelope = envelope.ok_or_else(|| {
                ProxmoxError::UnexpectedResponse(format!("response is not JSON: {}", body))
            })?;
            return Ok(envelope.data);
        }

        let message = envelope
            .and_then(|e| error_message(e.errors, e.message))
            .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            });
        tracing::debug!(status = status.as_u16(), %message, "Proxmox API error");
        Err(ProxmoxError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Status of a task, read from the node named in its UPID
    pub async fn task_status(&self, upid: &str) -> Result<TaskStatus> {
        let node = upid_node(upid).ok_or_else(|| {
            ProxmoxError::UnexpectedResponse(format!("malformed task id: {}", upid))
        })?;
        let data = self.get(&["nodes", node, "tasks", upid, "status"]).await?;

        let status = data.get("status").and_then(Value::as_str).unwrap_or_default();
        if status == "running" {
            return Ok(TaskStatus::Running);
        }
        let exit = data
            .get("exitstatus")
            .and_then(Value::as_str)
            .unwrap_or("unknown exit status");
        if exit == "OK" || exit.starts_with("WARNINGS") {
            Ok(TaskStatus::Succeeded)
        } else {
            Ok(TaskStatus::Failed(exit.to_string()))
        }
    }

    /// Wait for an intermediate task that a higher-level operation depends on
    pub async fn wait_task(
        &self,
        upid: &str,
        operation: TaskOperation,
        policy: &PollPolicy,
    ) -> Result<()> {
        let deadline = Instant::now() + policy.timeout_for(operation);
        let mut attempt = 0;

        loop {
            match self.task_status(upid).await {
                Ok(TaskStatus::Succeeded) => return Ok(()),
                Ok(TaskStatus::Failed(reason)) => {
                    return Err(ProxmoxError::TaskFailed {
                        upid: upid.to_string(),
                        reason,
                    });
                }
                Ok(TaskStatus::Running) => {}
                Err(ProxmoxError::Http(e)) if e.is_timeout() || e.is_connect() => {
                    tracing::warn!(upid, error = %e, "Task status unavailable, retrying");
                }
                Err(e) => return Err(e),
            }

            let delay = policy.delay_for_attempt(attempt);
            if Instant::now() + delay > deadline {
                return Err(ProxmoxError::TaskFailed {
                    upid: upid.to_string(),
                    reason: format!(
                        "{} did not finish within {}s",
                        operation,
                        policy.timeout_for(operation).as_secs()
                    ),
                });
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Task id returned by a mutation, if any
pub fn upid(data: &Value) -> Option<String> {
    data.as_str()
        .filter(|s| s.starts_with("UPID:"))
        .map(str::to_string)
}

/// Node field of `UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:`
pub fn upid_node(upid: &str) -> Option<&str> {
    let mut fields = upid.split(':');
    if fields.next()? != "UPID" {
        return None;
    }
    fields.next().filter(|node| !node.is_empty())
}

fn error_message(
    errors: Option<serde_json::Map<String, Value>>,
    message: Option<String>,
) -> Option<String> {
    let fields = errors
        .filter(|e| !e.is_empty())
        .map(|e| {
            e.iter()
                .map(|(field, err)| match err.as_str() {
                    Some(err) => format!("{}: {}", field, err.trim()),
                    None => format!("{}: {}", field, err),
                })
                .collect::<Vec<_>>()
                .join("; ")
        });
    match (message.map(|m| m.trim().to_string()), fields) {
        (Some(m), Some(f)) if !m.is_empty() => Some(format!("{} ({})", m, f)),
        (Some(m), None) if !m.is_empty() => Some(m),
        (_, f) => f,
    }
}
