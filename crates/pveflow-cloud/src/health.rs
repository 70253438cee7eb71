//! Post-apply health validation
//!
//! Quick scope only reads: every resource exists, guests are running and
//! nothing drifted. Full scope also runs the checks registered by the
//! caller, such as reachability or tool presence on a node.

use crate::client::{ObservedState, ResourceClient};
use crate::plan;
use crate::retry::{RetryConfig, retry_transient};
use async_trait::async_trait;
use pveflow_core::{DesiredStateModel, ResourceKind, ResourceSpec};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Validation depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Quick,
    Full,
}

/// Result of one named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// A check run against each matching resource in Full scope
#[async_trait]
pub trait PostApplyCheck: Send + Sync {
    /// Check name, prefixed to the resource id in results
    fn name(&self) -> &str;

    /// Whether the check applies to resources of `kind` (guests by default)
    fn applies_to(&self, kind: ResourceKind) -> bool {
        kind.is_guest()
    }

    /// `Ok(detail)` when healthy, `Err(detail)` otherwise
    async fn check(
        &self,
        spec: &ResourceSpec,
        observed: &ObservedState,
    ) -> std::result::Result<String, String>;
}

/// Adapts an async closure into a [`PostApplyCheck`] for guests
pub struct FnCheck<F> {
    name: String,
    f: F,
}

impl<F> FnCheck<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> PostApplyCheck for FnCheck<F>
where
    F: Fn(ResourceSpec, ObservedState) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<String, String>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(
        &self,
        spec: &ResourceSpec,
        observed: &ObservedState,
    ) -> std::result::Result<String, String> {
        (self.f)(spec.clone(), observed.clone()).await
    }
}

/// Read-only verification of an applied model
pub struct HealthValidator {
    client: Arc<dyn ResourceClient>,
    retry: RetryConfig,
    checks: Vec<Arc<dyn PostApplyCheck>>,
    cancel: CancellationToken,
}

impl HealthValidator {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            checks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Register a check for Full scope
    pub fn register_post_apply_check(&mut self, check: Arc<dyn PostApplyCheck>) {
        self.checks.push(check);
    }

    /// Validate every resource of `model`
    pub async fn validate(&self, model: &DesiredStateModel, scope: Scope) -> Vec<CheckResult> {
        let mut results = Vec::new();

        for spec in model.resources() {
            let id = &spec.id;
            let observed =
                match retry_transient(&self.retry, "read", &self.cancel, || self.client.read(id))
                    .await
                {
                    Ok(observed) => observed,
                    Err(e) if e.is_not_found() => {
                        results.push(CheckResult::fail(format!("{} exists", id), "not found"));
                        continue;
                    }
                    Err(e) => {
                        results.push(CheckResult::fail(format!("{} exists", id), e.to_string()));
                        continue;
                    }
                };
            results.push(CheckResult::pass(
                format!("{} exists", id),
                format!("status {}", observed.status),
            ));

            if id.kind.is_guest() {
                let name = format!("{} running", id);
                results.push(if observed.is_running() {
                    CheckResult::pass(name, "running")
                } else {
                    CheckResult::fail(name, format!("status {}", observed.status))
                });
            }

            let drift = plan::changes(spec, &observed);
            let name = format!("{} matches desired state", id);
            results.push(if drift.is_empty() {
                CheckResult::pass(name, "no drift")
            } else {
                let detail = drift
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                CheckResult::fail(name, detail)
            });

            if scope == Scope::Full {
                for check in self.checks.iter().filter(|c| c.applies_to(id.kind)) {
                    let name = format!("{} {}", id, check.name());
                    debug!(check = %name, "Running post-apply check");
                    results.push(match check.check(spec, &observed).await {
                        Ok(detail) => CheckResult::pass(name, detail),
                        Err(detail) => CheckResult::fail(name, detail),
                    });
                }
            }
        }

        results
    }
}
