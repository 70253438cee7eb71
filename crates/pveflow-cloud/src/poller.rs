//! Task completion polling
//!
//! Hypervisor mutations return a task handle that must be polled until it
//! reaches a terminal status. Polling backs off exponentially and is bounded
//! by a per-operation deadline and by the run's cancellation token.

use crate::client::{ResourceClient, TaskHandle, TaskOperation, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff and deadline settings for task polling
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Delay before the second poll
    pub initial_interval: Duration,

    /// Upper bound for the delay between polls
    pub max_interval: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Deadline override; per-operation defaults apply when unset
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            timeout: None,
        }
    }
}

impl PollPolicy {
    /// Delay after the given (0-based) poll attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_interval.as_secs_f64()))
    }

    pub fn timeout_for(&self, operation: TaskOperation) -> Duration {
        self.timeout.unwrap_or_else(|| operation.default_timeout())
    }
}

/// Terminal outcome of an awaited task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure(String),
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    /// Error text recorded for a non-successful outcome
    pub fn describe(&self, handle: &TaskHandle, timeout: Duration) -> String {
        match self {
            TaskOutcome::Success => format!("task {} succeeded", handle.id),
            TaskOutcome::Failure(reason) => format!("task {} failed: {}", handle.id, reason),
            TaskOutcome::TimedOut => format!(
                "task {} ({}) did not finish within {}s",
                handle.id,
                handle.operation,
                timeout.as_secs()
            ),
            TaskOutcome::Cancelled => format!("task {} cancelled", handle.id),
        }
    }
}

/// Waits for hypervisor tasks to finish
#[derive(Clone)]
pub struct TaskPoller {
    client: Arc<dyn ResourceClient>,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl TaskPoller {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        policy: PollPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Poll `handle` until it succeeds, fails, exceeds `timeout` or the
    /// run is cancelled. Status lookups that fail transiently are retried
    /// within the same deadline.
    pub async fn await_completion(&self, handle: &TaskHandle, timeout: Duration) -> TaskOutcome {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }

            match self.client.task_status(handle).await {
                Ok(TaskStatus::Succeeded) => {
                    debug!(task = %handle.id, polls = attempt + 1, "Task succeeded");
                    return TaskOutcome::Success;
                }
                Ok(TaskStatus::Failed(reason)) => {
                    debug!(task = %handle.id, %reason, "Task failed");
                    return TaskOutcome::Failure(reason);
                }
                Ok(TaskStatus::Running) => {}
                Err(e) if e.is_transient() => {
                    warn!(task = %handle.id, error = %e, "Task status lookup failed, polling again");
                }
                Err(e) => return TaskOutcome::Failure(e.to_string()),
            }

            let now = Instant::now();
            if now >= deadline {
                return TaskOutcome::TimedOut;
            }
            let delay = self.policy.delay_for_attempt(attempt).min(deadline - now);
            attempt += 1;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
            }
        }
    }

    /// Await a task with the deadline configured for its operation
    pub async fn await_task(&self, handle: &TaskHandle) -> (TaskOutcome, Duration) {
        let timeout = self.policy.timeout_for(handle.operation);
        (self.await_completion(handle, timeout).await, timeout)
    }
}
