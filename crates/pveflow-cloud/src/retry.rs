//! Retry of transient client failures

use crate::error::ClientResult;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry configuration for client calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op`, retrying while it fails with [`crate::ClientError::Transient`].
///
/// Permanent errors are returned immediately. Cancellation during a backoff
/// returns the last transient error.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(8), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_transient(
            &RetryConfig::default(),
            "read",
            &CancellationToken::new(),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::Transient("503".to_string()))
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: ClientResult<()> = retry_transient(
            &RetryConfig::default(),
            "read",
            &CancellationToken::new(),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Transient("timeout".to_string()))
            },
        )
        .await;

        assert!(matches!(result, Err(ClientError::Transient(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: ClientResult<()> = retry_transient(
            &RetryConfig::default(),
            "create",
            &CancellationToken::new(),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Rejected("bad param".to_string()))
            },
        )
        .await;

        assert!(!result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
