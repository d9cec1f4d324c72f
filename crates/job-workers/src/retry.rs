//! In-process retries for a single processor call
//!
//! Queue-level retries (attempts, backoff) are handled by the worker; this
//! policy smooths over short blips inside one attempt, such as a dropped
//! connection to the webhook endpoint.

use std::time::Duration;

use crate::error::WorkerError;
use crate::metrics;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of tries, including the first
    pub max_attempts: u32,
    /// Base delay between tries (doubles each time)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// 2 tries, 500ms apart
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the given try (1-indexed): `base_delay * 2^(attempt-1)`,
    /// capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        std::cmp::min(delay, self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Execute an async operation with retry logic
///
/// Non-retryable errors are returned immediately; retryable ones are retried
/// until the policy is exhausted, returning the last error.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    queue: &str,
    mut operation: F,
) -> Result<T, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, WorkerError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);

                tracing::warn!(
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    queue = queue,
                    "Retrying after error"
                );

                metrics::record_retry(queue, attempt);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::debug!(
                        attempt = attempt,
                        error = %e,
                        queue = queue,
                        "In-process retries exhausted"
                    );
                } else {
                    tracing::debug!(
                        error = %e,
                        queue = queue,
                        "Error is not retryable, failing immediately"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40))
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(4));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let count = calls.clone();

        let result = execute_with_retry(&fast_policy(), "email", || {
            let count = count.clone();
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WorkerError::delivery("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let count = calls.clone();

        let result: Result<i32, WorkerError> = execute_with_retry(&fast_policy(), "email", || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::rejected("400 Bad Request"))
            }
        })
        .await;

        assert!(matches!(result, Err(WorkerError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let count = calls.clone();

        let result: Result<i32, WorkerError> = execute_with_retry(&fast_policy(), "email", || {
            let count = count.clone();
            async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::delivery(format!("try {}", n + 1)))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "Delivery failed: try 3");
    }
}
