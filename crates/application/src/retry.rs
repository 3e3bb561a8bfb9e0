use std::future::Future;
use std::time::Duration;

use fleetgate_core::AppResult;
use tracing::debug;

/// Bounded retry settings for optimistic write conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Re-runs a load-compute-write cycle while it fails with a retryable conflict.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_number = 1;

    loop {
        match attempt().await {
            Err(error) if error.is_retryable() && attempt_number < max_attempts => {
                debug!(
                    operation,
                    attempt = attempt_number,
                    error = %error,
                    "retrying after concurrency conflict"
                );
                attempt_number += 1;
                tokio::time::sleep(policy.backoff).await;
            }
            result => return result,
        }
    }
}
