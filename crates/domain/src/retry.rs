use std::future::Future;
use std::time::Duration;

use crate::DomainResult;
use crate::error::DomainError;
use crate::jobs::backoff_ms;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

/// Re-runs an optimistic transaction while it loses to a concurrent writer.
/// Every other error is returned from the first attempt that raises it.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt_once: F,
) -> DomainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DomainResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match attempt_once().await {
            Err(DomainError::TransactionConflict) if attempt < attempts => {
                let delay_ms = backoff_ms(policy.base_delay_ms, attempt, policy.max_delay_ms);
                tracing::debug!(operation, attempt, delay_ms, "transaction conflict, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(DomainError::TransactionConflict) => {
                tracing::warn!(operation, attempts, "transaction conflict retries exhausted");
                return Err(DomainError::TransactionConflict);
            }
            other => return other,
        }
    }
    Err(DomainError::TransactionConflict)
}
