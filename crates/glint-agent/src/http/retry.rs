//! Shared deadline and retry policy for the HTTP adapters.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{Result, StageError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Wall-clock budget for a single attempt.
    pub deadline: Duration,
    pub max_attempts: u32,
    /// Exponential backoff starts here and doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(2),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_cap.min(self.backoff_base * factor)
    }
}

/// Run `make_call` under the policy: each attempt gets the per-call deadline,
/// and only transient failures (timeouts, unreachable backends) are retried.
pub async fn call_with_retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, make_call: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match tokio::time::timeout(policy.deadline, make_call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => StageError::Timeout,
        };
        if !error.is_transient() || attempt >= policy.max_attempts {
            return Err(error);
        }
        let backoff = policy.backoff(attempt);
        warn!(
            operation = op_name,
            attempt,
            error = %error,
            backoff_ms = backoff.as_millis() as u64,
            "transient backend failure, retrying"
        );
        tokio::time::sleep(backoff).await;
    }
}
