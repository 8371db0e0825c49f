//! Exponential-backoff retry wrapper
//!
//! Wraps a single upstream attempt. Retryable failures (5xx, 429, timeouts,
//! connection errors) sleep `initial_delay * 2^(attempt-1)` before the next
//! call; terminal failures and the final attempt re-raise the original
//! error.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::{UpstreamError, UpstreamResult};

/// Default attempt budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first-retry delay
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Retry an operation with explicit attempt budget and initial delay
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    initial_delay: Duration,
    context: &str,
    mut op: F,
) -> UpstreamResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UpstreamResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(initial_delay, attempt);
                warn!(
                    context,
                    attempt,
                    max_attempts,
                    next_delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying upstream call"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retry with the default budget (3 attempts, 1s initial delay)
pub async fn retry<T, F, Fut>(context: &str, op: F) -> UpstreamResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UpstreamResult<T>>,
{
    retry_with_backoff(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_DELAY, context, op).await
}

/// Delay before the attempt following `attempt` (1-based)
pub fn backoff_delay(initial_delay: Duration, attempt: u32) -> Duration {
    initial_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
}
