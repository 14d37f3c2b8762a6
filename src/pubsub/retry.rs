//! Exponential backoff for connection establishment.
//!
//! Only errors that report themselves as retryable (connection failures)
//! are retried; everything else is returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetrySettings;
use crate::utils::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

impl From<&RetrySettings> for BackoffPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.initial_backoff_ms),
            max: Duration::from_millis(settings.max_backoff_ms),
            max_attempts: settings.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    what,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
