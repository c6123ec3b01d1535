use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Bounded retry with exponential backoff and no jitter.
///
/// The wait after failed attempt `n` (0-indexed) is `base * 2^n`; there is no
/// wait after the final attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Runs `op` until it succeeds or the attempts are used up.
///
/// Only the `Err` side of `op` is retried. Callers that distinguish
/// application-level failures should carry them in `T` so they come back
/// on the first attempt. Returns the last error once retries are exhausted.
pub async fn with_backoff<T, E, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{op_name} attempt {}/{attempts} failed: {err}; retrying in {delay:?}",
                    attempt + 1
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!("{op_name} failed after {attempts} attempts: {err}");
                return Err(err);
            }
        }
    }
}
