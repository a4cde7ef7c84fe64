//! Bounded retry with exponential backoff for collaborator calls.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::config::SyncConfiguration;
use crate::errors::{Error, Result};

/// Attempt budget and timing for one collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on each single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfiguration) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            timeout: config.request_timeout(),
        }
    }
}

/// Exponential backoff `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    const MAX_EXPONENT: u32 = 16;
    let factor = 2_u32.saturating_pow(attempt.min(MAX_EXPONENT));
    base.saturating_mul(factor).min(max)
}

/// Backoff with equal jitter: half the delay is fixed, half is random.
pub fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = backoff_delay(attempt, base, max);
    let half_ms = (delay.as_millis() / 2) as u64;
    if half_ms == 0 {
        return delay;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=half_ms);
    Duration::from_millis(half_ms + jitter_ms)
}

/// Outcome of a retried call together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Runs `call` until it succeeds, fails permanently, or the budget is spent.
/// An attempt that exceeds the timeout counts as a connection failure.
pub async fn retry_transient<T, F, Fut>(policy: RetryPolicy, label: &str, mut call: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(Error::connection(format!(
                "{} timed out after {}ms",
                label,
                policy.timeout.as_millis()
            ))),
        };
        match result {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(err) if err.is_retryable() && attempts < policy.max_attempts => {
                let delay = backoff_with_jitter(attempts - 1, policy.base_delay, policy.max_delay);
                debug!(
                    "[EventSync] {} failed (attempt {}/{}), retrying in {}ms: {}",
                    label,
                    attempts,
                    policy.max_attempts,
                    delay.as_millis(),
                    err
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(
                        "[EventSync] {} failed after {} attempts: {}",
                        label, attempts, err
                    );
                }
                return Attempted {
                    result: Err(err),
                    attempts,
                };
            }
        }
    }
}
