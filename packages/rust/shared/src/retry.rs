//! Bounded retry with exponential backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::provider::ProviderError;

/// Attempt ceiling and backoff schedule for one kind of external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call. Never less than 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never waits between attempts (tests, dry tooling).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the `failed_attempt`-th failure (1-based), doubling up to the cap.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }

    /// Wait before retrying after `error`, or `None` if the provider asked for
    /// a longer pause than `max_backoff` allows.
    pub fn delay_for(&self, error: &ProviderError, failed_attempt: u32) -> Option<Duration> {
        match error.retry_after() {
            Some(requested) if requested > self.max_backoff => None,
            Some(requested) => Some(requested),
            None => Some(self.backoff(failed_attempt)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// The last error seen once a call has been given up on.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    /// Number of calls actually made.
    pub attempts: u32,
    pub last_error: ProviderError,
}

/// Call `op` until it succeeds, fails permanently, or the attempt ceiling is hit.
///
/// `op` receives the 1-based attempt number. A provider-supplied `retry_after`
/// replaces the computed backoff for that attempt; one longer than
/// `max_backoff` ends the retries instead of stalling the run.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let Some(delay) = policy.delay_for(&e, attempt) else {
                    warn!(
                        operation,
                        attempt,
                        retry_after_ms = e.retry_after().map_or(0, |d| d.as_millis() as u64),
                        max_backoff_ms = policy.max_backoff.as_millis() as u64,
                        error = %e,
                        "provider asked to wait longer than the backoff cap, giving up"
                    );
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                };
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
        }
    }
}
