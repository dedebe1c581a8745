//! Bounded retry with exponential backoff and jitter
//!
//! The driver's writes use optimistic concurrency: every update carries the
//! last-read resourceVersion and the API server answers a conflict when
//! someone else wrote first. Conflicts are retried from a fresh read, a
//! bounded number of times, with jittered backoff so parallel drivers do
//! not stampede. Nothing else is retried here; errors that do not satisfy
//! the caller's predicate surface immediately.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{Error, Result};

/// Configuration for retrying an operation that can fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            // The fixed bound for resourceVersion conflicts.
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation`, retrying while `retryable` approves the error.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `max_attempts` is exhausted.
pub async fn retry_if<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < attempts && retryable(&e) => {
                // 0.5x..1.5x jitter
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt")
}
