//! Bounded retry with capped exponential backoff.
//!
//! Every remote call of the bootstrap flow goes through [`retry`]. Only
//! errors for which [`Error::is_retryable`] holds are retried; anything else
//! is returned on the spot. Running out of attempts yields
//! [`Error::RetriesExhausted`] wrapping the last failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::Validate;

use crate::errors::{Error, Result};

/// Retry configuration for remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    #[validate(range(min = 1, max = 1000, message = "max_attempts must be between 1 and 1000"))]
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Cap for exponential growth
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (1.0 gives a fixed delay)
    #[validate(range(min = 1.0, max = 10.0, message = "backoff_multiplier must be in [1, 10]"))]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with a fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, initial_backoff: delay, max_backoff: delay, backoff_multiplier: 1.0 }
    }

    /// Calculate the backoff duration for a given attempt number (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * multiplier;
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let backoff = policy.backoff_for_attempt(attempt);
            debug!(
                operation,
                attempt = attempt + 1,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
        }

        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                attempt += 1;
                metrics::counter!("vault_bootstrap_retries_total", "operation" => operation.to_string())
                    .increment(1);

                if attempt >= max_attempts {
                    warn!(operation, attempts = attempt, error = %err, "Retry budget exhausted");
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }

                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Transient failure"
                );
            }
            Err(err) => return Err(err),
        }
    }
}
