//! Retry and timeout utilities.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::OffkitError;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 = exponential).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::attempts(1)
    }

    /// Default backoff with the given attempt count. Zero is treated as one.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay to wait before the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Returns the last error once every attempt has failed.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(label, attempt, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(label, attempt, ?delay, error = %e, "Retrying after delay");
                sleep(delay).await;
            }
        }
    }
}

/// Await a future, failing with [`OffkitError::Timeout`] once `timeout` elapses.
pub async fn with_timeout<T, Fut>(timeout: Duration, future: Fut) -> Result<T, OffkitError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| OffkitError::Timeout(timeout))
}
