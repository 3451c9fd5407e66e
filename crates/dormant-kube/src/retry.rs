//! Retry with exponential backoff and jitter
//!
//! Every object-store call made by the hibernation protocol goes through
//! [`retry_transient`]: errors that [`HibernateError::is_transient`] accepts are
//! retried with backoff, anything else is returned to the caller on the spot.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{HibernateError, Result};

/// Backoff settings for transient object-store failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Reject settings that would stop retries from backing off
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HibernateError::InvalidConfig(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(HibernateError::InvalidConfig(format!(
                "retry.backoffMultiplier must be a number of at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(HibernateError::InvalidConfig(format!(
                "retry.maxDelay ({:?}) is shorter than retry.initialDelay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        Ok(())
    }

    /// Delay after `delay`, grown by the multiplier and capped
    ///
    /// A growth that is not a valid duration falls back to the cap.
    fn next_delay(&self, delay: Duration) -> Duration {
        let grown =
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(grown).unwrap_or(self.max_delay)
    }
}

/// Execute an async operation, retrying the errors `should_retry` accepts.
///
/// Returns the first error `should_retry` rejects, or the last error once
/// `max_attempts` is exhausted. A `max_attempts` of zero still makes one attempt.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::rng().random_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Retry an object-store call on transient failures only
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(config, operation_name, HibernateError::is_transient, operation).await
}

/// Bounded polling interval: doubles from `initial` up to `max`
#[derive(Debug, Clone)]
pub(crate) struct PollBackoff {
    current: Duration,
    max: Duration,
}

impl PollBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Next interval to sleep for
    pub(crate) fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        self.current = (self.current * 2).min(self.max);
        interval
    }
}
