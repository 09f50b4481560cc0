//! Bounded retries and timeouts for async operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ShellCacheError;

/// How often, and how patiently, to repeat a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total tries including the first; 0 behaves like 1.
    pub max_attempts: u32,
    /// Pause before the second try.
    pub initial_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
    /// Growth factor between consecutive pauses.
    pub backoff_multiplier: f64,
    /// Stretch each pause by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single try.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause taken before try number `attempt` (1-based). The first try
    /// never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retries) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };
        let grown = self.initial_delay.mul_f64(self.backoff_multiplier.powi(retries as i32));
        let capped = grown.min(self.max_delay);

        if self.jitter {
            capped.mul_f64(1.0 + 0.25 * jitter_fraction())
        } else {
            capped
        }
    }
}

fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1e9
}

/// Run `operation` until it succeeds, the attempts run out, or
/// `should_retry` rejects the error. The last error is returned as is.
pub async fn retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = config.attempts();
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded on retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= attempts || !should_retry(&error) {
            return Err(error);
        }
        warn!(attempt, attempts, error = %error, "Attempt failed, retrying");

        attempt += 1;
        sleep(config.delay_for_attempt(attempt)).await;
    }
}

/// Await `operation`, giving up after `timeout`.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, ShellCacheError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| ShellCacheError::Timeout(timeout))
}
