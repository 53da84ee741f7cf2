//! Retry budget and backoff for registry requests.

use std::future::Future;
use std::time::Duration;

use dockyard_core::config::RetryConfig;

/// Exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// The delay before the next attempt
    pub delay: Duration,

    /// The factor the delay grows by after each attempt
    pub exponent: u32,

    /// The ceiling for a single delay
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(delay: Duration, exponent: u32, max_delay: Duration) -> Self {
        Self {
            delay: delay.min(max_delay),
            exponent,
            max_delay,
        }
    }

    /// The backoff for the following attempt, saturating at `max_delay`.
    pub fn increment(&self) -> Self {
        let delay = self
            .delay
            .checked_mul(self.exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        Self {
            delay,
            exponent: self.exponent,
            max_delay: self.max_delay,
        }
    }
}

/// Bounded retry for transient registry failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound for a single request
    pub request_timeout: Duration,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `fut`, giving up after the request timeout.
    pub async fn timed<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::time::timeout(self.request_timeout, fut).await.ok()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(config.initial_delay_ms),
                config.multiplier.max(1),
                Duration::from_millis(config.max_delay_ms),
            ),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
