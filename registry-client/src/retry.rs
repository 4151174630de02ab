use std::future::Future;
use std::time::Duration;

use content::Error;
use serde::Deserialize;

use crate::config::seconds;

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Backoff {
    /// The initial delay, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub delay: Duration,

    /// The factor to increase the delay by after each attempt.
    pub exponent: u32,

    /// The longest delay between two attempts, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            exponent: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, exponent: u32, max_delay: Duration) -> Self {
        Self {
            delay,
            exponent,
            max_delay,
        }
    }

    /// A policy which retries immediately.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1, Duration::ZERO)
    }

    /// The delay before retry number `attempt` (counting from zero).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.exponent
            .checked_pow(attempt)
            .and_then(|factor| self.delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `operation` until it succeeds, fails with an error which is not
    /// retryable, or has been retried `retries` times.
    pub(crate) async fn retry<T, F, Fut>(
        &self,
        retries: u32,
        what: &str,
        mut operation: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(%error, attempt, ?delay, "{what} failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
