use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::SinkError;

/// Bounded exponential backoff for transcript writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// The last error once a policy gives up.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub error: SinkError,
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() || attempt >= max_attempts => {
                    return Err(RetryExhausted { attempts: attempt, error });
                }
                Err(error) => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        what,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
