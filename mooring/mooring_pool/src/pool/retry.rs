//! Bounded retry with exponential backoff for factory calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mooring_core::error::PoolError;

/// How often and how patiently a factory call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Growth factor applied after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// On failure returns the number of attempts made and the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, (u32, PoolError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= max => {
                    warn!(op = what, attempts = attempt, error = %err, "giving up");
                    return Err((attempt, err));
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        op = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
