//! Pool options.

use std::time::Duration;

use crate::error::ConfigError;

/// The enumerated option set every pool is constructed with.
///
/// Options are immutable once the pool exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of handles alive at once (outstanding + idle + being created).
    pub capacity: usize,

    /// Maximum time `acquire` may suspend waiting for capacity.
    pub acquire_timeout: Duration,

    /// Maximum time `close` waits for outstanding handles before force-closing them.
    pub drain_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: 10,
            acquire_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolOptions {
    /// Options with the given capacity and default timeouts.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Set the acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Reject option sets no pool can honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("pool capacity cannot be zero".to_string()));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "acquire timeout cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}
