//! Error types for mooring.
//!
//! Errors are grouped by subsystem: pool operations, registry lifecycle,
//! startup and configuration. The root `Error` wraps each of them so the
//! surrounding service can handle everything uniformly at its edge.
//!
//! Anything that reaches a request handler is final. Transient backend blips
//! are retried inside the pool before they surface, so handlers map errors
//! straight to a response with [`PoolError::status_code`].

use std::time::Duration;

use thiserror::Error;

use crate::id::LeaseId;
use crate::types::LifecycleState;

/// Root error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool acquisition and release errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Registry state machine errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Process startup failed
    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors returned by pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Capacity stayed exhausted for the whole acquire timeout.
    #[error("pool '{pool}' exhausted: no handle freed within {waited:?} (capacity {capacity})")]
    Exhausted {
        /// Pool name
        pool: String,
        /// Configured capacity
        capacity: usize,
        /// How long the caller waited
        waited: Duration,
    },

    /// The pool stopped admitting acquisitions.
    #[error("pool '{0}' is closed")]
    Closed(String),

    /// The backend factory kept failing after bounded retries.
    #[error("backend for pool '{pool}' unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        /// Pool name
        pool: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last factory error
        reason: String,
    },

    /// Every broker connection candidate failed to yield a channel.
    #[error("broker unavailable for pool '{pool}' after {attempts} attempt(s): {reason}")]
    BrokerUnavailable {
        /// Pool name
        pool: String,
        /// Connections tried
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// A single factory call failed. Retried inside the pool.
    #[error("failed to create resource: {0}")]
    Factory(String),

    /// The lease was force-closed by its pool and may not be used.
    #[error("lease {0} was revoked by its pool")]
    Revoked(LeaseId),

    /// The broker connection that owned this channel is gone.
    #[error("broker connection backing this channel was closed")]
    ConnectionLost,

    /// No pool was registered under this name.
    #[error("no pool registered under '{0}'")]
    NotRegistered(String),

    /// A pool exists under this name but yields a different resource type.
    #[error("pool '{name}' does not yield resources of type {expected}")]
    TypeMismatch {
        /// Pool name
        name: String,
        /// Requested resource type
        expected: &'static str,
    },
}

impl PoolError {
    /// Whether the caller may reasonably retry the request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. }
                | Self::Unavailable { .. }
                | Self::BrokerUnavailable { .. }
                | Self::Factory(_)
        )
    }

    /// HTTP status class the surrounding service should answer with.
    ///
    /// Backpressure and backend outages are 503; everything else is a logic
    /// error in the caller and maps to 500.
    pub fn status_code(&self) -> u16 {
        if self.is_retryable() {
            503
        } else {
            500
        }
    }
}

/// Errors raised by the registry state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// A transition that would move the registry backwards or skip a state.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: LifecycleState,
        /// Requested state
        to: LifecycleState,
    },

    /// A pool name was registered twice.
    #[error("pool '{0}' is already registered")]
    DuplicatePool(String),

    /// Pools can only be registered while the registry is starting.
    #[error("cannot register pools while the registry is {0}")]
    RegistrationClosed(LifecycleState),
}

/// Fatal error returned when the registry cannot be brought to `ready`.
#[derive(Debug, Error)]
pub enum StartupError {
    /// A backend pool could not be constructed.
    #[error("failed to construct pool '{backend}': {source}")]
    Backend {
        /// Pool that failed
        backend: String,
        /// Underlying failure
        #[source]
        source: PoolError,
        /// Pools that had been constructed and were closed again, in close order
        rolled_back: Vec<String>,
    },

    /// The registry refused a transition or registration.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StartupError {
    /// Name of the pool whose construction failed, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::Backend { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// Pools that were closed during rollback, in the order they were closed.
    pub fn rolled_back(&self) -> &[String] {
        match self {
            Self::Backend { rolled_back, .. } => rolled_back,
            _ => &[],
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The configuration source could not be read.
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    /// The configuration source could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseFailed(String),

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
