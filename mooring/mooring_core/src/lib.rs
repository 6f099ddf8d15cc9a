//! # Mooring Core
//!
//! `mooring_core` holds the vocabulary shared by every mooring crate: error
//! types, identifiers, the lease handle and the traits pools and backends
//! implement.
//!
//! ## Crate Structure
//!
//! - **error**: Error types for pools, lifecycle, startup and configuration
//! - **id**: Strongly-typed identifiers for leases and broker connections
//! - **lease**: The exclusive handle returned by `acquire`
//! - **traits**: `ConnectionPool`, `Manager` and `BrokerManager`
//! - **types**: Lifecycle states, pool options and statistics

pub mod error;
pub mod id;
pub mod lease;
pub mod traits;
pub mod types;

// Re-export key types and traits for convenience
pub use error::{ConfigError, Error, LifecycleError, PoolError, Result, StartupError};
pub use id::{ConnectionId, LeaseId};
pub use lease::{Lease, LeaseFuture, LeaseTicket, Recycle};
pub use traits::{BrokerManager, ConnectionPool, Manager, SharedPool};
pub use types::{DrainOutcome, LifecycleState, PoolOptions, PoolStats};
