//! Core traits that define the mooring interfaces.
//!
//! - `ConnectionPool`: what every pool exposes to handlers and to the registry
//! - `Manager`: how a pool creates, checks and closes one kind of resource
//! - `BrokerManager`: the two-level variant for broker connections and channels

pub mod manager;
pub mod pool;

pub use manager::{BrokerManager, Manager};
pub use pool::{ConnectionPool, SharedPool};
