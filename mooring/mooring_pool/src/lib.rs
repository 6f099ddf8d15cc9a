//! # Mooring Pool
//!
//! Bounded pools for the three backends a service talks to.
//!
//! - [`ResourcePool`] lends out handles produced by a
//!   [`Manager`](mooring_core::Manager): database connections, cache
//!   clients, anything that is used by one task at a time.
//! - [`ChannelPool`] lends out broker channels, opening at most
//!   `max_connections` physical connections with at most
//!   `channels_per_connection` channels each.
//!
//! Both implement [`ConnectionPool`](mooring_core::ConnectionPool): acquire
//! waits a bounded time for capacity, leases end exactly once, and closing
//! waits a bounded time for outstanding handles before revoking them.

pub mod channel;
pub mod pool;

pub use channel::{ChannelPool, ChannelPoolOptions};
pub use pool::{ResourcePool, RetryPolicy};
