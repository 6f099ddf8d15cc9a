//! Two-level pooling for message-broker channels.
//!
//! A small number of physical connections each multiplex a bounded number of
//! channels. Callers lease channels; connections are opened lazily and
//! retired as soon as one of them stops yielding channels.

mod manager;
pub mod pool;

pub use pool::{ChannelPool, ChannelPoolOptions};
