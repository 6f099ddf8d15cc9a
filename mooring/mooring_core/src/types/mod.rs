//! Data types shared by every pool implementation.

pub mod lifecycle;
pub mod options;
pub mod stats;

pub use lifecycle::LifecycleState;
pub use options::PoolOptions;
pub use stats::{DrainOutcome, PoolStats};
