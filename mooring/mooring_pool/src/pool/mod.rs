//! Bounded pools of reusable backend handles.
//!
//! - `resource`: the single-level pool used for database and cache clients
//! - `retry`: bounded exponential backoff for factory calls

pub mod resource;
pub mod retry;

pub use resource::ResourcePool;
pub use retry::RetryPolicy;
