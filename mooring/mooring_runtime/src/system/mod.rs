//! Process-level lifecycle of the pool registry
//!
//! Configuration, ordered startup with rollback, and the two-phase drain on
//! stop.

pub mod bootstrap;
pub mod config;
pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use mooring_core::error::StartupError;

pub use bootstrap::{BuildFuture, LifecycleController};
pub use config::RuntimeConfig;
pub use shutdown::DrainReport;

use crate::registry::PoolRegistry;

/// Build every pool configured in `config` and return the ready registry.
pub async fn start(config: RuntimeConfig) -> Result<Arc<PoolRegistry>, StartupError> {
    LifecycleController::new(config).start().await
}

/// Drain and close every pool in `registry` within `timeout`.
pub async fn stop(registry: &PoolRegistry, timeout: Duration) -> DrainReport {
    shutdown::drain(registry, timeout).await
}
