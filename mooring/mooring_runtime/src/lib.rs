//! # Mooring Runtime
//!
//! Wires the pools from `mooring_pool` into a running service.
//!
//! - [`LifecycleController`] builds one pool per configured backend in the
//!   order `database`, `cache`, `broker`, and tears them down in reverse.
//! - [`PoolRegistry`] holds the named pools and the lifecycle state.
//! - [`DependencyResolver`] is what request handlers talk to: it looks a pool
//!   up by name and lends out scoped leases.
//! - [`TestHarness`] swaps pools for fakes in tests without touching handler
//!   code.
//!
//! ```no_run
//! use std::time::Duration;
//! use mooring_runtime::{DependencyResolver, RuntimeConfig};
//! use mooring_runtime::backend::TcpConnection;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = RuntimeConfig::load(None).await?;
//! mooring_runtime::logging::init(&config.logging);
//!
//! let registry = mooring_runtime::start(config).await?;
//! let resolver = DependencyResolver::new(registry.clone());
//!
//! let db = resolver.lease::<TcpConnection>("database").await?;
//! drop(db);
//!
//! let report = mooring_runtime::stop(&registry, Duration::from_secs(30)).await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod harness;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod system;

pub use harness::{fake_pool, FakeConnection, FakeManager, TestHarness};
pub use registry::{PoolRegistry, RegisteredPool, Transition, TransitionObserver};
pub use resolver::DependencyResolver;
pub use system::config::{
    BrokerConfig, CacheConfig, DatabaseConfig, LoggingConfig, PoolConfig, RetryConfig,
    RuntimeConfig,
};
pub use system::{start, stop, BuildFuture, DrainReport, LifecycleController};
