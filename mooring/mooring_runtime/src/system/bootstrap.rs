//! Registry bootstrap for the mooring runtime
//!
//! Builds every configured pool in dependency order (database, cache,
//! broker, then any custom pools in the order they were added) and hands
//! back a ready registry. If any pool fails to come up, the ones already
//! built are closed in reverse order and startup fails; the registry never
//! reaches `ready`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use mooring_core::error::{ConfigError, PoolError, StartupError};
use mooring_core::traits::{ConnectionPool, SharedPool};
use mooring_core::types::LifecycleState;
use mooring_pool::{ChannelPool, ResourcePool};

use super::config::{BrokerConfig, CacheConfig, DatabaseConfig, RuntimeConfig};
use super::shutdown::{self, DrainReport};
use crate::backend::{BrokerChannel, TcpBroker, TcpConnection, TcpManager};
use crate::registry::{PoolRegistry, RegisteredPool, Transition, TransitionObserver};

/// Future producing one registered pool.
pub type BuildFuture = Pin<Box<dyn Future<Output = Result<RegisteredPool, PoolError>> + Send>>;

type Builder = Box<dyn Fn() -> BuildFuture + Send + Sync>;

/// Starts and stops the pool registry.
pub struct LifecycleController {
    config: RuntimeConfig,
    builders: Vec<(String, Builder)>,
    observers: Vec<TransitionObserver>,
}

impl LifecycleController {
    /// A controller that builds the backends present in `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        let mut controller = Self::without_backends(config);

        if let Some(database) = controller.config.database.clone() {
            controller = controller.with_pool("database", move || build_database(database.clone()));
        }
        if let Some(cache) = controller.config.cache.clone() {
            controller = controller.with_pool("cache", move || build_cache(cache.clone()));
        }
        if let Some(broker) = controller.config.broker.clone() {
            controller = controller.with_pool("broker", move || build_broker(broker.clone()));
        }
        controller
    }

    /// A controller that builds only the pools added with [`with_pool`].
    ///
    /// [`with_pool`]: LifecycleController::with_pool
    pub fn without_backends(config: RuntimeConfig) -> Self {
        Self {
            config,
            builders: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Add a pool, built after every pool added before it.
    pub fn with_pool<R, F, Fut>(mut self, name: impl Into<String>, build: F) -> Self
    where
        R: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SharedPool<R>, PoolError>> + Send + 'static,
    {
        let name = name.into();
        let key = name.clone();
        let builder: Builder = Box::new(move || {
            let key = key.clone();
            let built = build();
            Box::pin(async move { built.await.map(|pool| RegisteredPool::named(key, pool)) })
        });
        self.builders.push((name, builder));
        self
    }

    /// Report every lifecycle transition to `observer`.
    pub fn on_transition<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Names of the pools `start` will build, in order.
    pub fn pool_names(&self) -> Vec<&str> {
        self.builders.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Build every pool and return the ready registry.
    pub async fn start(&self) -> Result<Arc<PoolRegistry>, StartupError> {
        self.config.validate()?;

        let registry = Arc::new(PoolRegistry::with_observers(self.observers.clone()));
        registry.advance(LifecycleState::Starting)?;
        info!(pools = ?self.pool_names(), "Starting pools");

        let mut built: Vec<RegisteredPool> = Vec::with_capacity(self.builders.len());
        for (name, build) in &self.builders {
            info!(pool = %name, "Constructing pool");
            let pool = match build().await {
                Ok(pool) => pool,
                Err(source) => {
                    error!(pool = %name, error = %source, "Pool construction failed");
                    let rolled_back = roll_back(&registry, built).await;
                    return Err(StartupError::Backend {
                        backend: name.clone(),
                        source,
                        rolled_back,
                    });
                }
            };

            if let Err(e) = registry.register(pool.clone()) {
                error!(pool = %name, error = %e, "Pool registration failed");
                built.push(pool);
                roll_back(&registry, built).await;
                return Err(e.into());
            }
            built.push(pool);
        }

        registry.advance(LifecycleState::Ready)?;
        info!(pools = built.len(), "All pools ready");
        Ok(registry)
    }

    /// Drain the registry within the configured shutdown timeout.
    pub async fn stop(&self, registry: &PoolRegistry) -> DrainReport {
        self.stop_within(registry, self.config.shutdown_timeout())
            .await
    }

    /// Drain the registry within `timeout`.
    pub async fn stop_within(&self, registry: &PoolRegistry, timeout: Duration) -> DrainReport {
        shutdown::drain(registry, timeout).await
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("pools", &self.pool_names())
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Close `built` newest first, each within its own drain timeout, and leave
/// the registry closed. Returns the names in the order they were closed.
async fn roll_back(registry: &PoolRegistry, built: Vec<RegisteredPool>) -> Vec<String> {
    let mut closed = Vec::with_capacity(built.len());
    for pool in built.into_iter().rev() {
        warn!(pool = %pool.name(), "Rolling back pool");
        let outcome = pool.close().await;
        if outcome.forced > 0 {
            warn!(pool = %pool.name(), forced = outcome.forced, "Rollback force-closed leases");
        }
        closed.push(pool.name().to_string());
    }
    for state in [LifecycleState::Draining, LifecycleState::Closed] {
        if let Err(e) = registry.advance(state) {
            warn!("Rollback could not advance registry: {}", e);
        }
    }
    closed
}

fn config_failure(e: ConfigError) -> PoolError {
    PoolError::Factory(e.to_string())
}

/// Prove a freshly built resource pool can reach its backend.
async fn warm<M>(pool: ResourcePool<M>, count: usize) -> Result<ResourcePool<M>, PoolError>
where
    M: mooring_core::traits::Manager,
{
    if count == 0 {
        return Ok(pool);
    }
    match pool.warm_up(count).await {
        Ok(_) => Ok(pool),
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

async fn build_database(config: DatabaseConfig) -> Result<SharedPool<TcpConnection>, PoolError> {
    info!(pool = "database", backend = %config, "Opening database pool");
    let manager = TcpManager::new(
        config.address(),
        Duration::from_millis(config.connect_timeout_ms),
    );
    let pool = ResourcePool::with_retry(
        "database",
        manager,
        config.pool.options(),
        config.retry.policy(),
    )
    .map_err(config_failure)?;
    Ok(Arc::new(warm(pool, config.warm_up).await?))
}

async fn build_cache(config: CacheConfig) -> Result<SharedPool<TcpConnection>, PoolError> {
    info!(pool = "cache", backend = %config, "Opening cache pool");
    let manager = TcpManager::new(
        config.address(),
        Duration::from_millis(config.connect_timeout_ms),
    );
    let pool = ResourcePool::with_retry(
        "cache",
        manager,
        config.pool.options(),
        config.retry.policy(),
    )
    .map_err(config_failure)?;
    Ok(Arc::new(warm(pool, config.warm_up).await?))
}

async fn build_broker(config: BrokerConfig) -> Result<SharedPool<BrokerChannel>, PoolError> {
    info!(pool = "broker", backend = %config, "Opening broker pool");
    let broker = TcpBroker::new(
        config.address(),
        Duration::from_millis(config.connect_timeout_ms),
        config.channel_max,
    );
    let pool = ChannelPool::new("broker", broker, config.options(), config.retry.policy())
        .map_err(config_failure)?;
    if config.warm_up > 0 {
        if let Err(e) = pool.warm_up(config.warm_up).await {
            pool.close().await;
            return Err(e);
        }
    }
    Ok(Arc::new(pool))
}
