//! Per-request access to pools by name.
//!
//! Handlers never hold a pool themselves. They ask the resolver for one by
//! backend name, and the resolver answers from its override table first and
//! the registry second. Overrides never touch the registry, so a test can
//! swap a backend for a fake without the code under test noticing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use mooring_core::error::PoolError;
use mooring_core::lease::{Lease, LeaseFuture};
use mooring_core::traits::SharedPool;

use crate::registry::{PoolRegistry, RegisteredPool};

/// Looks up pools by name, honouring test overrides.
pub struct DependencyResolver {
    registry: Arc<PoolRegistry>,
    overrides: RwLock<HashMap<String, RegisteredPool>>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// The registry behind this resolver.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    fn entry(&self, name: &str) -> Option<RegisteredPool> {
        if let Some(entry) = self.overrides.read().get(name) {
            return Some(entry.clone());
        }
        self.registry.entry(name)
    }

    /// Shared reference to the pool registered under `name`. No connection is
    /// allocated.
    ///
    /// An unknown name is a wiring mistake: it is logged as an error and
    /// reported as [`PoolError::NotRegistered`].
    pub fn resolve<R: Send + 'static>(&self, name: &str) -> Result<SharedPool<R>, PoolError> {
        match self.entry(name) {
            Some(entry) => entry.downcast::<R>(),
            None => {
                error!(pool = %name, known = ?self.registry.names(), "no pool registered under this name");
                Err(PoolError::NotRegistered(name.to_string()))
            }
        }
    }

    /// Acquire a lease from the pool named `name`.
    ///
    /// The lease goes back to its pool when dropped, whichever way the
    /// request ends.
    pub async fn lease<R: Send + 'static>(&self, name: &str) -> Result<Lease<R>, PoolError> {
        let pool = self.resolve::<R>(name)?;
        pool.acquire().await
    }

    /// Run `f` against a leased resource.
    ///
    /// The lease is released when `f` succeeds and discarded when it fails, so
    /// a handle that saw an error is never reused.
    pub async fn with_pool<R, T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        R: Send + 'static,
        E: From<PoolError>,
        F: for<'a> FnOnce(&'a mut R) -> LeaseFuture<'a, Result<T, E>>,
    {
        let mut lease = self.lease::<R>(name).await?;
        let result = f(lease.get_mut()?).await;
        match result {
            Ok(value) => {
                lease.release();
                Ok(value)
            }
            Err(e) => {
                debug!(pool = %name, lease_id = %lease.id(), "discarding lease after failure");
                lease.discard();
                Err(e)
            }
        }
    }

    /// Route `name` to `pool` until the override is removed. Returns the
    /// override this one replaced, if any.
    pub fn register_override<R: Send + 'static>(
        &self,
        name: &str,
        pool: SharedPool<R>,
    ) -> Option<RegisteredPool> {
        self.set_override(RegisteredPool::named(name, pool))
    }

    pub(crate) fn set_override(&self, entry: RegisteredPool) -> Option<RegisteredPool> {
        debug!(pool = %entry.name(), resource = entry.resource_type(), "override installed");
        self.overrides
            .write()
            .insert(entry.name().to_string(), entry)
    }

    /// Remove the override for `name`, if any.
    pub fn remove_override(&self, name: &str) -> Option<RegisteredPool> {
        let removed = self.overrides.write().remove(name);
        if removed.is_some() {
            debug!(pool = %name, "override removed");
        }
        removed
    }

    /// Remove every override.
    pub fn clear_overrides(&self) {
        let mut overrides = self.overrides.write();
        if !overrides.is_empty() {
            debug!(count = overrides.len(), "clearing overrides");
        }
        overrides.clear();
    }

    pub fn has_override(&self, name: &str) -> bool {
        self.overrides.read().contains_key(name)
    }
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut overrides: Vec<String> = self.overrides.read().keys().cloned().collect();
        overrides.sort();
        f.debug_struct("DependencyResolver")
            .field("registry", &self.registry)
            .field("overrides", &overrides)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::types::LifecycleState;

    use crate::harness::{fake_pool, FakeConnection};

    fn resolver_with(names: &[&str]) -> DependencyResolver {
        let registry = PoolRegistry::new();
        registry.advance(LifecycleState::Starting).unwrap();
        for name in names {
            let pool: SharedPool<FakeConnection> = Arc::new(fake_pool(name, 2));
            registry.register(RegisteredPool::new(pool)).unwrap();
        }
        registry.advance(LifecycleState::Ready).unwrap();
        DependencyResolver::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_resolve_does_not_allocate() {
        let resolver = resolver_with(&["database"]);
        let pool = resolver.resolve::<FakeConnection>("database").unwrap();
        assert_eq!(pool.stats().total(), 0);

        let lease = resolver.lease::<FakeConnection>("database").await.unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        drop(lease);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_unknown_name_is_not_registered() {
        let resolver = resolver_with(&["database"]);
        assert_eq!(
            resolver.resolve::<FakeConnection>("databse").err(),
            Some(PoolError::NotRegistered("databse".into()))
        );
    }

    #[tokio::test]
    async fn test_override_takes_priority() {
        let resolver = resolver_with(&["database"]);
        let fake = fake_pool("fake", 1);
        let shared: SharedPool<FakeConnection> = Arc::new(fake.clone());

        assert!(resolver.register_override("database", shared).is_none());
        let _lease = resolver.lease::<FakeConnection>("database").await.unwrap();
        assert_eq!(fake.manager().created(), 1);
        assert_eq!(
            resolver.registry().get::<FakeConnection>("database").unwrap().stats().total(),
            0
        );

        assert!(resolver.remove_override("database").is_some());
        assert!(!resolver.has_override("database"));
    }

    #[tokio::test]
    async fn test_with_pool_releases_or_discards() {
        let resolver = resolver_with(&["cache"]);
        let pool = resolver.resolve::<FakeConnection>("cache").unwrap();

        let serial = resolver
            .with_pool("cache", |conn: &mut FakeConnection| {
                Box::pin(async move { Ok::<_, PoolError>(conn.serial) })
            })
            .await
            .unwrap();
        assert_eq!(serial, 1);
        assert_eq!(pool.stats().idle, 1);

        let failed = resolver
            .with_pool("cache", |_conn: &mut FakeConnection| {
                Box::pin(async move { Err::<(), _>(PoolError::ConnectionLost) })
            })
            .await;
        assert_eq!(failed, Err(PoolError::ConnectionLost));
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }
}
