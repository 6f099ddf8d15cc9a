//! Test doubles for code that resolves pools by name.
//!
//! [`TestHarness`] installs substitute pools into a [`DependencyResolver`]
//! for the lifetime of a scope. [`FakeManager`] backs those substitutes with
//! a real [`ResourcePool`] over in-memory connections, so capacity limits,
//! exhaustion and leak detection behave exactly as in production.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use mooring_core::error::PoolError;
use mooring_core::traits::{Manager, SharedPool};
use mooring_core::types::PoolOptions;
use mooring_pool::{ResourcePool, RetryPolicy};

use crate::registry::RegisteredPool;
use crate::resolver::DependencyResolver;

/// An in-memory connection handed out by [`FakeManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeConnection {
    /// 1-based creation order
    pub serial: u64,

    /// Statements "executed" on this connection
    pub executed: Vec<String>,
}

impl FakeConnection {
    /// Record a statement.
    pub fn execute(&mut self, statement: impl Into<String>) {
        self.executed.push(statement.into());
    }
}

#[derive(Debug, Default)]
struct FakeState {
    created: AtomicU64,
    closed: AtomicU64,
    fail_next: AtomicU32,
    unhealthy: AtomicBool,
}

/// A manager producing [`FakeConnection`]s, with counters and failure
/// switches.
#[derive(Debug, Clone, Default)]
pub struct FakeManager {
    state: Arc<FakeState>,
}

impl FakeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections created so far.
    pub fn created(&self) -> u64 {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Connections created and not yet closed.
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.closed())
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Report every idle connection as unhealthy (or healthy again).
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.state.unhealthy.store(unhealthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Manager for FakeManager {
    type Resource = FakeConnection;

    async fn create(&self) -> Result<FakeConnection, PoolError> {
        let failing = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PoolError::Factory("fake backend refused the connection".into()));
        }
        let serial = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection {
            serial,
            executed: Vec::new(),
        })
    }

    fn is_healthy(&self, _resource: &FakeConnection) -> bool {
        !self.state.unhealthy.load(Ordering::SeqCst)
    }

    fn close(&self, _resource: FakeConnection) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A fake-backed pool with a short acquire timeout and no factory retries.
pub fn fake_pool(name: &str, capacity: usize) -> ResourcePool<FakeManager> {
    let options = PoolOptions::with_capacity(capacity.max(1))
        .acquire_timeout(Duration::from_millis(100))
        .drain_timeout(Duration::from_millis(100));
    ResourcePool::with_retry(name, FakeManager::new(), options, RetryPolicy::none())
        .unwrap_or_else(|e| unreachable!("fake pool options are valid: {e}"))
}

/// Scoped overrides on a resolver.
///
/// Every override registered through the harness is undone when it drops;
/// whatever an override replaced is put back, most recent first.
pub struct TestHarness {
    resolver: Arc<DependencyResolver>,
    replaced: Vec<(String, Option<RegisteredPool>)>,
}

impl TestHarness {
    pub fn new(resolver: Arc<DependencyResolver>) -> Self {
        Self {
            resolver,
            replaced: Vec::new(),
        }
    }

    /// The resolver the overrides are installed into.
    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    /// Route `name` to `pool` until the harness drops.
    pub fn register<R: Send + 'static>(&mut self, name: &str, pool: SharedPool<R>) -> &mut Self {
        let previous = self.resolver.register_override(name, pool);
        self.replaced.push((name.to_string(), previous));
        self
    }

    /// Route `name` to a fresh fake pool and return it for inspection.
    pub fn fake(&mut self, name: &str, capacity: usize) -> ResourcePool<FakeManager> {
        let pool = fake_pool(name, capacity);
        let shared: SharedPool<FakeConnection> = Arc::new(pool.clone());
        self.register(name, shared);
        pool
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        while let Some((name, previous)) = self.replaced.pop() {
            match previous {
                Some(entry) => {
                    self.resolver.set_override(entry);
                }
                None => {
                    self.resolver.remove_override(&name);
                }
            }
        }
        debug!("test harness restored overrides");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::traits::ConnectionPool;

    #[tokio::test]
    async fn test_fake_manager_counts() {
        let pool = fake_pool("database", 2);
        let mut lease = pool.acquire().await.unwrap();
        lease.get_mut().unwrap().execute("SELECT 1");
        assert_eq!(lease.get().unwrap().executed, vec!["SELECT 1"]);
        lease.discard();

        let manager = pool.manager();
        assert_eq!(manager.created(), 1);
        assert_eq!(manager.closed(), 1);
        assert_eq!(manager.live(), 0);
    }

    #[tokio::test]
    async fn test_fake_manager_failures() {
        let pool = fake_pool("database", 1);
        pool.manager().fail_next(1);
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::Unavailable { attempts: 1, .. })
        ));
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_switch_discards_idle() {
        let pool = fake_pool("cache", 1);
        pool.acquire().await.unwrap().release();
        pool.manager().set_unhealthy(true);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.get().unwrap().serial, 2);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.manager().closed(), 1);
    }
}
