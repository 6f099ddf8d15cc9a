//! Process-wide registry of named pools.
//!
//! The registry owns one type-erased entry per backend, in construction
//! order, plus the lifecycle state machine
//! `uninitialized → starting → ready → draining → closed`. Transitions only
//! move forward; every accepted transition is logged, recorded, and handed
//! to the registered observers.

use std::any::{type_name, Any};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use mooring_core::error::{LifecycleError, PoolError};
use mooring_core::traits::SharedPool;
use mooring_core::types::{DrainOutcome, LifecycleState, PoolStats};

/// Callback invoked after every accepted lifecycle transition.
pub type TransitionObserver = Arc<dyn Fn(&Transition) + Send + Sync>;

/// A recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
}

/// The resource-independent half of a pool.
#[async_trait]
trait PoolControl: Send + Sync {
    fn stats(&self) -> PoolStats;
    fn begin_drain(&self);
    async fn close(&self) -> DrainOutcome;
    async fn close_within(&self, timeout: Duration) -> DrainOutcome;
}

struct Control<R: Send + 'static>(SharedPool<R>);

#[async_trait]
impl<R: Send + 'static> PoolControl for Control<R> {
    fn stats(&self) -> PoolStats {
        self.0.stats()
    }

    fn begin_drain(&self) {
        self.0.begin_drain();
    }

    async fn close(&self) -> DrainOutcome {
        self.0.close().await
    }

    async fn close_within(&self, timeout: Duration) -> DrainOutcome {
        self.0.close_within(timeout).await
    }
}

/// A named, type-erased pool as stored by the registry and the resolver.
#[derive(Clone)]
pub struct RegisteredPool {
    name: String,
    resource_type: &'static str,
    control: Arc<dyn PoolControl>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl RegisteredPool {
    /// Wrap a pool under its own name.
    pub fn new<R: Send + 'static>(pool: SharedPool<R>) -> Self {
        let name = pool.name().to_string();
        Self::named(name, pool)
    }

    /// Wrap a pool under an explicit name.
    pub fn named<R: Send + 'static>(name: impl Into<String>, pool: SharedPool<R>) -> Self {
        Self {
            name: name.into(),
            resource_type: type_name::<R>(),
            control: Arc::new(Control(Arc::clone(&pool))),
            typed: Arc::new(pool),
        }
    }

    /// Registry key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the resource type the pool yields.
    pub fn resource_type(&self) -> &'static str {
        self.resource_type
    }

    /// Recover the typed pool.
    pub fn downcast<R: Send + 'static>(&self) -> Result<SharedPool<R>, PoolError> {
        self.typed
            .downcast_ref::<SharedPool<R>>()
            .cloned()
            .ok_or_else(|| PoolError::TypeMismatch {
                name: self.name.clone(),
                expected: type_name::<R>(),
            })
    }

    pub fn stats(&self) -> PoolStats {
        self.control.stats()
    }

    pub fn begin_drain(&self) {
        self.control.begin_drain();
    }

    /// Close within the pool's own drain timeout.
    pub async fn close(&self) -> DrainOutcome {
        self.control.close().await
    }

    pub async fn close_within(&self, timeout: Duration) -> DrainOutcome {
        self.control.close_within(timeout).await
    }
}

impl std::fmt::Debug for RegisteredPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPool")
            .field("name", &self.name)
            .field("resource_type", &self.resource_type)
            .finish()
    }
}

/// Ordered set of named pools plus their shared lifecycle state.
pub struct PoolRegistry {
    state: Mutex<LifecycleState>,
    pools: RwLock<Vec<RegisteredPool>>,
    history: Mutex<Vec<Transition>>,
    observers: Vec<TransitionObserver>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    /// An empty registry in the `uninitialized` state.
    pub fn new() -> Self {
        Self::with_observers(Vec::new())
    }

    /// An empty registry that reports transitions to `observers`.
    pub fn with_observers(observers: Vec<TransitionObserver>) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
            pools: RwLock::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            observers,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Move to `to`, rejecting backward or skipping transitions.
    pub fn advance(&self, to: LifecycleState) -> Result<Transition, LifecycleError> {
        let transition = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_advance_to(to) {
                return Err(LifecycleError::InvalidTransition { from, to });
            }
            *state = to;
            Transition {
                from,
                to,
                at: Utc::now(),
            }
        };

        info!(from = %transition.from, to = %transition.to, "registry transition");
        self.history.lock().push(transition.clone());
        for observer in &self.observers {
            observer(&transition);
        }
        Ok(transition)
    }

    /// Add a pool. Only allowed while starting; names are unique.
    pub fn register(&self, pool: RegisteredPool) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != LifecycleState::Starting {
            return Err(LifecycleError::RegistrationClosed(state));
        }
        let mut pools = self.pools.write();
        if pools.iter().any(|p| p.name() == pool.name()) {
            return Err(LifecycleError::DuplicatePool(pool.name().to_string()));
        }
        debug!(
            pool = %pool.name(),
            resource = pool.resource_type(),
            "registered pool"
        );
        pools.push(pool);
        Ok(())
    }

    /// Look up an entry by name.
    pub fn entry(&self, name: &str) -> Option<RegisteredPool> {
        self.pools.read().iter().find(|p| p.name() == name).cloned()
    }

    /// Look up a typed pool by name.
    pub fn get<R: Send + 'static>(&self, name: &str) -> Result<SharedPool<R>, PoolError> {
        self.entry(name)
            .ok_or_else(|| PoolError::NotRegistered(name.to_string()))?
            .downcast::<R>()
    }

    /// All entries in construction order.
    pub fn entries(&self) -> Vec<RegisteredPool> {
        self.pools.read().clone()
    }

    /// Pool names in construction order.
    pub fn names(&self) -> Vec<String> {
        self.pools
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Snapshot of every pool's counters, in construction order.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.entries()
            .into_iter()
            .map(|p| (p.name().to_string(), p.stats()))
            .collect()
    }

    /// Every accepted transition so far.
    pub fn history(&self) -> Vec<Transition> {
        self.history.lock().clone()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("state", &self.state())
            .field("pools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{fake_pool, FakeConnection};

    fn fake(name: &str) -> RegisteredPool {
        let pool: SharedPool<FakeConnection> = Arc::new(fake_pool(name, 1));
        RegisteredPool::new(pool)
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let registry = PoolRegistry::new();
        assert!(registry.advance(LifecycleState::Ready).is_err());
        registry.advance(LifecycleState::Starting).unwrap();
        registry.advance(LifecycleState::Ready).unwrap();
        assert_eq!(
            registry.advance(LifecycleState::Starting),
            Err(LifecycleError::InvalidTransition {
                from: LifecycleState::Ready,
                to: LifecycleState::Starting,
            })
        );
        registry.advance(LifecycleState::Draining).unwrap();
        registry.advance(LifecycleState::Closed).unwrap();
        assert!(registry.advance(LifecycleState::Starting).is_err());
        assert_eq!(registry.history().len(), 4);
    }

    #[test]
    fn test_observers_see_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = PoolRegistry::with_observers(vec![Arc::new(move |t: &Transition| {
            sink.lock().push(t.to)
        })]);
        registry.advance(LifecycleState::Starting).unwrap();
        registry.advance(LifecycleState::Draining).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![LifecycleState::Starting, LifecycleState::Draining]
        );
    }

    #[test]
    fn test_register_rules() {
        let registry = PoolRegistry::new();
        assert!(matches!(
            registry.register(fake("database")),
            Err(LifecycleError::RegistrationClosed(LifecycleState::Uninitialized))
        ));

        registry.advance(LifecycleState::Starting).unwrap();
        registry.register(fake("database")).unwrap();
        registry.register(fake("cache")).unwrap();
        assert_eq!(
            registry.register(fake("database")),
            Err(LifecycleError::DuplicatePool("database".into()))
        );
        assert_eq!(registry.names(), vec!["database", "cache"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_uses_the_pools_drain_timeout() {
        use mooring_core::traits::ConnectionPool;

        let pool = fake_pool("database", 1);
        let held = pool.acquire().await.unwrap();
        let entry = RegisteredPool::new(Arc::new(pool.clone()) as SharedPool<FakeConnection>);

        let outcome = entry.close().await;
        assert_eq!(outcome.forced, 1);
        assert!(outcome.elapsed >= pool.options().drain_timeout);
        assert!(outcome.elapsed < Duration::from_secs(1));
        assert!(!held.is_valid());
    }

    #[test]
    fn test_typed_lookup() {
        let registry = PoolRegistry::new();
        registry.advance(LifecycleState::Starting).unwrap();
        registry.register(fake("database")).unwrap();

        assert!(registry
            .get::<FakeConnection>("database")
            .is_ok());
        assert!(matches!(
            registry.get::<String>("database"),
            Err(PoolError::TypeMismatch { .. })
        ));
        assert_eq!(
            registry.get::<String>("broker").err(),
            Some(PoolError::NotRegistered("broker".into()))
        );
    }
}
