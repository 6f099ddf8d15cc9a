//! Bounded pool of reusable backend handles.
//!
//! Capacity accounting covers three populations: idle handles, handles
//! leased to callers, and factory calls in flight. Their sum never exceeds
//! the configured capacity. All three live under one mutex together with
//! the `closed` flag, so a handle can never be counted twice or slip past a
//! shutdown.
//!
//! Waiting is done on a [`Notify`]: a task that finds the pool full registers
//! interest before it re-checks the state, so a release that lands between
//! the check and the wait is never lost. Dropping a waiting `acquire` future
//! hands any notification it already received to the next waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use mooring_core::error::{ConfigError, PoolError};
use mooring_core::id::LeaseId;
use mooring_core::lease::{Lease, LeaseTicket, Recycle};
use mooring_core::traits::{ConnectionPool, Manager};
use mooring_core::types::{DrainOutcome, PoolOptions, PoolStats};

use super::retry::RetryPolicy;

/// A bounded pool of handles produced by a [`Manager`].
///
/// Cloning is cheap; all clones share the same pool.
pub struct ResourcePool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<M: Manager> {
    name: String,
    options: PoolOptions,
    retry: RetryPolicy,
    manager: M,
    state: Mutex<PoolState<M::Resource>>,
    /// Capacity was freed or the pool closed.
    available: Notify,
    /// The last outstanding handle came back after closing began.
    drained: Notify,
}

struct PoolState<R> {
    idle: VecDeque<R>,
    outstanding: HashMap<LeaseId, Arc<LeaseTicket>>,
    pending: usize,
    waiters: usize,
    closed: bool,
    close_started: bool,
    created: u64,
    reused: u64,
    discarded: u64,
    revoked: u64,
}

impl<R> PoolState<R> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: VecDeque::with_capacity(capacity),
            outstanding: HashMap::with_capacity(capacity),
            pending: 0,
            waiters: 0,
            closed: false,
            close_started: false,
            created: 0,
            reused: 0,
            discarded: 0,
            revoked: 0,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.outstanding.len() + self.pending
    }

    fn is_drained(&self) -> bool {
        self.outstanding.is_empty() && self.pending == 0
    }
}

/// What a single look at the pool state yielded.
enum Take<R> {
    Idle(R, Arc<LeaseTicket>),
    Create,
    Full,
}

impl<M: Manager> ResourcePool<M> {
    /// Create a pool that retries factory failures with the default policy.
    pub fn new(
        name: impl Into<String>,
        manager: M,
        options: PoolOptions,
    ) -> Result<Self, ConfigError> {
        Self::with_retry(name, manager, options, RetryPolicy::default())
    }

    /// Create a pool with an explicit retry policy for the factory.
    pub fn with_retry(
        name: impl Into<String>,
        manager: M,
        options: PoolOptions,
        retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self::from_parts(name.into(), manager, options, retry))
    }

    pub(crate) fn from_parts(
        name: String,
        manager: M,
        options: PoolOptions,
        retry: RetryPolicy,
    ) -> Self {
        debug!(pool = %name, capacity = options.capacity, "creating resource pool");
        Self {
            inner: Arc::new(PoolInner {
                name,
                options,
                retry,
                manager,
                state: Mutex::new(PoolState::new(options.capacity)),
                available: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// The manager backing this pool.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Whether the pool has stopped admitting acquisitions.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Acquire without waiting for capacity.
    ///
    /// Returns `Ok(None)` when every slot is taken. A free slot with no idle
    /// handle still goes through the factory.
    pub async fn try_acquire(&self) -> Result<Option<Lease<M::Resource>>, PoolError> {
        match self.inner.take()? {
            Take::Idle(resource, ticket) => Ok(Some(self.inner.lend(resource, ticket))),
            Take::Create => self.create_reserved().await.map(Some),
            Take::Full => Ok(None),
        }
    }

    /// Pre-create up to `count` idle handles.
    ///
    /// Used at startup to prove the backend is reachable. Returns how many
    /// handles were created.
    pub async fn warm_up(&self, count: usize) -> Result<usize, PoolError> {
        let mut created = 0;
        for _ in 0..count.min(self.inner.options.capacity) {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed(self.inner.name.clone()));
                }
                if state.total() >= self.inner.options.capacity {
                    break;
                }
                state.pending += 1;
            }
            let slot = PendingSlot::new(&self.inner);
            let resource = self.inner.create_with_retry().await?;
            let rejected = slot.settle(|state| {
                state.created += 1;
                if state.closed {
                    Ok(Some(resource))
                } else {
                    state.idle.push_back(resource);
                    Ok(None)
                }
            })?;
            if let Some(resource) = rejected {
                self.inner.manager.close(resource);
                return Err(PoolError::Closed(self.inner.name.clone()));
            }
            created += 1;
        }
        if created > 0 {
            self.inner.available.notify_one();
        }
        debug!(pool = %self.inner.name, created, "warmed up");
        Ok(created)
    }

    /// Revoke every outstanding lease immediately.
    ///
    /// Closes the pool first. Returned identifiers are the leases that were
    /// revoked; their resources are closed when the holders let go of them.
    pub fn revoke_outstanding(&self) -> Vec<LeaseId> {
        self.begin_drain_inner();
        let leaked: Vec<LeaseId> = {
            let mut state = self.inner.state.lock();
            let leaked: Vec<LeaseId> = state
                .outstanding
                .drain()
                .map(|(id, ticket)| {
                    ticket.revoke();
                    id
                })
                .collect();
            state.revoked += leaked.len() as u64;
            leaked
        };
        self.inner.drained.notify_waiters();
        leaked
    }

    async fn create_reserved(&self) -> Result<Lease<M::Resource>, PoolError> {
        let slot = PendingSlot::new(&self.inner);
        let resource = self.inner.create_with_retry().await?;
        let admitted = slot.settle(|state| {
            state.created += 1;
            if state.closed {
                return Err(PoolError::Closed(self.inner.name.clone()));
            }
            let ticket = LeaseTicket::issue();
            state.outstanding.insert(ticket.id(), Arc::clone(&ticket));
            Ok(ticket)
        });
        match admitted {
            Ok(ticket) => {
                trace!(pool = %self.inner.name, lease = %ticket.id().short(), "created new handle");
                Ok(self.inner.lend(resource, ticket))
            }
            Err(err) => {
                self.inner.manager.close(resource);
                Err(err)
            }
        }
    }

    fn begin_drain_inner(&self) {
        let (idle, drained) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<M::Resource> = state.idle.drain(..).collect();
            (idle, state.is_drained())
        };
        info!(pool = %self.inner.name, idle = idle.len(), "pool draining");
        for resource in idle {
            self.inner.manager.close(resource);
        }
        self.inner.available.notify_waiters();
        if drained {
            self.inner.drained.notify_waiters();
        }
    }
}

impl<M: Manager> PoolInner<M> {
    fn take(&self) -> Result<Take<M::Resource>, PoolError> {
        let mut stale = Vec::new();
        let taken = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed(self.name.clone()));
            }
            loop {
                match state.idle.pop_front() {
                    Some(resource) if self.manager.is_healthy(&resource) => {
                        state.reused += 1;
                        let ticket = LeaseTicket::issue();
                        state.outstanding.insert(ticket.id(), Arc::clone(&ticket));
                        break Take::Idle(resource, ticket);
                    }
                    Some(resource) => {
                        state.discarded += 1;
                        stale.push(resource);
                    }
                    None if state.total() < self.options.capacity => {
                        state.pending += 1;
                        break Take::Create;
                    }
                    None => break Take::Full,
                }
            }
        };
        if !stale.is_empty() {
            debug!(pool = %self.name, count = stale.len(), "dropping unhealthy idle handles");
            for resource in stale {
                self.manager.close(resource);
            }
        }
        Ok(taken)
    }

    /// Wrap a resource already recorded as outstanding in a lease.
    fn lend(self: &Arc<Self>, resource: M::Resource, ticket: Arc<LeaseTicket>) -> Lease<M::Resource> {
        let home: Arc<dyn Recycle<M::Resource>> = self.clone();
        Lease::new(resource, ticket, home)
    }

    fn exhausted(&self, waited: Duration) -> PoolError {
        PoolError::Exhausted {
            pool: self.name.clone(),
            capacity: self.options.capacity,
            waited,
        }
    }

    async fn create_with_retry(&self) -> Result<M::Resource, PoolError> {
        self.retry
            .run(&self.name, || self.manager.create())
            .await
            .map_err(|(attempts, err)| PoolError::Unavailable {
                pool: self.name.clone(),
                attempts,
                reason: err.to_string(),
            })
    }
}

impl<M: Manager> Recycle<M::Resource> for PoolInner<M> {
    fn recycle(&self, id: LeaseId, resource: M::Resource, healthy: bool) {
        let (to_close, drained) = {
            let mut state = self.state.lock();
            let known = state.outstanding.remove(&id).is_some();
            let to_close = if !known || state.closed {
                Some(resource)
            } else if !healthy || !self.manager.is_healthy(&resource) {
                state.discarded += 1;
                Some(resource)
            } else {
                state.idle.push_back(resource);
                None
            };
            (to_close, state.closed && state.is_drained())
        };
        if let Some(resource) = to_close {
            trace!(pool = %self.name, lease = %id.short(), "closing returned handle");
            self.manager.close(resource);
        }
        self.available.notify_one();
        if drained {
            self.drained.notify_waiters();
        }
    }
}

/// Capacity reserved for an in-flight factory call.
///
/// Dropping the slot without settling it (factory error, cancelled future)
/// gives the capacity back and wakes a waiter.
struct PendingSlot<'a, M: Manager> {
    inner: &'a Arc<PoolInner<M>>,
    armed: bool,
}

impl<'a, M: Manager> PendingSlot<'a, M> {
    fn new(inner: &'a Arc<PoolInner<M>>) -> Self {
        Self { inner, armed: true }
    }

    /// Convert the reservation while holding the state lock.
    fn settle<T>(
        mut self,
        f: impl FnOnce(&mut PoolState<M::Resource>) -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        self.armed = false;
        let (result, drained) = {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
            let result = f(&mut state);
            (result, state.closed && state.is_drained())
        };
        if drained {
            self.inner.drained.notify_waiters();
        }
        result
    }
}

impl<M: Manager> Drop for PendingSlot<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let drained = {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
            state.closed && state.is_drained()
        };
        self.inner.available.notify_one();
        if drained {
            self.inner.drained.notify_waiters();
        }
    }
}

/// Keeps the waiter count honest across cancellation.
struct WaiterGuard<'a, R> {
    state: &'a Mutex<PoolState<R>>,
}

impl<'a, R> WaiterGuard<'a, R> {
    fn new(state: &'a Mutex<PoolState<R>>) -> Self {
        state.lock().waiters += 1;
        Self { state }
    }
}

impl<R> Drop for WaiterGuard<'_, R> {
    fn drop(&mut self) {
        self.state.lock().waiters -= 1;
    }
}

#[async_trait]
impl<M: Manager> ConnectionPool for ResourcePool<M> {
    type Resource = M::Resource;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn options(&self) -> PoolOptions {
        self.inner.options
    }

    async fn acquire(&self) -> Result<Lease<M::Resource>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.inner.options.acquire_timeout;
        let mut waiter: Option<WaiterGuard<'_, M::Resource>> = None;

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.take()? {
                Take::Idle(resource, ticket) => return Ok(self.inner.lend(resource, ticket)),
                Take::Create => {
                    drop(waiter.take());
                    // Dropping the create on expiry releases its pending slot.
                    return match timeout_at(deadline, self.create_reserved()).await {
                        Ok(result) => result,
                        Err(_) => {
                            let waited = started.elapsed();
                            debug!(
                                pool = %self.inner.name,
                                waited_ms = waited.as_millis() as u64,
                                "factory call outlived the acquire timeout"
                            );
                            Err(self.inner.exhausted(waited))
                        }
                    };
                }
                Take::Full => {}
            }

            if waiter.is_none() {
                trace!(pool = %self.inner.name, "pool full, waiting");
                waiter = Some(WaiterGuard::new(&self.inner.state));
            }
            if timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed();
                debug!(
                    pool = %self.inner.name,
                    waited_ms = waited.as_millis() as u64,
                    "acquire timed out"
                );
                return Err(self.inner.exhausted(waited));
            }
        }
    }

    fn begin_drain(&self) {
        self.begin_drain_inner();
    }

    async fn close_within(&self, timeout: Duration) -> DrainOutcome {
        let outstanding_at_start = {
            let mut state = self.inner.state.lock();
            if state.close_started {
                drop(state);
                warn!(pool = %self.inner.name, "close called on a pool that is already closed");
                return DrainOutcome::already_closed(&self.inner.name);
            }
            state.close_started = true;
            state.outstanding.len()
        };
        self.begin_drain_inner();

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let done = self.inner.state.lock().is_drained();
            if done {
                break;
            }
            if timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        let leaked = self.revoke_outstanding();
        let elapsed = started.elapsed();
        if leaked.is_empty() {
            info!(
                pool = %self.inner.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "pool closed"
            );
        } else {
            warn!(
                pool = %self.inner.name,
                forced = leaked.len(),
                timeout_ms = timeout.as_millis() as u64,
                "drain timeout elapsed, force-closing leaked handles"
            );
            for id in &leaked {
                debug!(pool = %self.inner.name, lease = %id, "revoked");
            }
        }

        DrainOutcome {
            pool: self.inner.name.clone(),
            outstanding_at_start,
            forced: leaked.len(),
            leaked,
            elapsed,
            already_closed: false,
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.options.capacity,
            idle: state.idle.len(),
            outstanding: state.outstanding.len(),
            pending: state.pending,
            waiters: state.waiters,
            created: state.created,
            reused: state.reused,
            discarded: state.discarded,
            revoked: state.revoked,
            closed: state.closed,
        }
    }
}

impl<M: Manager> std::fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}
