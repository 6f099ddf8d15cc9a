//! The channel pool.
//!
//! Connections live in an arena of slots. Each slot carries a generation
//! number that is bumped whenever its connection is retired or closed. A
//! channel lease remembers the `(slot, generation)` it was issued from, so
//! invalidating every channel of a connection is a single counter bump and
//! needs no walk over live leases.
//!
//! Lock order: the arena lock is never held while a per-connection channel
//! pool is locked. Pools are cloned out of the arena first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use mooring_core::error::{ConfigError, PoolError};
use mooring_core::id::{ConnectionId, LeaseId};
use mooring_core::lease::{Lease, Recycle};
use mooring_core::traits::{BrokerManager, ConnectionPool};
use mooring_core::types::{DrainOutcome, PoolOptions, PoolStats};

use super::manager::ChannelManager;
use crate::pool::{ResourcePool, RetryPolicy};

/// Sizing for a [`ChannelPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPoolOptions {
    /// Physical connections allowed at once.
    pub max_connections: usize,

    /// Channels allowed per connection.
    pub channels_per_connection: usize,

    /// Maximum time `acquire` may wait for a free channel.
    pub acquire_timeout: Duration,

    /// Maximum time `close` waits for outstanding channels.
    pub drain_timeout: Duration,
}

impl Default for ChannelPoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 2,
            channels_per_connection: 10,
            acquire_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelPoolOptions {
    /// Total channels the pool can have out at once.
    pub fn capacity(&self) -> usize {
        self.max_connections
            .saturating_mul(self.channels_per_connection)
    }

    /// Options seen by callers through [`ConnectionPool::options`].
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            capacity: self.capacity(),
            acquire_timeout: self.acquire_timeout,
            drain_timeout: self.drain_timeout,
        }
    }

    fn per_connection(&self) -> PoolOptions {
        PoolOptions {
            capacity: self.channels_per_connection,
            acquire_timeout: self.acquire_timeout,
            drain_timeout: self.drain_timeout,
        }
    }

    /// Reject option sets no pool can honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "broker max_connections cannot be zero".to_string(),
            ));
        }
        if self.channels_per_connection == 0 {
            return Err(ConfigError::Invalid(
                "broker channels_per_connection cannot be zero".to_string(),
            ));
        }
        self.pool_options().validate()
    }
}

/// A pool of broker channels multiplexed over a bounded set of connections.
pub struct ChannelPool<B: BrokerManager> {
    shared: Arc<Shared<B>>,
}

impl<B: BrokerManager> Clone for ChannelPool<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<B: BrokerManager> {
    name: String,
    options: ChannelPoolOptions,
    retry: RetryPolicy,
    broker: Arc<B>,
    arena: Mutex<Arena<B>>,
    /// A channel came back, a connection slot freed up, or the pool closed.
    available: Notify,
}

struct Arena<B: BrokerManager> {
    slots: Vec<Slot<B>>,
    connecting: usize,
    waiters: usize,
    closed: bool,
    close_started: bool,
}

struct Slot<B: BrokerManager> {
    generation: u64,
    conn: Option<OpenConnection<B>>,
}

struct OpenConnection<B: BrokerManager> {
    id: ConnectionId,
    connection: Arc<B::Connection>,
    channels: ResourcePool<ChannelManager<B>>,
}

impl<B: BrokerManager> Clone for OpenConnection<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            connection: Arc::clone(&self.connection),
            channels: self.channels.clone(),
        }
    }
}

/// An open connection as seen by one acquire pass.
struct Candidate<B: BrokerManager> {
    index: usize,
    generation: u64,
    open: OpenConnection<B>,
}

impl<B: BrokerManager> Arena<B> {
    fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    fn candidates(&self) -> Vec<Candidate<B>> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.conn.as_ref().map(|open| Candidate {
                    index,
                    generation: slot.generation,
                    open: open.clone(),
                })
            })
            .collect()
    }

    fn is_current(&self, index: usize, generation: u64) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.generation == generation && slot.conn.is_some())
    }
}

impl<B: BrokerManager> ChannelPool<B> {
    /// Create a channel pool. No connection is opened until the first acquire.
    pub fn new(
        name: impl Into<String>,
        broker: B,
        options: ChannelPoolOptions,
        retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let name = name.into();
        debug!(
            pool = %name,
            max_connections = options.max_connections,
            channels_per_connection = options.channels_per_connection,
            "creating channel pool"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                options,
                retry,
                broker: Arc::new(broker),
                arena: Mutex::new(Arena {
                    slots: Vec::with_capacity(options.max_connections),
                    connecting: 0,
                    waiters: 0,
                    closed: false,
                    close_started: false,
                }),
                available: Notify::new(),
            }),
        })
    }

    /// The broker manager backing this pool.
    pub fn broker(&self) -> &B {
        &self.shared.broker
    }

    /// Number of physical connections currently open.
    pub fn connection_count(&self) -> usize {
        self.shared.arena.lock().open_count()
    }

    /// Open connections and channels until `count` channels could be leased,
    /// then return them all. Proves the broker is reachable.
    pub async fn warm_up(&self, count: usize) -> Result<usize, PoolError> {
        let mut held = Vec::new();
        for _ in 0..count.min(self.shared.options.capacity()) {
            held.push(self.acquire().await?);
        }
        let n = held.len();
        drop(held);
        debug!(pool = %self.shared.name, channels = n, "warmed up");
        Ok(n)
    }
}

impl<B: BrokerManager> Shared<B> {
    /// Whether the connection a channel was issued from is still in service.
    fn is_current(&self, index: usize, generation: u64) -> bool {
        let connection = {
            let arena = self.arena.lock();
            if !arena.is_current(index, generation) {
                return false;
            }
            arena.slots[index]
                .conn
                .as_ref()
                .map(|open| Arc::clone(&open.connection))
        };
        connection.is_some_and(|c| self.broker.connection_healthy(&c))
    }

    /// Reserve room for a new connection if the cap allows one.
    fn reserve_connection(self: &Arc<Self>) -> Result<Option<Connecting<B>>, PoolError> {
        let mut arena = self.arena.lock();
        if arena.closed {
            return Err(PoolError::Closed(self.name.clone()));
        }
        if arena.open_count() + arena.connecting >= self.options.max_connections {
            return Ok(None);
        }
        arena.connecting += 1;
        Ok(Some(Connecting {
            shared: Arc::clone(self),
        }))
    }

    async fn connect(self: &Arc<Self>, reservation: Connecting<B>) -> Result<Candidate<B>, PoolError> {
        let connection = self
            .retry
            .run(&self.name, || self.broker.connect())
            .await
            .map_err(|(attempts, err)| PoolError::BrokerUnavailable {
                pool: self.name.clone(),
                attempts,
                reason: err.to_string(),
            })?;
        let installed = self.install(Arc::new(connection));
        drop(reservation);
        installed
    }

    fn install(self: &Arc<Self>, connection: Arc<B::Connection>) -> Result<Candidate<B>, PoolError> {
        let mut arena = self.arena.lock();
        if arena.closed {
            drop(arena);
            self.broker.close_connection(&connection);
            return Err(PoolError::Closed(self.name.clone()));
        }

        let id = ConnectionId::new();
        let channels = ResourcePool::from_parts(
            format!("{}/{}", self.name, id.short()),
            ChannelManager::new(Arc::clone(&self.broker), Arc::clone(&connection)),
            self.options.per_connection(),
            self.retry,
        );
        let open = OpenConnection {
            id,
            connection,
            channels,
        };

        let index = match arena.slots.iter().position(|s| s.conn.is_none()) {
            Some(index) => index,
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    conn: None,
                });
                arena.slots.len() - 1
            }
        };
        let slot = &mut arena.slots[index];
        slot.conn = Some(open.clone());
        let generation = slot.generation;
        let open_now = arena.open_count();
        drop(arena);

        info!(
            pool = %self.name,
            connection = %id.short(),
            slot = index,
            open = open_now,
            "opened broker connection"
        );
        Ok(Candidate {
            index,
            generation,
            open,
        })
    }

    /// Take a connection out of service and invalidate all its channels.
    fn retire(&self, index: usize, generation: u64, reason: &str) {
        let taken = {
            let mut arena = self.arena.lock();
            match arena.slots.get_mut(index) {
                Some(slot) if slot.generation == generation => {
                    let taken = slot.conn.take();
                    if taken.is_some() {
                        slot.generation += 1;
                    }
                    taken
                }
                _ => None,
            }
        };
        let Some(open) = taken else {
            return;
        };

        let revoked = open.channels.revoke_outstanding();
        self.broker.close_connection(&open.connection);
        warn!(
            pool = %self.name,
            connection = %open.id.short(),
            revoked = revoked.len(),
            reason,
            "retired broker connection"
        );
        self.available.notify_waiters();
    }

    /// Try to lease a channel from one connection without waiting longer
    /// than `deadline`.
    ///
    /// `Err` carries the failure. The connection is retired only when the
    /// broker reports it unhealthy; a failed open on a healthy connection
    /// leaves its other channels alone.
    async fn try_channel(
        self: &Arc<Self>,
        candidate: &Candidate<B>,
        deadline: Instant,
    ) -> Result<Option<Lease<B::Channel>>, String> {
        if !self.broker.connection_healthy(&candidate.open.connection) {
            let reason = "broker connection is closed".to_string();
            self.retire(candidate.index, candidate.generation, &reason);
            return Err(reason);
        }

        let attempt = match timeout_at(deadline, candidate.open.channels.try_acquire()).await {
            Ok(attempt) => attempt,
            Err(_) => return Ok(None),
        };
        match attempt {
            Ok(Some(lease)) => Ok(Some(self.wrap(candidate, lease))),
            Ok(None) | Err(PoolError::Closed(_)) => Ok(None),
            Err(err) => {
                let reason = err.to_string();
                if self.broker.connection_healthy(&candidate.open.connection) {
                    debug!(
                        pool = %self.name,
                        connection = %candidate.open.id.short(),
                        error = %reason,
                        "channel open failed on a healthy connection"
                    );
                } else {
                    self.retire(candidate.index, candidate.generation, &reason);
                }
                Err(reason)
            }
        }
    }

    fn wrap(self: &Arc<Self>, candidate: &Candidate<B>, lease: Lease<B::Channel>) -> Lease<B::Channel> {
        trace!(
            pool = %self.name,
            connection = %candidate.open.id.short(),
            lease = %lease.id().short(),
            "leased channel"
        );
        let shared = Arc::clone(self);
        let (index, generation) = (candidate.index, candidate.generation);
        lease.rehome(move |inner| {
            Arc::new(ChannelHome {
                shared,
                inner,
                index,
                generation,
            }) as Arc<dyn Recycle<B::Channel>>
        })
    }

    fn unavailable(&self, attempts: u32, reason: String) -> PoolError {
        warn!(
            pool = %self.name,
            attempts,
            reason = %reason,
            "no broker connection could supply a channel"
        );
        PoolError::BrokerUnavailable {
            pool: self.name.clone(),
            attempts,
            reason,
        }
    }

    fn exhausted(&self, waited: Duration) -> PoolError {
        PoolError::Exhausted {
            pool: self.name.clone(),
            capacity: self.options.capacity(),
            waited,
        }
    }
}

/// Connection slot reserved while a connect is in flight.
struct Connecting<B: BrokerManager> {
    shared: Arc<Shared<B>>,
}

impl<B: BrokerManager> Drop for Connecting<B> {
    fn drop(&mut self) {
        self.shared.arena.lock().connecting -= 1;
        self.shared.available.notify_one();
    }
}

struct Waiting<'a, B: BrokerManager> {
    arena: &'a Mutex<Arena<B>>,
}

impl<'a, B: BrokerManager> Waiting<'a, B> {
    fn new(arena: &'a Mutex<Arena<B>>) -> Self {
        arena.lock().waiters += 1;
        Self { arena }
    }
}

impl<B: BrokerManager> Drop for Waiting<'_, B> {
    fn drop(&mut self) {
        self.arena.lock().waiters -= 1;
    }
}

/// Home of a leased channel: forwards to the owning connection's pool unless
/// that connection has been retired since.
struct ChannelHome<B: BrokerManager> {
    shared: Arc<Shared<B>>,
    inner: Arc<dyn Recycle<B::Channel>>,
    index: usize,
    generation: u64,
}

impl<B: BrokerManager> Recycle<B::Channel> for ChannelHome<B> {
    fn recycle(&self, id: LeaseId, channel: B::Channel, healthy: bool) {
        let current = self.shared.is_current(self.index, self.generation);
        self.inner.recycle(id, channel, healthy && current);
        self.shared.available.notify_one();
    }

    fn check(&self) -> Result<(), PoolError> {
        if self.shared.is_current(self.index, self.generation) {
            Ok(())
        } else {
            Err(PoolError::ConnectionLost)
        }
    }
}

#[async_trait]
impl<B: BrokerManager> ConnectionPool for ChannelPool<B> {
    type Resource = B::Channel;

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn options(&self) -> PoolOptions {
        self.shared.options.pool_options()
    }

    async fn acquire(&self) -> Result<Lease<B::Channel>, PoolError> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + shared.options.acquire_timeout;
        let max_failures = shared.options.max_connections as u32 + 1;
        let mut failures = 0u32;
        let mut connect_attempts = 0u32;
        let mut last_failure = String::new();
        let mut may_connect = true;
        let mut waiting: Option<Waiting<'_, B>> = None;

        loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let candidates = {
                let arena = shared.arena.lock();
                if arena.closed {
                    return Err(PoolError::Closed(shared.name.clone()));
                }
                arena.candidates()
            };

            // Least-loaded connection first.
            let mut ranked: Vec<(usize, Candidate<B>)> = candidates
                .into_iter()
                .map(|c| {
                    let stats = c.open.channels.stats();
                    (stats.outstanding + stats.pending, c)
                })
                .collect();
            ranked.sort_by_key(|(load, c)| (*load, c.index));

            let mut failed = false;
            for (_, candidate) in &ranked {
                match shared.try_channel(candidate, deadline).await {
                    Ok(Some(lease)) => return Ok(lease),
                    Ok(None) => {}
                    Err(reason) => {
                        failures += 1;
                        last_failure = reason;
                        failed = true;
                    }
                }
            }

            let reservation = if may_connect {
                shared.reserve_connection()?
            } else {
                None
            };
            if let Some(reservation) = reservation {
                let connected = match timeout_at(deadline, shared.connect(reservation)).await {
                    Ok(connected) => connected,
                    Err(_) => return Err(shared.exhausted(started.elapsed())),
                };
                match connected {
                    Ok(candidate) => match shared.try_channel(&candidate, deadline).await {
                        Ok(Some(lease)) => return Ok(lease),
                        Ok(None) => {}
                        Err(reason) => {
                            failures += 1;
                            last_failure = reason;
                            failed = true;
                        }
                    },
                    Err(PoolError::BrokerUnavailable {
                        attempts, reason, ..
                    }) => {
                        connect_attempts += attempts;
                        last_failure = reason;
                        // Stop dialing for this call; open connections may
                        // still free a channel before the deadline.
                        may_connect = false;
                        if shared.arena.lock().open_count() == 0 {
                            return Err(shared.unavailable(failures + connect_attempts, last_failure));
                        }
                        debug!(
                            pool = %shared.name,
                            reason = %last_failure,
                            "could not open another broker connection, waiting on open ones"
                        );
                    }
                    Err(other) => return Err(other),
                }
            }

            if failed {
                let open = shared.arena.lock().open_count();
                if open == 0 || failures >= max_failures {
                    return Err(shared.unavailable(failures + connect_attempts, last_failure));
                }
                // Another pass over the connections that are still up.
                continue;
            }

            if waiting.is_none() {
                trace!(pool = %shared.name, "all channels in use, waiting");
                waiting = Some(Waiting::new(&shared.arena));
            }
            if timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed();
                debug!(
                    pool = %shared.name,
                    waited_ms = waited.as_millis() as u64,
                    "channel acquire timed out"
                );
                return Err(shared.exhausted(waited));
            }
        }
    }

    fn begin_drain(&self) {
        let pools: Vec<ResourcePool<ChannelManager<B>>> = {
            let mut arena = self.shared.arena.lock();
            if arena.closed {
                return;
            }
            arena.closed = true;
            arena
                .slots
                .iter()
                .filter_map(|s| s.conn.as_ref().map(|open| open.channels.clone()))
                .collect()
        };
        info!(pool = %self.shared.name, connections = pools.len(), "channel pool draining");
        for pool in &pools {
            pool.begin_drain();
        }
        self.shared.available.notify_waiters();
    }

    async fn close_within(&self, timeout: Duration) -> DrainOutcome {
        let shared = &self.shared;
        {
            let mut arena = shared.arena.lock();
            if arena.close_started {
                drop(arena);
                warn!(pool = %shared.name, "close called on a pool that is already closed");
                return DrainOutcome::already_closed(&shared.name);
            }
            arena.close_started = true;
        }
        self.begin_drain();

        let started = Instant::now();
        let deadline = started + timeout;
        let opens: Vec<OpenConnection<B>> = {
            let arena = shared.arena.lock();
            arena.slots.iter().filter_map(|s| s.conn.clone()).collect()
        };

        let mut outcome = DrainOutcome {
            pool: shared.name.clone(),
            outstanding_at_start: opens
                .iter()
                .map(|open| open.channels.stats().outstanding)
                .sum(),
            ..DrainOutcome::default()
        };

        // Channels first, then the connections that carry them.
        for open in &opens {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let drained = open.channels.close_within(remaining).await;
            outcome.forced += drained.forced;
            outcome.leaked.extend(drained.leaked);
        }

        let retired: Vec<OpenConnection<B>> = {
            let mut arena = shared.arena.lock();
            arena
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    let open = slot.conn.take();
                    if open.is_some() {
                        slot.generation += 1;
                    }
                    open
                })
                .collect()
        };
        for open in &retired {
            shared.broker.close_connection(&open.connection);
            debug!(pool = %shared.name, connection = %open.id.short(), "closed broker connection");
        }

        outcome.elapsed = started.elapsed();
        if outcome.timed_out() {
            warn!(
                pool = %shared.name,
                forced = outcome.forced,
                timeout_ms = timeout.as_millis() as u64,
                "drain timeout elapsed, force-closing leaked channels"
            );
        } else {
            info!(
                pool = %shared.name,
                connections = retired.len(),
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "channel pool closed"
            );
        }
        outcome
    }

    fn stats(&self) -> PoolStats {
        let (pools, waiters, closed) = {
            let arena = self.shared.arena.lock();
            let pools: Vec<ResourcePool<ChannelManager<B>>> = arena
                .slots
                .iter()
                .filter_map(|s| s.conn.as_ref().map(|open| open.channels.clone()))
                .collect();
            (pools, arena.waiters, arena.closed)
        };
        let mut stats = PoolStats {
            capacity: self.shared.options.capacity(),
            waiters,
            closed,
            ..PoolStats::default()
        };
        for pool in &pools {
            let s = pool.stats();
            stats.idle += s.idle;
            stats.outstanding += s.outstanding;
            stats.pending += s.pending;
            stats.created += s.created;
            stats.reused += s.reused;
            stats.discarded += s.discarded;
            stats.revoked += s.revoked;
        }
        stats
    }
}

impl<B: BrokerManager> std::fmt::Debug for ChannelPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("name", &self.shared.name)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
