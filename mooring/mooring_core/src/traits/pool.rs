//! The pool interface shared by every backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PoolError;
use crate::lease::Lease;
use crate::types::{DrainOutcome, PoolOptions, PoolStats};

/// A bounded set of reusable handles to one backend.
///
/// Every pool, whether it hands out database connections, cache clients or
/// broker channels, obeys the same contract:
///
/// - at no instant do outstanding leases plus idle handles exceed capacity;
/// - `acquire` on a closed pool fails with [`PoolError::Closed`];
/// - `acquire` waits at most the configured acquire timeout and then fails
///   with [`PoolError::Exhausted`];
/// - every lease ends exactly once, whether released, discarded or dropped.
///
/// The trait is object safe so the registry can hold heterogeneous pools.
///
/// # Examples
///
/// ```
/// use mooring_core::traits::ConnectionPool;
/// use mooring_core::error::PoolError;
///
/// async fn ping<P: ConnectionPool<Resource = String> + ?Sized>(pool: &P) -> Result<usize, PoolError> {
///     let lease = pool.acquire().await?;
///     Ok(lease.get()?.len())
/// }
/// ```
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// The handle type this pool lends out.
    type Resource: Send + 'static;

    /// Registry name of the pool.
    fn name(&self) -> &str;

    /// Sizing and timeout options the pool was built with.
    fn options(&self) -> PoolOptions;

    /// Obtain exclusive use of one handle.
    ///
    /// Suspends while the pool is at capacity. Dropping the returned future
    /// before it completes leaves the pool as if the call never happened.
    async fn acquire(&self) -> Result<Lease<Self::Resource>, PoolError>;

    /// Give a handle back. Equivalent to dropping the lease.
    fn release(&self, lease: Lease<Self::Resource>) {
        lease.release();
    }

    /// Stop admitting acquisitions and wake every waiter.
    ///
    /// Idempotent. Outstanding leases are untouched.
    fn begin_drain(&self);

    /// Drain and close using the configured drain timeout.
    async fn close(&self) -> DrainOutcome {
        self.close_within(self.options().drain_timeout).await
    }

    /// Drain and close, waiting at most `timeout` for outstanding leases.
    ///
    /// Leases still out when the timeout expires are revoked and reported in
    /// the outcome. A second call returns an outcome flagged `already_closed`.
    async fn close_within(&self, timeout: Duration) -> DrainOutcome;

    /// Point-in-time counters.
    fn stats(&self) -> PoolStats;
}

/// Shared, type-erased handle to a pool of `R`.
pub type SharedPool<R> = Arc<dyn ConnectionPool<Resource = R>>;
