//! Leases: exclusive, scoped ownership of a pooled resource.
//!
//! A [`Lease`] is handed out by `acquire` and gives its holder sole access to
//! the resource until the lease ends. A lease ends exactly once, on whichever
//! of these happens first:
//!
//! 1. [`Lease::release`]: the resource goes back to the idle set.
//! 2. [`Lease::discard`]: the resource is closed and its capacity freed.
//! 3. The lease is dropped. Same as `release`, or `discard` if the lease was
//!    marked unhealthy. Early returns, `?`, panics and cancelled futures all
//!    end up here.
//!
//! Both explicit methods consume the lease, so a double release cannot be
//! expressed.
//!
//! A pool that gives up waiting for a lease during shutdown revokes its
//! [`LeaseTicket`]; from then on the lease refuses access to the resource.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::PoolError;
use crate::id::LeaseId;

/// Boxed future borrowing a leased resource for `'a`.
///
/// Closures passed to scoped helpers return this so the borrow of the
/// resource can be expressed in their signature.
pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a resource goes when its lease ends.
///
/// Implemented by every pool. `recycle` runs inside `Drop`, so it must not
/// block or suspend.
pub trait Recycle<R>: Send + Sync {
    /// Take back a resource. `healthy == false` means the holder flagged it
    /// broken and it must be closed rather than reused.
    fn recycle(&self, id: LeaseId, resource: R, healthy: bool);

    /// Whether leases homed here may still touch their resource.
    fn check(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

/// Bookkeeping shared between a lease and its pool's outstanding table.
#[derive(Debug)]
pub struct LeaseTicket {
    id: LeaseId,
    acquired_at: Instant,
    revoked: AtomicBool,
}

impl LeaseTicket {
    /// Issue a fresh ticket.
    pub fn issue() -> Arc<Self> {
        Arc::new(Self {
            id: LeaseId::new(),
            acquired_at: Instant::now(),
            revoked: AtomicBool::new(false),
        })
    }

    /// Lease identifier.
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Time since the lease was handed out.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Revoke the lease. Returns `false` if it was already revoked.
    pub fn revoke(&self) -> bool {
        let first = !self.revoked.swap(true, Ordering::AcqRel);
        if first {
            debug!(lease_id = %self.id, held_ms = self.held_for().as_millis() as u64, "lease revoked");
        }
        first
    }

    /// Whether the lease has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// Exclusive handle to a pooled resource.
pub struct Lease<R: Send + 'static> {
    resource: Option<R>,
    ticket: Arc<LeaseTicket>,
    home: Arc<dyn Recycle<R>>,
    healthy: bool,
}

impl<R: Send + 'static> Lease<R> {
    /// Wrap a resource that a pool has just handed out.
    pub fn new(resource: R, ticket: Arc<LeaseTicket>, home: Arc<dyn Recycle<R>>) -> Self {
        Self {
            resource: Some(resource),
            ticket,
            home,
            healthy: true,
        }
    }

    /// Lease identifier.
    pub fn id(&self) -> LeaseId {
        self.ticket.id()
    }

    /// Time since the lease was handed out.
    pub fn held_for(&self) -> Duration {
        self.ticket.held_for()
    }

    /// Whether the resource may still be used.
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    fn check(&self) -> Result<(), PoolError> {
        self.home.check()?;
        if self.ticket.is_revoked() {
            return Err(PoolError::Revoked(self.ticket.id()));
        }
        Ok(())
    }

    /// Borrow the resource.
    ///
    /// Fails once the lease has been revoked or its owning connection closed.
    pub fn get(&self) -> Result<&R, PoolError> {
        self.check()?;
        self.resource
            .as_ref()
            .ok_or(PoolError::Revoked(self.ticket.id()))
    }

    /// Mutably borrow the resource.
    pub fn get_mut(&mut self) -> Result<&mut R, PoolError> {
        self.check()?;
        let id = self.ticket.id();
        self.resource.as_mut().ok_or(PoolError::Revoked(id))
    }

    /// Flag the resource as broken; it will be closed instead of reused.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Whether the holder still considers the resource healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Return the resource to its pool.
    pub fn release(self) {}

    /// Close the resource and free its capacity slot.
    pub fn discard(mut self) {
        self.healthy = false;
    }

    /// Route this lease through a different home.
    ///
    /// `wrap` receives the current home and returns the one that will see the
    /// resource when the lease ends; it is expected to forward to the
    /// original.
    pub fn rehome<F>(mut self, wrap: F) -> Lease<R>
    where
        F: FnOnce(Arc<dyn Recycle<R>>) -> Arc<dyn Recycle<R>>,
    {
        let resource = self.resource.take();
        Lease {
            resource,
            ticket: Arc::clone(&self.ticket),
            home: wrap(Arc::clone(&self.home)),
            healthy: self.healthy,
        }
    }
}

impl<R: Send + 'static> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let healthy = self.healthy && !self.ticket.is_revoked();
            self.home.recycle(self.ticket.id(), resource, healthy);
        }
    }
}

impl<R: Send + 'static> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.ticket.id())
            .field("healthy", &self.healthy)
            .field("revoked", &self.ticket.is_revoked())
            .finish_non_exhaustive()
    }
}
