//! Pool statistics and drain outcomes.

use std::time::Duration;

use serde::Serialize;

use crate::id::LeaseId;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured capacity.
    pub capacity: usize,

    /// Handles sitting in the idle set.
    pub idle: usize,

    /// Handles currently leased to callers.
    pub outstanding: usize,

    /// Factory calls in flight (counted against capacity).
    pub pending: usize,

    /// Tasks currently suspended in `acquire`.
    pub waiters: usize,

    /// Handles ever created by the factory.
    pub created: u64,

    /// Acquisitions served from the idle set.
    pub reused: u64,

    /// Handles closed because they were returned unhealthy.
    pub discarded: u64,

    /// Outstanding handles revoked by a forced close.
    pub revoked: u64,

    /// Whether the pool has stopped admitting acquisitions.
    pub closed: bool,
}

impl PoolStats {
    /// Handles alive in any form.
    pub fn total(&self) -> usize {
        self.idle + self.outstanding + self.pending
    }
}

/// Result of closing a single pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    /// Pool name.
    pub pool: String,

    /// Outstanding handles at the moment draining began.
    pub outstanding_at_start: usize,

    /// Handles that were force-closed because the drain timeout elapsed.
    pub forced: usize,

    /// Identifiers of the force-closed leases.
    pub leaked: Vec<LeaseId>,

    /// Time spent waiting for outstanding handles.
    pub elapsed: Duration,

    /// The pool had already been closed by an earlier call.
    pub already_closed: bool,
}

impl DrainOutcome {
    /// Outcome for a pool that was closed before this call.
    pub fn already_closed(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            already_closed: true,
            ..Self::default()
        }
    }

    /// Whether the drain timeout elapsed with handles still outstanding.
    pub fn timed_out(&self) -> bool {
        self.forced > 0
    }
}
