//! Graceful drain of every registered pool
//!
//! Shutdown runs in two phases. Phase A stops every pool from handing out new
//! leases at once. Phase B closes the pools in reverse construction order,
//! sharing one deadline; whatever is still outstanding when a pool's share
//! runs out is force-closed and reported.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use mooring_core::types::{DrainOutcome, LifecycleState};

use crate::registry::PoolRegistry;

/// What a stop did, pool by pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// One entry per pool, in the order the pools were closed
    pub pools: Vec<DrainOutcome>,

    /// Wall time of the whole drain
    pub elapsed: Duration,

    /// The registry was already draining or closed; nothing was done
    pub already_stopped: bool,

    /// The registry was never started; nothing was done
    pub never_started: bool,
}

impl DrainReport {
    fn already_stopped() -> Self {
        Self {
            already_stopped: true,
            ..Self::default()
        }
    }

    fn never_started() -> Self {
        Self {
            never_started: true,
            ..Self::default()
        }
    }

    /// Handles force-closed across all pools.
    pub fn forced_total(&self) -> usize {
        self.pools.iter().map(|p| p.forced).sum()
    }

    /// Every pool drained without forcing anything.
    pub fn is_clean(&self) -> bool {
        self.forced_total() == 0
    }

    /// Outcome for one pool, if it was drained.
    pub fn pool(&self, name: &str) -> Option<&DrainOutcome> {
        self.pools.iter().find(|p| p.pool == name)
    }
}

/// Drain and close every pool in `registry` within `timeout`.
///
/// Calling this on a registry that is already draining or closed logs a
/// warning and returns a report with `already_stopped` set. A registry that
/// was never started yields a report with `never_started` set instead.
pub async fn drain(registry: &PoolRegistry, timeout: Duration) -> DrainReport {
    let started = Instant::now();

    if registry.state() == LifecycleState::Uninitialized {
        warn!("Stop requested on a registry that was never started");
        return DrainReport::never_started();
    }
    if let Err(e) = registry.advance(LifecycleState::Draining) {
        warn!(state = %registry.state(), "Stop requested but not running: {}", e);
        return DrainReport::already_stopped();
    }

    let pools = registry.entries();

    // Phase A: no pool hands out new leases from here on
    info!(pools = pools.len(), "Phase A: rejecting new acquisitions");
    for pool in &pools {
        pool.begin_drain();
    }

    // Phase B: close in reverse construction order under one deadline
    info!(
        timeout_ms = timeout.as_millis() as u64,
        "Phase B: waiting for outstanding leases"
    );
    let deadline = started + timeout;
    let mut outcomes = Vec::with_capacity(pools.len());
    for pool in pools.iter().rev() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = pool.close_within(remaining).await;
        if outcome.forced > 0 {
            warn!(
                pool = %outcome.pool,
                forced = outcome.forced,
                "Drain timed out, force-closed outstanding leases"
            );
        }
        outcomes.push(outcome);
    }

    if let Err(e) = registry.advance(LifecycleState::Closed) {
        warn!("Could not mark registry closed: {}", e);
    }

    let report = DrainReport {
        pools: outcomes,
        elapsed: started.elapsed(),
        ..DrainReport::default()
    };
    info!(
        forced = report.forced_total(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "All pools closed"
    );
    report
}
