//! Registry lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a pool registry.
///
/// Transitions are monotonic: `Uninitialized → Starting → Ready → Draining →
/// Closed`. The single shortcut is `Starting → Draining`, taken when startup
/// fails and the partially built registry has to be torn down without ever
/// serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Registry exists but no pool has been constructed.
    Uninitialized,

    /// Pools are being constructed in order.
    Starting,

    /// All pools are constructed; requests may be served.
    Ready,

    /// New acquisitions are rejected; outstanding handles are being waited on.
    Draining,

    /// Every pool is closed. Terminal.
    Closed,
}

impl LifecycleState {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Starting)
                | (Self::Starting, Self::Ready)
                | (Self::Starting, Self::Draining)
                | (Self::Ready, Self::Draining)
                | (Self::Draining, Self::Closed)
        )
    }

    /// Whether requests may be served in this state.
    pub fn is_serving(&self) -> bool {
        *self == Self::Ready
    }

    /// Whether shutdown has begun (draining or closed).
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
