//! Strongly-typed identifiers.
//!
//! Every lease handed out by a pool and every physical broker connection
//! carries an identifier so that leak warnings and drain reports can name
//! exactly which handle was left behind. Each identifier type is a thin
//! wrapper around a UUID with a phantom marker, so a `LeaseId` can never be
//! passed where a `ConnectionId` is expected.
//!
//! # Examples
//!
//! ```
//! use mooring_core::id::{ConnectionId, LeaseId};
//! use std::str::FromStr;
//!
//! let lease = LeaseId::new();
//! let conn = ConnectionId::new();
//! assert_ne!(lease.to_string(), conn.to_string());
//!
//! let parsed = LeaseId::from_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
//! assert_eq!(parsed.to_string(), "550e8400-e29b-41d4-a716-446655440000");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// A type-safe identifier based on UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id<T> {
    uuid: Uuid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Create an identifier from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    /// Get the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Short form used in log lines (first 8 hex digits).
    pub fn short(&self) -> String {
        let mut s = self.uuid.simple().to_string();
        s.truncate(8);
        s
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_uuid(Uuid::parse_str(s)?))
    }
}

/// Marker type for leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseMarker;
/// Identifier for a single acquire/release cycle of a pooled resource.
pub type LeaseId = Id<LeaseMarker>;

/// Marker type for physical broker connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionMarker;
/// Identifier for a physical broker connection.
pub type ConnectionId = Id<ConnectionMarker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_new_is_unique() {
        assert_ne!(LeaseId::new(), LeaseId::new());
    }

    #[test]
    fn test_id_from_str_round_trip() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id = LeaseId::from_str(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
        assert!(LeaseId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn test_id_short() {
        let id = ConnectionId::from_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(id.short(), "550e8400");
    }

    #[test]
    fn test_id_serde() {
        let id = LeaseId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: LeaseId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
