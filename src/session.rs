//! Connection identity.
//!
//! Every accepted WebSocket session gets a [`ConnectionId`] that is unique
//! for the lifetime of the server. Identifiers are allocated sequentially
//! starting at 1 and are never reused, so a stale id held by the
//! application simply stops matching anything once its connection is gone.

use std::fmt;

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}
