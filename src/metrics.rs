//! Metric helpers for `wsengine`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open WebSocket connections.
pub const CONNECTIONS_ACTIVE: &str = "wsengine_connections_active";
/// Name of the counter tracking processed frames.
pub const FRAMES_PROCESSED: &str = "wsengine_frames_processed_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "wsengine_errors_total";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Frames decoded from a client.
    Inbound,
    /// Frames written to a client.
    Outbound,
}

impl Direction {
    /// Label value used for the `direction` label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Failure categories recorded under the `kind` label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected opening handshake.
    Handshake,
    /// Frame violating the protocol.
    Protocol,
    /// Transport failure.
    Io,
    /// Failed `accept` on the listener.
    Accept,
    /// Panic caught in a callback or task.
    Panic,
}

impl ErrorKind {
    /// Label value used for the `kind` label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Handshake => "handshake",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::Accept => "accept",
            ErrorKind::Panic => "panic",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed frame for the given direction.
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record an error occurrence.
pub fn inc_errors(kind: ErrorKind) {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL, "kind" => kind.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}
