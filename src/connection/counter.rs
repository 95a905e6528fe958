//! Open connection counting and RAII guard.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide count of connections held in any connection table.
static OPEN_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Guard incrementing [`OPEN_CONNECTIONS`] and the connections gauge on
/// creation and decrementing both when the owning connection is destroyed.
#[derive(Debug)]
pub(super) struct ActiveConnection;

impl ActiveConnection {
    pub(super) fn new() -> Self {
        OPEN_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        OPEN_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

/// Return the number of connections currently alive across all servers.
///
/// A connection counts from the moment its handshake succeeds until it is
/// removed from its table, including the time spent closing.
#[must_use]
pub fn open_connection_count() -> u64 { OPEN_CONNECTIONS.load(Ordering::Relaxed) }
