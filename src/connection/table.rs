//! Exclusive owner of all live connections.

use std::{collections::HashMap, net::SocketAddr};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use super::Connection;
use crate::session::ConnectionId;

/// Registry of live connections keyed by [`ConnectionId`].
///
/// Identifiers are allocated here, start at 1 and are never reused.
#[derive(Debug)]
pub struct ConnectionTable<S> {
    last_id: u64,
    max_payload_len: usize,
    connections: HashMap<ConnectionId, Connection<S>>,
}

impl<S> ConnectionTable<S> {
    /// Create an empty table whose connections accept payloads up to
    /// `max_payload_len` bytes.
    #[must_use]
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            last_id: 0,
            max_payload_len,
            connections: HashMap::new(),
        }
    }

    /// Look up a connection.
    #[must_use]
    pub fn find(&self, id: ConnectionId) -> Option<&Connection<S>> { self.connections.get(&id) }

    /// Look up a connection for mutation.
    pub fn find_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    /// Destroy a removable connection.
    ///
    /// Returns `false` when `id` is unknown or the connection still has an
    /// operation in flight, in which case it is left in place.
    pub fn erase(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        if !conn.is_removable() {
            log::debug!(
                "erase refused: id={id}, lifecycle={:?}",
                conn.lifecycle()
            );
            return false;
        }
        self.connections.remove(&id);
        true
    }

    /// Close every connection and return the ids whose state changed.
    ///
    /// Connections are not removed; each becomes removable once its
    /// in-flight operations report back.
    pub fn close_all(&mut self) -> Vec<ConnectionId> {
        self.connections
            .values_mut()
            .filter_map(|conn| conn.close().then_some(conn.id()))
            .collect()
    }

    /// Number of connections in the table, including closing ones.
    #[must_use]
    pub fn len(&self) -> usize { self.connections.len() }

    /// Whether the table holds no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.connections.is_empty() }

    /// Identifiers of all connections, in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl<S> ConnectionTable<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Take ownership of an upgraded stream and allocate its identifier.
    pub fn add(
        &mut self,
        stream: S,
        peer_addr: Option<SocketAddr>,
        leftover: BytesMut,
    ) -> ConnectionId {
        self.last_id += 1;
        let id = ConnectionId::new(self.last_id);
        let conn = Connection::new(id, stream, peer_addr, leftover, self.max_payload_len);
        self.connections.insert(id, conn);
        id
    }
}
