//! Events delivered to the application.
//!
//! The engine reports connection activity through an [`EventHandler`]. Each
//! callback runs on the server's worker thread, so handlers should return
//! quickly; replies are issued through the [`ServerHandle`] passed in.

use bytes::Bytes;

use crate::{server::ServerHandle, session::ConnectionId};

/// A complete application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Binary(Bytes),
}

impl Message {
    /// Raw payload bytes of the message.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Whether the message is sent as a binary frame.
    #[must_use]
    pub fn is_binary(&self) -> bool { matches!(self, Self::Binary(_)) }
}

impl From<String> for Message {
    fn from(value: String) -> Self { Self::Text(value) }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self { Self::Text(value.to_owned()) }
}

impl From<Bytes> for Message {
    fn from(value: Bytes) -> Self { Self::Binary(value) }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self { Self::Binary(Bytes::from(value)) }
}

/// Connection activity reported to the application.
///
/// For every connection the handler sees `NewConnection`, any number of
/// `Message`s, then exactly one `Disconnect`. Connections that fail the
/// opening handshake produce no events at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The opening handshake completed.
    NewConnection,
    /// A message arrived from the peer.
    Message(Message),
    /// The connection is closing. No further events follow for this id.
    Disconnect,
}

impl Event {
    /// Short name of the event variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewConnection => "new_connection",
            Self::Message(_) => "message",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Application callback invoked for every [`Event`].
///
/// Implemented for any `FnMut(&ServerHandle, ConnectionId, Event)` closure.
///
/// ```
/// use wsengine::{ConnectionId, Event, ServerHandle};
///
/// let echo = |server: &ServerHandle, id: ConnectionId, event: Event| {
///     if let Event::Message(message) = event {
///         let _ = server.send(id, message);
///     }
/// };
/// # fn assert_handler(_: impl wsengine::EventHandler) {}
/// # assert_handler(echo);
/// ```
pub trait EventHandler: Send + 'static {
    /// Handle one event for connection `id`.
    fn on_event(&mut self, server: &ServerHandle, id: ConnectionId, event: Event);
}

impl<F> EventHandler for F
where
    F: FnMut(&ServerHandle, ConnectionId, Event) + Send + 'static,
{
    fn on_event(&mut self, server: &ServerHandle, id: ConnectionId, event: Event) {
        self(server, id, event);
    }
}
