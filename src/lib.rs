#![doc(html_root_url = "https://docs.rs/wsengine/latest")]
//! Public API for the `wsengine` library.
//!
//! `wsengine` is a small WebSocket server engine. A [`Server`] accepts TCP
//! connections, performs the HTTP/1.1 upgrade handshake, decodes client
//! frames and reports activity to an [`EventHandler`] as [`Event`]s. The
//! application replies or closes connections through a cloneable
//! [`ServerHandle`].
//!
//! All network I/O and connection state live on one worker thread owned by
//! the server; the handle may be used from any thread.

pub mod byte_order;
pub mod codec;
pub mod connection;
pub(crate) mod engine;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod metrics;
pub mod panic;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use codec::{CodecError, FrameDecoder};
pub use event::{Event, EventHandler, Message};
pub use handshake::HandshakeError;
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_PROCESSED};
pub use server::{BackoffConfig, Server, ServerBuilder, ServerError, ServerHandle};
pub use session::ConnectionId;
