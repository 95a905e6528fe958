//! WebSocket server running on a dedicated worker thread.
//!
//! [`Server`] binds a TCP listener and starts one worker thread driving a
//! Tokio current-thread runtime. The accept loop, opening handshakes,
//! connection I/O and the protocol engine all run on that thread. The
//! application talks to the engine from any thread through a cloneable
//! [`ServerHandle`], which posts commands into the engine's mailbox.

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    thread::JoinHandle,
};

use bytes::Bytes;
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::Request,
    event::{EventHandler, Message},
    session::ConnectionId,
};

mod config;
mod connection;
pub mod error;
mod runtime;

pub use config::ServerBuilder;
pub use error::ServerError;
/// Re-exported configuration types for server back-off behaviour.
pub use runtime::BackoffConfig;

#[cfg(test)]
pub(crate) mod test_util;

/// Thread-safe handle for sending to and dropping connections.
///
/// Handles are cheap to clone and may be used from any thread, including
/// from inside an [`EventHandler`]. Commands are queued and applied by the
/// engine in the order they were posted.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl ServerHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { requests }, rx)
    }

    pub(crate) fn post(&self, request: Request) -> Result<(), ServerError> {
        self.requests.send(request).map_err(|_| ServerError::Stopped)
    }

    /// Queue `message` for delivery to connection `id`.
    ///
    /// Messages for unknown or closed connections are discarded by the
    /// engine.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn send(&self, id: ConnectionId, message: impl Into<Message>) -> Result<(), ServerError> {
        self.post(Request::Send {
            id,
            message: message.into(),
        })
    }

    /// Queue a text message for connection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn send_text(&self, id: ConnectionId, text: impl Into<String>) -> Result<(), ServerError> {
        self.send(id, Message::Text(text.into()))
    }

    /// Queue a binary message for connection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn send_binary(&self, id: ConnectionId, data: impl Into<Bytes>) -> Result<(), ServerError> {
        self.send(id, Message::Binary(data.into()))
    }

    /// Close connection `id`.
    ///
    /// Dropping an unknown or already closed connection has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn drop_connection(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.post(Request::Drop { id })
    }
}

/// A running WebSocket server.
///
/// Dropping the server stops it.
///
/// # Examples
///
/// ```no_run
/// use wsengine::{ConnectionId, Event, Server, ServerHandle};
///
/// let mut server = Server::bind(
///     "127.0.0.1:9001".parse().expect("valid address"),
///     |server: &ServerHandle, id: ConnectionId, event: Event| {
///         if let Event::Message(message) = event {
///             let _ = server.send(id, message);
///         }
///     },
/// )
/// .expect("bind");
/// // ...
/// server.stop();
/// ```
#[derive(Debug)]
pub struct Server {
    handle: ServerHandle,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl Server {
    /// Start a server with default settings on `addr`.
    ///
    /// # Errors
    ///
    /// See [`ServerBuilder::bind`].
    pub fn bind<H: EventHandler>(addr: SocketAddr, handler: H) -> Result<Self, ServerError> {
        ServerBuilder::new(handler).bind(addr)
    }

    /// Start a server with default settings on an existing listener.
    ///
    /// # Errors
    ///
    /// See [`ServerBuilder::bind_listener`].
    pub fn bind_listener<H: EventHandler>(
        listener: StdTcpListener,
        handler: H,
    ) -> Result<Self, ServerError> {
        ServerBuilder::new(handler).bind_listener(listener)
    }

    /// Address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// A cloneable handle for use from other threads.
    #[must_use]
    pub fn handle(&self) -> ServerHandle { self.handle.clone() }

    /// See [`ServerHandle::send`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn send(&self, id: ConnectionId, message: impl Into<Message>) -> Result<(), ServerError> {
        self.handle.send(id, message)
    }

    /// See [`ServerHandle::send_text`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn send_text(&self, id: ConnectionId, text: impl Into<String>) -> Result<(), ServerError> {
        self.handle.send_text(id, text)
    }

    /// See [`ServerHandle::send_binary`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn send_binary(&self, id: ConnectionId, data: impl Into<Bytes>) -> Result<(), ServerError> {
        self.handle.send_binary(id, data)
    }

    /// See [`ServerHandle::drop_connection`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has shut down.
    pub fn drop_connection(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.handle.drop_connection(id)
    }

    /// Whether [`stop`](Self::stop) has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool { self.worker.is_none() }

    /// Stop accepting, close every connection and wait for the worker to
    /// drain.
    ///
    /// Every open connection receives [`Event::Disconnect`](crate::Event)
    /// before this returns. Calling `stop` again has no effect.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("stopping server: local_addr={}", self.local_addr);
        self.shutdown.cancel();
        // The engine only exits after CloseAll, so this cannot fail while
        // the worker is running.
        let _ = self.handle.post(Request::CloseAll);
        if worker.join().is_err() {
            error!("server worker panicked: local_addr={}", self.local_addr);
        }
        info!("server stopped: local_addr={}", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) { self.stop(); }
}
