//! Shared helpers for integration testing `wsengine` servers.
//!
//! Handlers run on the server's worker thread, so recorded events travel
//! back to the test over a channel. [`EventLog`] wraps the receiving end.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use tokio::{sync::mpsc, time::timeout};
use wsengine::{ConnectionId, Event, EventHandler, Server, ServerBuilder, ServerHandle};

use crate::client::READ_TIMEOUT;

/// Shared result type for integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// An event together with the connection it concerns.
pub type RecordedEvent = (ConnectionId, Event);

/// Create a TCP listener bound to a free local port.
///
/// # Errors
///
/// Returns any IO error encountered while binding to an ephemeral localhost
/// port.
pub fn unused_listener() -> std::io::Result<StdTcpListener> {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr)
}

/// Events delivered to a recording handler, in order.
#[derive(Debug)]
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<RecordedEvent>,
}

impl EventLog {
    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// Fails if no event arrives within [`READ_TIMEOUT`] or the server has
    /// stopped and every event has been consumed.
    pub async fn next(&mut self) -> TestResult<RecordedEvent> {
        timeout(READ_TIMEOUT, self.rx.recv())
            .await
            .map_err(|_| "timed out waiting for an event")?
            .ok_or_else(|| "server stopped".into())
    }

    /// Wait for a [`Event::NewConnection`] and return its id.
    ///
    /// # Errors
    ///
    /// Fails if the next event is anything else.
    pub async fn connected(&mut self) -> TestResult<ConnectionId> {
        match self.next().await? {
            (id, Event::NewConnection) => Ok(id),
            other => Err(format!("expected NewConnection, got {other:?}").into()),
        }
    }

    /// Take every event already delivered.
    pub fn drain(&mut self) -> Vec<RecordedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Handler recording every event.
#[must_use]
pub fn recorder() -> (impl EventHandler, EventLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |_: &ServerHandle, id: ConnectionId, event: Event| {
        let _ = tx.send((id, event));
    };
    (handler, EventLog { rx })
}

/// Handler echoing each message to its sender and recording every event.
#[must_use]
pub fn echo_recorder() -> (impl EventHandler, EventLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |server: &ServerHandle, id: ConnectionId, event: Event| {
        if let Event::Message(message) = &event {
            let _ = server.send(id, message.clone());
        }
        let _ = tx.send((id, event));
    };
    (handler, EventLog { rx })
}

/// Start a server with default settings on a free local port.
///
/// # Errors
///
/// Propagates bind and startup failures.
pub fn start_server<H: EventHandler>(handler: H) -> TestResult<Server> {
    start_with(ServerBuilder::new(handler))
}

/// Start a configured server on a free local port.
///
/// # Errors
///
/// Propagates bind and startup failures.
pub fn start_with<H: EventHandler>(builder: ServerBuilder<H>) -> TestResult<Server> {
    Ok(builder.bind_listener(unused_listener()?)?)
}
