//! Test helpers shared across server and engine modules.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use rstest::fixture;
use tokio::sync::mpsc;

use super::ServerHandle;
use crate::{event::Event, session::ConnectionId};

/// Events observed by a [`recording_handler`], in delivery order.
pub type EventLog = mpsc::UnboundedReceiver<(ConnectionId, Event)>;

#[fixture]
/// Returns a bound [`TcpListener`](StdTcpListener) on a free port for use in
/// tests.
///
/// Keeping the listener bound prevents race conditions where another
/// process could claim the port between discovery and use.
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("Failed to bind free port listener")
}

/// Handler forwarding every event into an [`EventLog`].
pub fn recording_handler() -> (
    impl FnMut(&ServerHandle, ConnectionId, Event) + Send + 'static,
    EventLog,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |_: &ServerHandle, id: ConnectionId, event: Event| {
        let _ = tx.send((id, event));
    };
    (handler, rx)
}

/// Drain whatever is already queued in `log`.
pub fn drain(log: &mut EventLog) -> Vec<(ConnectionId, Event)> {
    let mut events = Vec::new();
    while let Ok(event) = log.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_listener_uses_localhost() {
        let addr = free_listener().local_addr().expect("local addr");
        assert_eq!(addr.ip(), std::net::IpAddr::from(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn recording_handler_keeps_order() {
        let (mut handler, mut log) = recording_handler();
        let (handle, _requests) = ServerHandle::channel();
        handler(&handle, ConnectionId::new(1), Event::NewConnection);
        handler(&handle, ConnectionId::new(1), Event::Disconnect);
        let events = drain(&mut log);
        assert!(matches!(
            events.as_slice(),
            [(_, Event::NewConnection), (_, Event::Disconnect)]
        ));
    }
}
