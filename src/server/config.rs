//! Builder-style configuration for [`Server`].

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    time::Duration,
};

use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{
    Server,
    ServerError,
    ServerHandle,
    runtime::{BackoffConfig, WorkerOptions, spawn_worker},
};
use crate::{
    codec::{MAX_PAYLOAD_LENGTH, clamp_payload_length},
    event::EventHandler,
    handshake::MAX_REQUEST_LENGTH,
};

/// Configures and starts a [`Server`].
///
/// ```no_run
/// use std::time::Duration;
///
/// use wsengine::{ConnectionId, Event, ServerBuilder, ServerHandle};
///
/// let server = ServerBuilder::new(|_: &ServerHandle, _: ConnectionId, _: Event| {})
///     .max_payload_len(64 * 1024)
///     .handshake_timeout(Some(Duration::from_secs(5)))
///     .bind("127.0.0.1:0".parse().expect("valid address"))
///     .expect("bind");
/// # drop(server);
/// ```
#[derive(Debug)]
pub struct ServerBuilder<H> {
    handler: H,
    max_payload_len: usize,
    max_request_len: usize,
    handshake_timeout: Option<Duration>,
    backoff: BackoffConfig,
}

impl<H> ServerBuilder<H>
where
    H: EventHandler,
{
    /// Create a builder delivering events to `handler`.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            max_payload_len: MAX_PAYLOAD_LENGTH,
            max_request_len: MAX_REQUEST_LENGTH,
            handshake_timeout: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Largest inbound frame payload accepted. Larger frames drop the
    /// connection.
    ///
    /// Values below 125 bytes are raised to 125 so control frames always
    /// fit.
    #[must_use]
    pub fn max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = clamp_payload_length(len);
        self
    }

    /// Largest opening handshake request accepted, in bytes.
    #[must_use]
    pub fn max_request_len(mut self, len: usize) -> Self {
        self.max_request_len = len.max(1);
        self
    }

    /// Time allowed for a client to complete the opening handshake.
    ///
    /// `None`, the default, waits indefinitely.
    #[must_use]
    pub fn handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }

    /// Back-off applied when `accept` fails.
    #[must_use]
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = config.normalized();
        self
    }

    /// Configured payload limit.
    #[must_use]
    pub fn payload_limit(&self) -> usize { self.max_payload_len }

    /// Configured handshake timeout.
    #[must_use]
    pub fn handshake_limit(&self) -> Option<Duration> { self.handshake_timeout }

    /// Bind `addr` and start the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound and
    /// [`ServerError::Runtime`] if the worker cannot be started.
    pub fn bind(self, addr: SocketAddr) -> Result<Server, ServerError> {
        let listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_listener(listener)
    }

    /// Start the worker on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot be registered
    /// with the runtime and [`ServerError::Runtime`] if the worker cannot be
    /// started.
    pub fn bind_listener(self, std_listener: StdTcpListener) -> Result<Server, ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let local_addr = std_listener.local_addr().map_err(ServerError::Bind)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener).map_err(ServerError::Bind)?
        };

        let (handle, requests) = ServerHandle::channel();
        let shutdown = CancellationToken::new();
        let worker = spawn_worker(
            runtime,
            listener,
            self.handler,
            WorkerOptions {
                handle: handle.clone(),
                requests,
                shutdown: shutdown.clone(),
                max_payload_len: self.max_payload_len,
                max_request_len: self.max_request_len,
                handshake_timeout: self.handshake_timeout,
                backoff: self.backoff,
            },
        )
        .map_err(ServerError::Runtime)?;
        info!("server listening: local_addr={local_addr}");

        Ok(Server {
            handle,
            shutdown,
            local_addr,
            worker: Some(worker),
        })
    }
}
