//! Accept loop feeding new TCP connections into handshake tasks.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{Duration, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::BackoffConfig;
use crate::{
    engine::Registrar,
    metrics::{self, ErrorKind},
    server::connection::{HandshakeOptions, spawn_handshake_task},
};

/// Abstraction for sources of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

#[derive(Debug)]
pub(in crate::server) struct AcceptLoopOptions {
    pub registrar: Registrar<TcpStream>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
    pub handshake: HandshakeOptions,
}

/// Accept connections until `shutdown` is cancelled.
///
/// Each accepted stream gets its own handshake task on `tracker`. Failed
/// accepts are logged and retried after an exponential back-off bounded by
/// `backoff`; a successful accept resets the delay.
pub(in crate::server) async fn accept_loop<L>(listener: Arc<L>, options: AcceptLoopOptions)
where
    L: AcceptListener + 'static,
{
    let backoff = options.backoff.normalized();
    debug_assert!(
        backoff.initial_delay <= backoff.max_delay,
        "BackoffConfig invariant violated: initial_delay > max_delay"
    );
    let mut delay = backoff.initial_delay;
    while let Some(next_delay) = accept_iteration(listener.as_ref(), &options, &backoff, delay).await
    {
        delay = next_delay;
    }
    debug!("accept loop stopped");
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration<L>(
    listener: &L,
    options: &AcceptLoopOptions,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration>
where
    L: AcceptListener,
{
    select! {
        biased;

        () = options.shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, peer_addr)) => {
                debug!("accepted connection: peer_addr={peer_addr}");
                spawn_handshake_task(
                    stream,
                    Some(peer_addr),
                    options.registrar.clone(),
                    options.handshake,
                    options.shutdown.clone(),
                    &options.tracker,
                );
                backoff.initial_delay
            }
            Err(e) => {
                metrics::inc_errors(ErrorKind::Accept);
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                select! {
                    biased;

                    () = options.shutdown.cancelled() => return None,
                    () = sleep(delay) => {}
                }
                (delay * 2).min(backoff.max_delay)
            }
        }),
    }
}
