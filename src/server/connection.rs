//! Opening handshake for accepted connections.
//!
//! Each accepted stream gets a task that reads the HTTP upgrade request,
//! writes the reply and, on success, hands the stream to the engine together
//! with any bytes that arrived after the request headers.

use std::{net::SocketAddr, panic::AssertUnwindSafe, time::Duration};

use bytes::BytesMut;
use futures::FutureExt;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    engine::Registrar,
    handshake::{HandshakeError, Negotiation, negotiate, read_request},
    metrics::{self, ErrorKind},
};

/// Limits applied while upgrading a connection.
#[derive(Clone, Copy, Debug)]
pub(in crate::server) struct HandshakeOptions {
    pub max_request_len: usize,
    pub timeout: Option<Duration>,
}

/// Spawn a task upgrading `stream`, logging and discarding any panics.
pub(in crate::server) fn spawn_handshake_task<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    registrar: Registrar<S>,
    options: HandshakeOptions,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tracker.spawn(async move {
        let fut = AssertUnwindSafe(process_stream(
            stream, peer_addr, registrar, options, shutdown,
        ))
        .catch_unwind();

        if let Err(panic) = fut.await {
            crate::panic::report_panic("handshake task", panic, &peer_addr);
        }
    });
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn process_stream<S>(
    mut stream: S,
    peer_addr: Option<SocketAddr>,
    registrar: Registrar<S>,
    options: HandshakeOptions,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let outcome = tokio::select! {
        biased;

        () = shutdown.cancelled() => None,
        res = handshake(&mut stream, options) => Some(res),
    };

    match outcome {
        None => debug!("handshake abandoned on shutdown: peer_addr={peer_addr:?}"),
        Some(Ok(leftover)) => {
            debug!(
                "handshake complete: peer_addr={peer_addr:?}, leftover={}",
                leftover.len()
            );
            if !registrar.register(stream, peer_addr, leftover) {
                debug!("engine stopped before registration: peer_addr={peer_addr:?}");
            }
        }
        Some(Err(err)) => {
            metrics::inc_errors(ErrorKind::Handshake);
            warn!("handshake failed: error={err}, peer_addr={peer_addr:?}");
        }
    }
}

/// Run the opening handshake, bounded by the configured timeout.
///
/// Returns the bytes read past the end of the request on success.
async fn handshake<S>(stream: &mut S, options: HandshakeOptions) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let work = upgrade(stream, options.max_request_len);
    match options.timeout {
        Some(limit) => timeout(limit, work)
            .await
            .unwrap_or(Err(HandshakeError::TimedOut)),
        None => work.await,
    }
}

async fn upgrade<S>(stream: &mut S, max_request_len: usize) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(stream, max_request_len).await {
        Ok(request) => request,
        Err(err @ HandshakeError::RequestTooLarge { .. }) => {
            // Best effort: the peer is told why before the stream is dropped.
            let _ = stream.write_all(&err.reply()).await;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    let Negotiation { reply, outcome } = negotiate(&request.head);
    stream.write_all(&reply).await?;
    stream.flush().await?;
    outcome.map(|()| request.leftover)
}
