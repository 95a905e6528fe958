//! Worker thread driving the accept loop and the engine.

mod accept;
mod backoff;

use std::{io, sync::Arc, thread, time::Duration};

#[cfg(test)]
pub(super) use accept::MockAcceptListener;
pub(super) use accept::{AcceptListener, AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use log::debug;
use tokio::{net::TcpListener, runtime::Runtime, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ServerHandle, connection::HandshakeOptions};
use crate::{
    engine::{Engine, Request},
    event::EventHandler,
};

/// Name given to the worker thread.
const WORKER_THREAD_NAME: &str = "wsengine-worker";

/// Everything the worker needs besides the runtime, listener and handler.
#[derive(Debug)]
pub(super) struct WorkerOptions {
    pub handle: ServerHandle,
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub shutdown: CancellationToken,
    pub max_payload_len: usize,
    pub max_request_len: usize,
    pub handshake_timeout: Option<Duration>,
    pub backoff: BackoffConfig,
}

/// Start the worker thread.
///
/// The thread owns `runtime` and returns once the engine has stopped and
/// every task spawned on the worker has finished.
pub(super) fn spawn_worker<H>(
    runtime: Runtime,
    listener: TcpListener,
    handler: H,
    options: WorkerOptions,
) -> io::Result<thread::JoinHandle<()>>
where
    H: EventHandler,
{
    thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_owned())
        .spawn(move || runtime.block_on(run_worker(Arc::new(listener), handler, options)))
}

/// Run the engine and the accept loop until the engine stops.
///
/// The engine stops after [`Request::CloseAll`] once every connection has
/// been removed. The accept loop and any handshakes still in progress are
/// then cancelled and awaited.
pub(super) async fn run_worker<L, H>(listener: Arc<L>, handler: H, options: WorkerOptions)
where
    L: AcceptListener + 'static,
    H: EventHandler,
{
    let WorkerOptions {
        handle,
        requests,
        shutdown,
        max_payload_len,
        max_request_len,
        handshake_timeout,
        backoff,
    } = options;
    let tracker = TaskTracker::new();
    let engine = Engine::new(handler, handle, requests, tracker.clone(), max_payload_len);

    tracker.spawn(accept_loop(
        listener,
        AcceptLoopOptions {
            registrar: engine.registrar(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            backoff,
            handshake: HandshakeOptions {
                max_request_len,
                timeout: handshake_timeout,
            },
        },
    ));

    engine.run().await;

    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    debug!("worker finished");
}
