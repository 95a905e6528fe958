//! Protocol engine: the single owner of all connection state.
//!
//! The engine is an actor. It owns the [`ConnectionTable`] and reacts to two
//! mailboxes:
//!
//! - requests from the application ([`Request`]), posted through a
//!   [`ServerHandle`] from any thread;
//! - completions from tasks running on the worker ([`Completion`]): newly
//!   upgraded streams and finished reads and writes.
//!
//! Every state change happens inside [`Engine::run`], one message at a time,
//! so connection state needs no locking. Reads and writes run in spawned
//! tasks that own a transport half for their duration and return it with
//! their completion, which keeps a connection alive until every operation
//! referencing it has reported back.

use std::{fmt, io, net::SocketAddr, panic::AssertUnwindSafe};

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tokio_util::task::TaskTracker;

use crate::{
    codec::{CodecError, InboundFrame},
    connection::ConnectionTable,
    event::{Event, EventHandler, Message},
    frame::{Opcode, ServerFrame},
    metrics::{self, Direction, ErrorKind},
    server::ServerHandle,
    session::ConnectionId,
};

/// Commands posted by the application.
#[derive(Debug)]
pub(crate) enum Request {
    /// Queue `message` for delivery to `id`.
    Send { id: ConnectionId, message: Message },
    /// Close `id`.
    Drop { id: ConnectionId },
    /// Close every connection and stop once the table is empty.
    CloseAll,
}

/// Notifications produced by tasks running on the worker.
pub(crate) enum Completion<S> {
    /// A stream passed the opening handshake.
    Register {
        stream: S,
        peer_addr: Option<SocketAddr>,
        leftover: BytesMut,
    },
    /// A read finished; the read half and buffer come back with it.
    Read {
        id: ConnectionId,
        reader: ReadHalf<S>,
        buf: BytesMut,
        result: io::Result<usize>,
    },
    /// A write finished; the write half comes back with it.
    Write {
        id: ConnectionId,
        writer: WriteHalf<S>,
        result: io::Result<()>,
    },
}

/// Sender used by handshake tasks to hand upgraded streams to the engine.
pub(crate) struct Registrar<S>(mpsc::UnboundedSender<Completion<S>>);

impl<S> Clone for Registrar<S> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<S> fmt::Debug for Registrar<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("closed", &self.0.is_closed())
            .finish()
    }
}

impl<S> Registrar<S> {
    /// Registrar detached from any engine, for tests that inspect
    /// completions directly.
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Completion<S>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Pass an upgraded stream to the engine.
    ///
    /// Returns `false` when the engine has already exited. The stream is
    /// dropped in that case, closing it.
    pub(crate) fn register(
        &self,
        stream: S,
        peer_addr: Option<SocketAddr>,
        leftover: BytesMut,
    ) -> bool {
        self.0
            .send(Completion::Register {
                stream,
                peer_addr,
                leftover,
            })
            .is_ok()
    }
}

enum Incoming<S> {
    Request(Request),
    Completion(Completion<S>),
}

/// Actor owning every connection of one server.
pub(crate) struct Engine<S, H> {
    table: ConnectionTable<S>,
    handler: H,
    handle: ServerHandle,
    requests: mpsc::UnboundedReceiver<Request>,
    completions: mpsc::UnboundedReceiver<Completion<S>>,
    completions_tx: mpsc::UnboundedSender<Completion<S>>,
    tracker: TaskTracker,
    stopping: bool,
}

impl<S, H> Engine<S, H>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: EventHandler,
{
    pub(crate) fn new(
        handler: H,
        handle: ServerHandle,
        requests: mpsc::UnboundedReceiver<Request>,
        tracker: TaskTracker,
        max_payload_len: usize,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            table: ConnectionTable::new(max_payload_len),
            handler,
            handle,
            requests,
            completions,
            completions_tx,
            tracker,
            stopping: false,
        }
    }

    pub(crate) fn registrar(&self) -> Registrar<S> { Registrar(self.completions_tx.clone()) }

    /// Process messages until [`Request::CloseAll`] has been received and
    /// every connection has been removed.
    ///
    /// A panic while handling one message is logged and the loop carries on.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub(crate) async fn run(mut self) {
        while !(self.stopping && self.table.is_empty()) {
            let incoming = tokio::select! {
                biased;

                Some(completion) = self.completions.recv() => Incoming::Completion(completion),
                Some(request) = self.requests.recv() => Incoming::Request(request),
                else => break,
            };
            let summary = incoming.summary();
            if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(incoming)))
            {
                crate::panic::report_panic("engine command", panic, &summary);
            }
        }
        debug!("engine stopped: open_connections={}", self.table.len());
    }

    fn dispatch(&mut self, incoming: Incoming<S>) {
        match incoming {
            Incoming::Request(Request::Send { id, message }) => self.send(id, message),
            Incoming::Request(Request::Drop { id }) => self.drop_connection(id),
            Incoming::Request(Request::CloseAll) => self.close_all(),
            Incoming::Completion(Completion::Register {
                stream,
                peer_addr,
                leftover,
            }) => self.register(stream, peer_addr, leftover),
            Incoming::Completion(Completion::Read {
                id,
                reader,
                buf,
                result,
            }) => self.on_read(id, reader, buf, result),
            Incoming::Completion(Completion::Write { id, writer, result }) => {
                self.on_write(id, writer, result);
            }
        }
    }

    fn register(&mut self, stream: S, peer_addr: Option<SocketAddr>, leftover: BytesMut) {
        if self.stopping {
            debug!("closing stream upgraded during shutdown: peer_addr={peer_addr:?}");
            return;
        }
        let id = self.table.add(stream, peer_addr, leftover);
        info!("connection opened: id={id}, peer_addr={peer_addr:?}");
        self.emit(id, Event::NewConnection);
        self.process_input(id);
    }

    /// Deliver `event` to the handler.
    ///
    /// A panicking handler is reported and the connection carries on as if
    /// the callback had returned.
    fn emit(&mut self, id: ConnectionId, event: Event) {
        let kind = event.kind();
        let handle = &self.handle;
        let handler = &mut self.handler;
        if let Err(panic) =
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(handle, id, event)))
        {
            let detail = format!("id={id}, event={kind}");
            crate::panic::report_panic("event handler", panic, &detail);
        }
    }

    /// Handle every complete frame in the buffer, then read more.
    fn process_input(&mut self, id: ConnectionId) {
        loop {
            let Some(conn) = self.table.find_mut(id) else {
                return;
            };
            if conn.is_closed() || conn.close_queued() {
                break;
            }
            match conn.next_frame() {
                Ok(Some(frame)) => self.on_frame(id, frame),
                Ok(None) => break,
                Err(err) => {
                    self.protocol_violation(id, &err);
                    return;
                }
            }
        }
        if let Some(conn) = self.table.find_mut(id) {
            conn.begin_read(&self.completions_tx, &self.tracker);
        }
    }

    fn on_frame(&mut self, id: ConnectionId, frame: InboundFrame) {
        metrics::inc_frames(Direction::Inbound);
        let (opcode, payload) = frame.into_parts();
        match opcode {
            Opcode::Text => match std::str::from_utf8(&payload) {
                Ok(text) => {
                    let message = Message::Text(text.to_owned());
                    self.emit(id, Event::Message(message));
                }
                Err(err) => self.protocol_violation(id, &CodecError::from(err)),
            },
            Opcode::Binary => {
                let message = Message::Binary(payload);
                self.emit(id, Event::Message(message));
            }
            Opcode::Close => self.on_close_frame(id, &payload),
            Opcode::Ping => {
                trace!("ping received: id={id}, len={}", payload.len());
                self.queue_frame(id, ServerFrame::new(Opcode::Pong, payload));
            }
            Opcode::Pong => trace!("pong received: id={id}, len={}", payload.len()),
            Opcode::Continuation | Opcode::Reserved(_) => {
                self.protocol_violation(id, &CodecError::UnsupportedOpcode(opcode));
            }
        }
    }

    /// Answer a peer's Close. The connection is dropped once the reply has
    /// been written.
    fn on_close_frame(&mut self, id: ConnectionId, payload: &Bytes) {
        debug!("close received: id={id}, len={}", payload.len());
        if let Some(conn) = self.table.find_mut(id) {
            conn.mark_close_queued();
        }
        self.queue_frame(id, ServerFrame::close_reply(payload));
    }

    fn queue_frame(&mut self, id: ConnectionId, frame: ServerFrame) {
        let Some(conn) = self.table.find_mut(id) else {
            debug!("send to unknown connection: id={id}");
            return;
        };
        if !conn.send_frame(frame, &self.completions_tx, &self.tracker) {
            debug!("discarding frame for closed connection: id={id}");
        }
    }

    fn send(&mut self, id: ConnectionId, message: Message) {
        let frame = match message {
            Message::Text(text) => ServerFrame::text(text),
            Message::Binary(bytes) => ServerFrame::binary(bytes),
        };
        self.queue_frame(id, frame);
    }

    fn on_read(
        &mut self,
        id: ConnectionId,
        reader: ReadHalf<S>,
        buf: BytesMut,
        result: io::Result<usize>,
    ) {
        let Some(conn) = self.table.find_mut(id) else {
            warn!("read completion for unknown connection: id={id}");
            return;
        };
        conn.finish_read(reader, buf);
        if conn.is_closed() {
            self.drop_connection(id);
            return;
        }
        match result {
            Ok(0) => {
                debug!("peer closed the stream: id={id}");
                self.drop_connection(id);
            }
            Ok(len) => {
                trace!("read completed: id={id}, len={len}");
                self.process_input(id);
            }
            Err(err) => {
                warn!("read failed: id={id}, error={err}");
                metrics::inc_errors(ErrorKind::Io);
                self.drop_connection(id);
            }
        }
    }

    fn on_write(&mut self, id: ConnectionId, writer: WriteHalf<S>, result: io::Result<()>) {
        let Some(conn) = self.table.find_mut(id) else {
            warn!("write completion for unknown connection: id={id}");
            return;
        };
        let written = conn.finish_write(writer);
        if conn.is_closed() {
            self.drop_connection(id);
            return;
        }
        if let Err(err) = result {
            warn!("write failed: id={id}, error={err}");
            metrics::inc_errors(ErrorKind::Io);
            self.drop_connection(id);
            return;
        }
        metrics::inc_frames(Direction::Outbound);
        if written.is_some_and(|frame| frame.opcode() == Opcode::Close) {
            debug!("close reply written: id={id}");
            self.drop_connection(id);
        } else {
            conn.begin_write(&self.completions_tx, &self.tracker);
        }
    }

    fn protocol_violation(&mut self, id: ConnectionId, err: &CodecError) {
        warn!(
            "protocol violation: id={id}, error={err}, error_type={}",
            err.error_type()
        );
        metrics::inc_errors(ErrorKind::Protocol);
        self.drop_connection(id);
    }

    /// The single path by which connections close and leave the table.
    ///
    /// The first call emits [`Event::Disconnect`]. Every call removes the
    /// connection if no operation is in flight; otherwise the completion of
    /// the last operation calls back in here. Unknown ids are ignored.
    fn drop_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.table.find_mut(id) else {
            return;
        };
        if conn.close() {
            info!("connection closed: id={id}");
            self.emit(id, Event::Disconnect);
        }
        if self.table.find(id).is_some_and(|conn| conn.is_removable()) {
            self.table.erase(id);
            trace!("connection removed: id={id}");
        }
    }

    fn close_all(&mut self) {
        info!("closing all connections: count={}", self.table.len());
        self.stopping = true;
        for id in self.table.ids() {
            self.drop_connection(id);
        }
    }
}

impl<S> Incoming<S> {
    /// Short description used when reporting a panic.
    fn summary(&self) -> String {
        match self {
            Self::Request(request) => format!("{request:?}"),
            Self::Completion(Completion::Register { peer_addr, .. }) => {
                format!("Register {{ peer_addr: {peer_addr:?} }}")
            }
            Self::Completion(Completion::Read { id, .. }) => format!("ReadComplete {{ id: {id} }}"),
            Self::Completion(Completion::Write { id, .. }) => {
                format!("WriteComplete {{ id: {id} }}")
            }
        }
    }
}

#[cfg(test)]
mod tests;
