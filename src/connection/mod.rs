//! Per-connection state owned by the engine.
//!
//! A [`Connection`] holds the two halves of its transport, the decode buffer,
//! the FIFO of frames waiting to be written and the lifecycle flags. Reads
//! and writes run as spawned tasks that take a transport half with them and
//! hand it back through the engine mailbox when they finish. While a half is
//! away the matching `reading` or `sending` flag is set and the connection
//! cannot be removed from its [`ConnectionTable`].
//!
//! Closing a connection cancels its token. In-flight operations observe the
//! cancellation, report back, and the last completion makes the connection
//! removable.

mod counter;
pub mod table;

use std::{collections::VecDeque, io, net::SocketAddr};

use bytes::BytesMut;
pub use counter::open_connection_count;
use counter::ActiveConnection;
use log::trace;
pub use table::ConnectionTable;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tokio_util::{codec::Decoder, sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::{CodecError, FrameDecoder, InboundFrame},
    engine::Completion,
    frame::ServerFrame,
    session::ConnectionId,
};

/// Minimum spare capacity reserved in the decode buffer before each read.
const READ_CHUNK: usize = 4096;

/// Position of a connection in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Reading and writing normally.
    Open,
    /// Closed, but a read or write still holds part of the transport.
    Closing,
    /// Closed with no operation in flight. Safe to destroy.
    Removable,
}

/// A live WebSocket connection.
#[derive(Debug)]
pub struct Connection<S> {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    reader: Option<ReadHalf<S>>,
    writer: Option<WriteHalf<S>>,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    queue: VecDeque<ServerFrame>,
    cancel: CancellationToken,
    closed: bool,
    reading: bool,
    sending: bool,
    close_queued: bool,
    _active: ActiveConnection,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an upgraded stream.
    ///
    /// `leftover` holds bytes read past the end of the handshake request.
    pub(crate) fn new(
        id: ConnectionId,
        stream: S,
        peer_addr: Option<SocketAddr>,
        leftover: BytesMut,
        max_payload_len: usize,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id,
            peer_addr,
            reader: Some(reader),
            writer: Some(writer),
            read_buf: leftover,
            decoder: FrameDecoder::new(max_payload_len),
            queue: VecDeque::new(),
            cancel: CancellationToken::new(),
            closed: false,
            reading: false,
            sending: false,
            close_queued: false,
            _active: ActiveConnection::new(),
        }
    }

    /// Start a read unless one is already running or the connection closed.
    pub(crate) fn begin_read(
        &mut self,
        completions: &mpsc::UnboundedSender<Completion<S>>,
        tracker: &TaskTracker,
    ) {
        if self.closed || self.close_queued {
            return;
        }
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        self.reading = true;

        let mut buf = std::mem::take(&mut self.read_buf);
        buf.reserve(READ_CHUNK);
        let (id, cancel, tx) = (self.id, self.cancel.clone(), completions.clone());
        tracker.spawn(async move {
            let result = read_some(&mut reader, &mut buf, &cancel).await;
            // The engine is gone only after every connection was removed.
            let _ = tx.send(Completion::Read {
                id,
                reader,
                buf,
                result,
            });
        });
    }

    /// Append `frame` to the send queue.
    ///
    /// A write starts only when the queue was empty, so at most one write is
    /// in flight and frames reach the peer in the order they were queued.
    /// Returns `false` when the connection is closed and the frame was
    /// discarded.
    pub(crate) fn send_frame(
        &mut self,
        frame: ServerFrame,
        completions: &mpsc::UnboundedSender<Completion<S>>,
        tracker: &TaskTracker,
    ) -> bool {
        if self.closed {
            return false;
        }
        self.queue.push_back(frame);
        if self.queue.len() == 1 {
            self.begin_write(completions, tracker);
        }
        true
    }

    /// Write the frame at the front of the queue.
    pub(crate) fn begin_write(
        &mut self,
        completions: &mpsc::UnboundedSender<Completion<S>>,
        tracker: &TaskTracker,
    ) {
        if self.closed || self.sending {
            return;
        }
        let Some(frame) = self.queue.front().cloned() else {
            return;
        };
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        self.sending = true;

        let (id, cancel, tx) = (self.id, self.cancel.clone(), completions.clone());
        tracker.spawn(async move {
            let result = write_frame(&mut writer, &frame, &cancel).await;
            let _ = tx.send(Completion::Write { id, writer, result });
        });
    }

    /// Take back the read half and buffer after a read finished.
    pub(crate) fn finish_read(&mut self, reader: ReadHalf<S>, buf: BytesMut) {
        self.reader = Some(reader);
        self.read_buf = buf;
        self.reading = false;
    }

    /// Take back the write half after a write finished.
    ///
    /// Returns the frame that was written, unless the connection closed
    /// while the write was in flight.
    pub(crate) fn finish_write(&mut self, writer: WriteHalf<S>) -> Option<ServerFrame> {
        self.writer = Some(writer);
        self.sending = false;
        if self.closed {
            None
        } else {
            self.queue.pop_front()
        }
    }
}

impl<S> Connection<S> {
    /// Identifier of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Remote address, when the transport has one.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer_addr }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed }

    /// Whether a read is in flight.
    #[must_use]
    pub fn is_reading(&self) -> bool { self.reading }

    /// Whether a write is in flight.
    #[must_use]
    pub fn is_sending(&self) -> bool { self.sending }

    /// Number of frames waiting to be written, including the one in flight.
    #[must_use]
    pub fn queued_frames(&self) -> usize { self.queue.len() }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        match (self.closed, self.reading || self.sending) {
            (false, _) => Lifecycle::Open,
            (true, true) => Lifecycle::Closing,
            (true, false) => Lifecycle::Removable,
        }
    }

    /// Whether the connection may be destroyed.
    #[must_use]
    pub fn is_removable(&self) -> bool { self.lifecycle() == Lifecycle::Removable }

    /// Mark the connection closed and cancel any in-flight operation.
    ///
    /// Returns `true` on the first call only.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        trace!(
            "closing connection: id={}, reading={}, sending={}, queued={}",
            self.id,
            self.reading,
            self.sending,
            self.queue.len()
        );
        self.closed = true;
        self.queue.clear();
        self.cancel.cancel();
        true
    }

    /// Record that a Close reply is queued. No further frames are read.
    pub(crate) fn mark_close_queued(&mut self) { self.close_queued = true; }

    /// Whether the peer's Close has been answered.
    #[must_use]
    pub fn close_queued(&self) -> bool { self.close_queued }

    /// Decode the next complete frame buffered for this connection.
    pub(crate) fn next_frame(&mut self) -> Result<Option<InboundFrame>, CodecError> {
        self.decoder.decode(&mut self.read_buf)
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn read_some<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(io::ErrorKind::ConnectionAborted.into()),
        res = reader.read_buf(buf) => res,
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn write_frame<W>(
    writer: &mut W,
    frame: &ServerFrame,
    cancel: &CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = frame.as_buf();
    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(io::ErrorKind::ConnectionAborted.into()),
        res = async {
            writer.write_all_buf(&mut buf).await?;
            writer.flush().await
        } => res,
    }
}
