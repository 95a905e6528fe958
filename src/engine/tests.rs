//! Engine behaviour over in-memory streams.

use std::{collections::HashSet, time::Duration};

use bytes::{Bytes, BytesMut};
use rstest::rstest;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::task::TaskTracker;

use super::*;
use crate::{
    codec::MAX_PAYLOAD_LENGTH,
    frame::FIN_BIT,
    server::test_util::{EventLog, drain, recording_handler},
    test_helpers::{client_frame, raw_client_frame, read_server_frame},
};

struct Harness {
    handle: ServerHandle,
    registrar: Registrar<DuplexStream>,
    engine: JoinHandle<()>,
}

impl Harness {
    fn start<H: EventHandler>(handler: H) -> Self {
        let (handle, requests) = ServerHandle::channel();
        let engine = Engine::new(
            handler,
            handle.clone(),
            requests,
            TaskTracker::new(),
            MAX_PAYLOAD_LENGTH,
        );
        let registrar = engine.registrar();
        Self {
            handle,
            registrar,
            engine: tokio::spawn(engine.run()),
        }
    }

    fn connect(&self, leftover: &[u8]) -> DuplexStream {
        self.connect_with_capacity(leftover, 64 * 1024)
    }

    fn connect_with_capacity(&self, leftover: &[u8], capacity: usize) -> DuplexStream {
        let (client, server) = duplex(capacity);
        assert!(self.registrar.register(server, None, BytesMut::from(leftover)));
        client
    }

    /// Close everything and wait for the engine to exit.
    async fn stop(self) {
        self.handle.post(Request::CloseAll).expect("engine running");
        timeout(Duration::from_secs(5), self.engine)
            .await
            .expect("engine stopped in time")
            .expect("engine task did not panic");
    }
}

fn recorded() -> (Harness, EventLog) {
    let (handler, log) = recording_handler();
    (Harness::start(handler), log)
}

async fn next_event(log: &mut EventLog) -> (ConnectionId, Event) {
    timeout(Duration::from_secs(5), log.recv())
        .await
        .expect("event arrived in time")
        .expect("engine still running")
}

async fn opened(log: &mut EventLog) -> ConnectionId {
    let (id, event) = next_event(log).await;
    assert_eq!(event, Event::NewConnection);
    id
}

async fn assert_eof(client: &mut DuplexStream) {
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("stream closed in time")
        .expect("read to end");
    assert!(rest.is_empty(), "unexpected bytes after close: {rest:?}");
}

#[tokio::test]
async fn text_frame_becomes_message() {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    let id = opened(&mut log).await;

    client
        .write_all(&client_frame(Opcode::Text, b"hi"))
        .await
        .expect("write frame");
    assert_eq!(
        next_event(&mut log).await,
        (id, Event::Message(Message::Text("hi".into())))
    );
    harness.stop().await;
}

#[tokio::test]
async fn bytes_after_handshake_are_decoded_first() {
    let (harness, mut log) = recorded();
    let mut leftover = client_frame(Opcode::Binary, &[1, 2, 3]);
    leftover.extend_from_slice(&client_frame(Opcode::Text, b"next"));
    let _client = harness.connect(&leftover);

    let id = opened(&mut log).await;
    assert_eq!(
        next_event(&mut log).await,
        (id, Event::Message(Message::Binary(Bytes::from_static(&[1, 2, 3]))))
    );
    assert_eq!(
        next_event(&mut log).await,
        (id, Event::Message(Message::Text("next".into())))
    );
    harness.stop().await;
}

#[rstest]
#[case::unmasked(raw_client_frame(FIN_BIT | 0x1, b"x", None))]
#[case::fragmented(raw_client_frame(0x1, b"x", Some(crate::test_helpers::TEST_MASK)))]
#[case::continuation(client_frame(Opcode::Continuation, b"x"))]
#[case::invalid_utf8(client_frame(Opcode::Text, &[0xC3, 0x28]))]
#[tokio::test]
async fn protocol_violation_drops_connection(#[case] frame: Vec<u8>) {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    let id = opened(&mut log).await;

    client.write_all(&frame).await.expect("write frame");
    assert_eq!(next_event(&mut log).await, (id, Event::Disconnect));
    assert_eof(&mut client).await;
    harness.stop().await;
    assert!(drain(&mut log).is_empty());
}

#[tokio::test]
async fn close_is_answered_then_connection_dropped() {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    let id = opened(&mut log).await;

    client
        .write_all(&client_frame(Opcode::Close, &[0x03, 0xE8, b'b', b'y', b'e']))
        .await
        .expect("write close");
    let mut buf = BytesMut::new();
    let (opcode, payload) = read_server_frame(&mut client, &mut buf)
        .await
        .expect("close reply");
    assert_eq!(opcode, Opcode::Close);
    assert_eq!(&payload[..], &[0x03, 0xE8]);
    assert_eq!(next_event(&mut log).await, (id, Event::Disconnect));
    assert_eof(&mut client).await;

    harness.stop().await;
    assert!(drain(&mut log).is_empty(), "disconnect reported once");
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    opened(&mut log).await;

    client
        .write_all(&client_frame(Opcode::Ping, b"abc"))
        .await
        .expect("write ping");
    let mut buf = BytesMut::new();
    let (opcode, payload) = read_server_frame(&mut client, &mut buf)
        .await
        .expect("pong");
    assert_eq!(opcode, Opcode::Pong);
    assert_eq!(&payload[..], b"abc");
    harness.stop().await;
}

#[tokio::test]
async fn sends_arrive_in_order() {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    let id = opened(&mut log).await;

    harness.handle.send_text(id, "hello").expect("send");
    harness.handle.send_text(id, "world").expect("send");
    harness
        .handle
        .send_binary(id, Bytes::from_static(&[9]))
        .expect("send");

    let mut buf = BytesMut::new();
    for (opcode, expected) in [
        (Opcode::Text, &b"hello"[..]),
        (Opcode::Text, &b"world"[..]),
        (Opcode::Binary, &[9_u8][..]),
    ] {
        let frame = read_server_frame(&mut client, &mut buf)
            .await
            .expect("server frame");
        assert_eq!(frame, (opcode, Bytes::copy_from_slice(expected)));
    }
    harness.stop().await;
}

#[tokio::test]
async fn handler_can_reply_through_handle() {
    let (tx, mut log) = mpsc::unbounded_channel();
    let harness = Harness::start(move |server: &ServerHandle, id: ConnectionId, event: Event| {
        if let Event::Message(message) = &event {
            server.send(id, message.clone()).expect("engine running");
        }
        let _ = tx.send((id, event));
    });
    let mut client = harness.connect(&[]);
    opened(&mut log).await;

    client
        .write_all(&client_frame(Opcode::Text, b"echo"))
        .await
        .expect("write frame");
    let mut buf = BytesMut::new();
    let frame = read_server_frame(&mut client, &mut buf)
        .await
        .expect("echoed frame");
    assert_eq!(frame, (Opcode::Text, Bytes::from_static(b"echo")));
    harness.stop().await;
}

#[tokio::test]
async fn repeated_drop_reports_one_disconnect() {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    let id = opened(&mut log).await;

    harness.handle.drop_connection(id).expect("drop");
    harness.handle.drop_connection(id).expect("drop");
    harness
        .handle
        .drop_connection(ConnectionId::new(999))
        .expect("drop unknown");
    assert_eq!(next_event(&mut log).await, (id, Event::Disconnect));
    assert_eof(&mut client).await;

    harness.stop().await;
    assert!(drain(&mut log).is_empty());
}

#[tokio::test]
async fn send_to_dropped_connection_is_discarded() {
    let (harness, mut log) = recorded();
    let mut client = harness.connect(&[]);
    let id = opened(&mut log).await;

    harness.handle.drop_connection(id).expect("drop");
    harness.handle.send_text(id, "late").expect("send");
    assert_eq!(next_event(&mut log).await, (id, Event::Disconnect));
    assert_eof(&mut client).await;
    harness.stop().await;
}

#[tokio::test]
async fn drop_during_blocked_write_completes() {
    let (harness, mut log) = recorded();
    // The client never reads, so the write cannot finish on its own.
    let _client = harness.connect_with_capacity(&[], 64);
    let id = opened(&mut log).await;

    harness
        .handle
        .send_binary(id, vec![0_u8; 64 * 1024])
        .expect("send");
    harness.handle.drop_connection(id).expect("drop");
    assert_eq!(next_event(&mut log).await, (id, Event::Disconnect));

    harness.stop().await;
    assert!(drain(&mut log).is_empty());
}

#[tokio::test]
async fn close_all_disconnects_every_connection() {
    let (harness, mut log) = recorded();
    let clients: Vec<_> = (0..100).map(|_| harness.connect(&[])).collect();
    let mut ids = HashSet::new();
    for _ in 0..100 {
        ids.insert(opened(&mut log).await);
    }
    assert_eq!(ids.len(), 100);

    harness.stop().await;
    let events = drain(&mut log);
    assert_eq!(events.len(), 100);
    let disconnected: HashSet<_> = events
        .into_iter()
        .map(|(id, event)| {
            assert_eq!(event, Event::Disconnect);
            id
        })
        .collect();
    assert_eq!(disconnected, ids);
    drop(clients);
}

#[tokio::test]
async fn registration_after_close_all_is_refused() {
    let (handler, mut log) = recording_handler();
    let (handle, requests) = ServerHandle::channel();
    let mut engine: Engine<DuplexStream, _> =
        Engine::new(handler, handle, requests, TaskTracker::new(), MAX_PAYLOAD_LENGTH);

    engine.dispatch(Incoming::Request(Request::CloseAll));
    let (mut client, server) = duplex(1024);
    engine.dispatch(Incoming::Completion(Completion::Register {
        stream: server,
        peer_addr: None,
        leftover: BytesMut::new(),
    }));

    assert!(engine.table.is_empty());
    assert!(drain(&mut log).is_empty());
    assert_eof(&mut client).await;
}

#[tokio::test]
async fn handler_panic_leaves_connection_reading() {
    let (tx, mut log) = mpsc::unbounded_channel();
    let harness = Harness::start(move |_: &ServerHandle, id: ConnectionId, event: Event| {
        if event == Event::Message(Message::Text("boom".into())) {
            panic!("handler failed");
        }
        let _ = tx.send((id, event));
    });

    let mut first = harness.connect(&[]);
    let first_id = opened(&mut log).await;
    first
        .write_all(&client_frame(Opcode::Text, b"boom"))
        .await
        .expect("write frame");
    first
        .write_all(&client_frame(Opcode::Text, b"after"))
        .await
        .expect("write frame");
    assert_eq!(
        next_event(&mut log).await,
        (first_id, Event::Message(Message::Text("after".into())))
    );

    let mut second = harness.connect(&[]);
    let id = opened(&mut log).await;
    second
        .write_all(&client_frame(Opcode::Text, b"still here"))
        .await
        .expect("write frame");
    assert_eq!(
        next_event(&mut log).await,
        (id, Event::Message(Message::Text("still here".into())))
    );

    harness.stop().await;
    let disconnects = drain(&mut log)
        .into_iter()
        .filter(|(_, event)| *event == Event::Disconnect)
        .count();
    assert_eq!(disconnects, 2);
}

#[tokio::test]
async fn handler_panic_on_connect_still_reads_frames() {
    let (tx, mut log) = mpsc::unbounded_channel();
    let harness = Harness::start(move |_: &ServerHandle, id: ConnectionId, event: Event| {
        if event == Event::NewConnection {
            panic!("connect hook failed");
        }
        let _ = tx.send((id, event));
    });

    let _client = harness.connect(&client_frame(Opcode::Text, b"early"));
    let (id, event) = next_event(&mut log).await;
    assert_eq!(event, Event::Message(Message::Text("early".into())));

    harness.stop().await;
    assert_eq!(drain(&mut log), vec![(id, Event::Disconnect)]);
}
