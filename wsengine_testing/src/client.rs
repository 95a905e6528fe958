//! Minimal WebSocket client for driving a running [`Server`](wsengine::Server)
//! over real TCP.
//!
//! The client masks every frame it sends, as browsers do, and parses the
//! unmasked frames the server writes back. It deliberately exposes raw
//! building blocks so tests can send malformed input too.

use std::{io, net::SocketAddr, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use wsengine::{
    byte_order::{read_network_u16, read_network_u64, write_network_u16, write_network_u64},
    frame::{Opcode, apply_mask},
    handshake::accept_key,
};

/// `Sec-WebSocket-Key` sent by [`TestClient::connect`].
pub const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// Masking key applied to every frame sent by [`TestClient`].
pub const CLIENT_MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

/// How long reads wait before a test is considered hung.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const FIN: u8 = 0x80;
const MASKED: u8 = 0x80;

/// Build an upgrade request carrying `key` plus any `extra_headers`.
///
/// Each extra header must end in `\r\n`.
#[must_use]
pub fn upgrade_request(key: Option<&str>, extra_headers: &str) -> String {
    let key_header = key.map_or_else(String::new, |key| format!("Sec-WebSocket-Key: {key}\r\n"));
    format!(
        "GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: \
         Upgrade\r\n{key_header}Sec-WebSocket-Version: 13\r\n{extra_headers}\r\n"
    )
}

/// Encode a client frame with an explicit first header byte.
///
/// When `mask` is `None` the frame is sent unmasked, which servers must
/// reject.
#[must_use]
pub fn encode_frame(first: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mask_bit = if mask.is_some() { MASKED } else { 0 };
    let mut out = vec![first];
    if let Ok(short) = u8::try_from(payload.len())
        && short <= 125
    {
        out.push(mask_bit | short);
    } else if let Ok(medium) = u16::try_from(payload.len()) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&write_network_u16(medium));
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&write_network_u64(payload.len() as u64));
    }
    let mut body = payload.to_vec();
    if let Some(key) = mask {
        out.extend_from_slice(&key);
        apply_mask(&mut body, key);
    }
    out.extend_from_slice(&body);
    out
}

/// A frame received from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

/// Client side of one WebSocket connection.
#[derive(Debug)]
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    /// Connect to `addr` and complete the opening handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the server does not
    /// answer with `101 Switching Protocols` and the expected accept key.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let request = upgrade_request(Some(CLIENT_KEY), "");
        let (client, reply) = Self::handshake(addr, request.as_bytes()).await?;
        if !reply.starts_with("HTTP/1.1 101 ") {
            return Err(io::Error::other(format!("upgrade refused: {reply}")));
        }
        let expected = format!("Sec-WebSocket-Accept: {}\r\n", accept_key(CLIENT_KEY));
        if !reply.contains(&expected) {
            return Err(io::Error::other(format!("bad accept key: {reply}")));
        }
        Ok(client)
    }

    /// Connect to `addr`, send `request` verbatim and return the reply head.
    ///
    /// Any bytes following the reply head stay buffered for
    /// [`read_frame`](Self::read_frame).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the server closes the
    /// stream before a complete reply head arrives.
    pub async fn handshake(addr: SocketAddr, request: &[u8]) -> io::Result<(Self, String)> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request).await?;
        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(1024),
        };
        loop {
            if let Some(end) = client.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = client.buf.split_to(end + 4);
                let reply = String::from_utf8_lossy(&head).into_owned();
                return Ok((client, reply));
            }
            if client.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Send a final, masked frame.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        self.send_raw(&encode_frame(FIN | opcode.bits(), payload, Some(CLIENT_MASK)))
            .await
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    /// Send a binary message.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        self.send(Opcode::Binary, data).await
    }

    /// Send a Close frame carrying `code` and `reason`.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        let mut payload = write_network_u16(code).to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.send(Opcode::Close, &payload).await
    }

    /// Write `bytes` to the socket unchanged.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Read the next frame from the server.
    ///
    /// Returns `Ok(None)` once the server closes the stream.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::TimedOut`] if nothing arrives within
    /// [`READ_TIMEOUT`], [`io::ErrorKind::InvalidData`] if the server sends a
    /// masked frame, and propagates read failures.
    pub async fn read_frame(&mut self) -> io::Result<Option<ReceivedFrame>> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(Some(frame));
            }
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Wait until the server closes the stream.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidData`] if the server sends anything
    /// before closing, and [`io::ErrorKind::TimedOut`] if it never closes.
    pub async fn expect_closed(&mut self) -> io::Result<()> {
        loop {
            if !self.buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected bytes before close: {:?}", &self.buf[..]),
                ));
            }
            match self.fill().await {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                // A reset also means the server dropped the connection.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
    }

    fn split_frame(&mut self) -> io::Result<Option<ReceivedFrame>> {
        let (Some(&first), Some(&second)) = (self.buf.first(), self.buf.get(1)) else {
            return Ok(None);
        };
        if second & MASKED != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "server sent a masked frame",
            ));
        }
        let (ext, len) = match second & 0x7F {
            126 => match self.buf.get(2..4) {
                Some(&[a, b]) => (2, u64::from(read_network_u16([a, b]))),
                _ => return Ok(None),
            },
            127 => match self.buf.get(2..10).and_then(|s| <[u8; 8]>::try_from(s).ok()) {
                Some(bytes) => (8, read_network_u64(bytes)),
                None => return Ok(None),
            },
            short => (0, u64::from(short)),
        };
        let len = usize::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        if self.buf.len() < 2 + ext + len {
            return Ok(None);
        }
        self.buf.advance(2 + ext);
        Ok(Some(ReceivedFrame {
            opcode: Opcode::from_bits(first),
            payload: self.buf.split_to(len).freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_masked_text_frame() {
        let frame = encode_frame(0x81, b"Hi", Some([0, 0, 0, 0]));
        assert_eq!(frame, vec![0x81, 0x82, 0, 0, 0, 0, b'H', b'i']);
    }

    #[test]
    fn encodes_extended_length() {
        let frame = encode_frame(0x82, &[0; 300], None);
        assert_eq!(&frame[..4], &[0x82, 126, 0x01, 0x2C]);
        assert_eq!(frame.len(), 304);
    }

    #[test]
    fn request_without_key_omits_header() {
        assert!(!upgrade_request(None, "").contains("Sec-WebSocket-Key"));
        assert!(upgrade_request(Some(CLIENT_KEY), "").contains(CLIENT_KEY));
    }
}
