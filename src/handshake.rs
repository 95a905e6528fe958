//! Server side of the WebSocket opening handshake.
//!
//! [`read_request`] collects the HTTP upgrade request from the transport and
//! [`negotiate`] turns it into a reply. `negotiate` performs no I/O: it
//! always produces the bytes to send back, together with the outcome, so the
//! caller writes the reply first and then either promotes the connection or
//! closes it.

use std::{collections::HashMap, io};

use base64::prelude::*;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest upgrade request accepted, including the terminating blank line.
pub const MAX_REQUEST_LENGTH: usize = 8 * 1024;

/// Value appended to the client key before hashing.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
const SUPPORTED_VERSION: &str = "13";

const REQUEST_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons an upgrade request is refused.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The request line is not `<method> <target> <version>`.
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    /// Only `GET` can be upgraded.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// Only HTTP/1.1 can be upgraded.
    #[error("unsupported HTTP version: {0}")]
    UnsupportedHttpVersion(String),

    /// A required header is absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A header is malformed or carries an unexpected value.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// `Sec-WebSocket-Key` is not the base64 encoding of 16 bytes.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,

    /// `Sec-WebSocket-Version` names a version other than 13.
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),

    /// No blank line within the allowed request length.
    #[error("request exceeds {max} bytes")]
    RequestTooLarge {
        /// Maximum accepted request length.
        max: usize,
    },

    /// The peer did not complete the handshake in time.
    #[error("handshake timed out")]
    TimedOut,

    /// Transport failure while reading the request or writing the reply.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// HTTP status used to refuse the request.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::UnsupportedVersion(_) => 426,
            _ => 400,
        }
    }

    /// Reply sent to the peer for this error.
    #[must_use]
    pub fn reply(&self) -> Vec<u8> {
        match self {
            Self::UnsupportedVersion(_) => format!(
                "HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: \
                 {SUPPORTED_VERSION}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            )
            .into_bytes(),
            _ => b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
        }
    }
}

/// Reply bytes and outcome of a negotiation.
#[derive(Debug)]
pub struct Negotiation {
    /// Bytes to write back to the peer, whatever the outcome.
    pub reply: Vec<u8>,
    /// `Ok` when the connection should be promoted to WebSocket.
    pub outcome: Result<(), HandshakeError>,
}

impl Negotiation {
    /// Whether the handshake succeeded.
    #[must_use]
    pub fn is_accepted(&self) -> bool { self.outcome.is_ok() }
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// use wsengine::handshake::accept_key;
///
/// assert_eq!(
///     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Validate an upgrade request and build the reply.
///
/// `request` holds the request line and headers up to and including the
/// blank line.
#[must_use]
pub fn negotiate(request: &[u8]) -> Negotiation {
    match validate(request) {
        Ok(key) => Negotiation {
            reply: format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: \
                 Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            )
            .into_bytes(),
            outcome: Ok(()),
        },
        Err(err) => Negotiation {
            reply: err.reply(),
            outcome: Err(err),
        },
    }
}

/// Check the request and return the client key.
fn validate(request: &[u8]) -> Result<String, HandshakeError> {
    let text = std::str::from_utf8(request)
        .map_err(|_| HandshakeError::InvalidRequestLine("request is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::InvalidRequestLine(request_line.into()));
    };
    if target.is_empty() {
        return Err(HandshakeError::InvalidRequestLine(request_line.into()));
    }
    if method != "GET" {
        return Err(HandshakeError::UnsupportedMethod(method.into()));
    }
    if version != "HTTP/1.1" {
        return Err(HandshakeError::UnsupportedHttpVersion(version.into()));
    }

    let headers = parse_headers(lines)?;
    let header = |name: &'static str| headers.get(name).map(String::as_str);

    let upgrade = header("upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !has_token(upgrade, "websocket") {
        return Err(HandshakeError::InvalidHeader(format!("Upgrade: {upgrade}")));
    }

    let connection = header("connection").ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !has_token(connection, "upgrade") {
        return Err(HandshakeError::InvalidHeader(format!(
            "Connection: {connection}"
        )));
    }

    let key = header("sec-websocket-key").ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match BASE64_STANDARD.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    if let Some(version) =
        header("sec-websocket-version").filter(|version| *version != SUPPORTED_VERSION)
    {
        return Err(HandshakeError::UnsupportedVersion(version.into()));
    }

    Ok(key.to_owned())
}

/// Whether the comma-separated header `value` lists `token`, ignoring case.
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Collect header lines into a map keyed by lowercase name.
///
/// Repeated headers are joined with `", "`.
fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, String>, HandshakeError> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::InvalidHeader(line.into()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HandshakeError::InvalidHeader(line.into()));
        }
        let value = value.trim();
        headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    Ok(headers)
}

/// An upgrade request read off the wire.
#[derive(Debug)]
pub struct RawRequest {
    /// Request line and headers, including the terminating blank line.
    pub head: BytesMut,
    /// Bytes received after the blank line. These belong to the first
    /// WebSocket frame.
    pub leftover: BytesMut,
}

/// Read from `reader` until the blank line ending the request headers.
///
/// # Errors
///
/// Returns [`HandshakeError::RequestTooLarge`] when `max_len` bytes arrive
/// without a blank line and [`HandshakeError::Io`] when the transport fails
/// or closes first.
pub async fn read_request<R>(reader: &mut R, max_len: usize) -> Result<RawRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let mut scanned = 0;
    loop {
        if let Some(pos) = buf[scanned..]
            .windows(REQUEST_TERMINATOR.len())
            .position(|window| window == REQUEST_TERMINATOR)
        {
            let end = scanned + pos + REQUEST_TERMINATOR.len();
            if end > max_len {
                return Err(HandshakeError::RequestTooLarge { max: max_len });
            }
            let head = buf.split_to(end);
            return Ok(RawRequest {
                head,
                leftover: buf,
            });
        }
        if buf.len() >= max_len {
            return Err(HandshakeError::RequestTooLarge { max: max_len });
        }
        // The terminator may straddle two reads.
        scanned = buf.len().saturating_sub(REQUEST_TERMINATOR.len() - 1);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
}
