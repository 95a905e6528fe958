#![cfg(test)]
//! Helpers shared by the crate's unit tests.
//!
//! These build client frames byte by byte and parse server frames back so
//! tests can speak the wire format without a real client.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    byte_order::{read_network_u16, read_network_u64, write_network_u16, write_network_u64},
    frame::{FIN_BIT, LEN_16, LEN_64, MASK_BIT, Opcode, apply_mask},
};

/// Masking key used by [`client_frame`].
pub const TEST_MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

/// Encode a client frame with an explicit first header byte.
///
/// `first` carries FIN, RSV and opcode bits verbatim so tests can produce
/// malformed frames. When `mask` is `None` the MASK bit is left clear.
pub fn raw_client_frame(first: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = vec![first];
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    match payload.len() {
        len @ 0..=125 => out.push(mask_bit | u8::try_from(len).unwrap_or_default()),
        len if len <= usize::from(u16::MAX) => {
            out.push(mask_bit | LEN_16);
            out.extend_from_slice(&write_network_u16(u16::try_from(len).unwrap_or_default()));
        }
        len => {
            out.push(mask_bit | LEN_64);
            out.extend_from_slice(&write_network_u64(len as u64));
        }
    }
    let mut body = payload.to_vec();
    if let Some(key) = mask {
        out.extend_from_slice(&key);
        apply_mask(&mut body, key);
    }
    out.extend_from_slice(&body);
    out
}

/// Encode a final, masked client frame.
pub fn client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    raw_client_frame(FIN_BIT | opcode.bits(), payload, Some(TEST_MASK))
}

/// Split one unmasked server frame off the front of `buf`.
///
/// Returns `None` when `buf` does not yet hold a complete frame.
pub fn split_server_frame(buf: &mut BytesMut) -> Option<(Opcode, Bytes)> {
    let (&first, &second) = (buf.first()?, buf.get(1)?);
    assert_eq!(second & MASK_BIT, 0, "server frames must not be masked");
    let (ext, len) = match second & 0x7F {
        LEN_16 => (2, u64::from(read_network_u16(buf.get(2..4)?.try_into().ok()?))),
        LEN_64 => (8, read_network_u64(buf.get(2..10)?.try_into().ok()?)),
        short => (0, u64::from(short)),
    };
    let len = usize::try_from(len).ok()?;
    if buf.len() < 2 + ext + len {
        return None;
    }
    buf.advance(2 + ext);
    Some((Opcode::from_bits(first), buf.split_to(len).freeze()))
}

/// Read exactly one server frame from `reader`.
pub async fn read_server_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Option<(Opcode, Bytes)>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = split_server_frame(buf) {
            return Some(frame);
        }
        if reader.read_buf(buf).await.ok()? == 0 {
            return None;
        }
    }
}
