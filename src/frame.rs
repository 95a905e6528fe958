//! WebSocket frame primitives.
//!
//! [`Opcode`] names the 4-bit frame type, [`ServerFrame`] is an encoded
//! outgoing frame and [`apply_mask`] implements the client masking XOR.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |  (if payload len == 126/127)  |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Masking key (client frames only)       |    Payload    |
//! +-----------------------------------------------+---------------+
//! ```

use bytes::{Buf, Bytes, buf::Chain};

use crate::byte_order::{write_network_u16, write_network_u64};

/// Largest payload a control frame (Close, Ping, Pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest header a client frame can carry: 2 fixed bytes, a 64-bit
/// extended length and a 4-byte masking key.
pub const MAX_HEADER_LEN: usize = 14;

const MAX_SERVER_HEADER_LEN: usize = 10;

pub(crate) const FIN_BIT: u8 = 0x80;
pub(crate) const RSV_BITS: u8 = 0x70;
pub(crate) const OPCODE_BITS: u8 = 0x0F;
pub(crate) const MASK_BIT: u8 = 0x80;
pub(crate) const LEN_BITS: u8 = 0x7F;
pub(crate) const LEN_16: u8 = 126;
pub(crate) const LEN_64: u8 = 127;

/// Frame type carried in the low nibble of the first header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation of a fragmented message (`0x0`).
    Continuation,
    /// UTF-8 text message (`0x1`).
    Text,
    /// Binary message (`0x2`).
    Binary,
    /// Connection close (`0x8`).
    Close,
    /// Ping (`0x9`).
    Ping,
    /// Pong (`0xA`).
    Pong,
    /// Any value the protocol leaves undefined.
    Reserved(u8),
}

impl Opcode {
    /// Interpret the low nibble of `bits` as an opcode.
    ///
    /// ```
    /// use wsengine::frame::Opcode;
    ///
    /// assert_eq!(Opcode::from_bits(0x81), Opcode::Text);
    /// assert_eq!(Opcode::from_bits(0x3), Opcode::Reserved(0x3));
    /// ```
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & OPCODE_BITS {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Return the 4-bit wire value.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & OPCODE_BITS,
        }
    }

    /// Control frames may not be fragmented and carry at most
    /// [`MAX_CONTROL_PAYLOAD`] bytes.
    #[must_use]
    pub fn is_control(self) -> bool { matches!(self, Self::Close | Self::Ping | Self::Pong) }
}

/// An encoded server-to-client frame.
///
/// The header is computed once at construction and kept apart from the
/// payload so that writing the frame never copies the payload. Server frames
/// are always final and never masked.
#[derive(Clone, Debug)]
pub struct ServerFrame {
    header: [u8; MAX_SERVER_HEADER_LEN],
    header_len: usize,
    opcode: Opcode,
    payload: Bytes,
}

impl ServerFrame {
    /// Build a final, unmasked frame.
    ///
    /// ```
    /// use wsengine::frame::{Opcode, ServerFrame};
    ///
    /// let frame = ServerFrame::new(Opcode::Text, "hi");
    /// assert_eq!(frame.header(), &[0x81, 0x02]);
    /// ```
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let mut header = [0_u8; MAX_SERVER_HEADER_LEN];
        header[0] = FIN_BIT | opcode.bits();
        let len = payload.len();
        let header_len = if let Some(short) = u8::try_from(len)
            .ok()
            .filter(|n| usize::from(*n) <= MAX_CONTROL_PAYLOAD)
        {
            header[1] = short;
            2
        } else if let Ok(medium) = u16::try_from(len) {
            header[1] = LEN_16;
            header[2..4].copy_from_slice(&write_network_u16(medium));
            4
        } else {
            header[1] = LEN_64;
            header[2..10].copy_from_slice(&write_network_u64(len as u64));
            10
        };
        Self {
            header,
            header_len,
            opcode,
            payload,
        }
    }

    /// Frame carrying a text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self { Self::new(Opcode::Text, text.into()) }

    /// Frame carrying a binary message.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self { Self::new(Opcode::Binary, payload) }

    /// Close frame answering a peer's close request.
    ///
    /// The peer's status code is echoed when it sent one; any reason text
    /// is dropped.
    #[must_use]
    pub fn close_reply(peer_payload: &[u8]) -> Self {
        let status = peer_payload.get(..2).map_or_else(Bytes::new, Bytes::copy_from_slice);
        Self::new(Opcode::Close, status)
    }

    /// Opcode of this frame.
    #[must_use]
    pub fn opcode(&self) -> Opcode { self.opcode }

    /// Encoded header bytes.
    #[must_use]
    pub fn header(&self) -> &[u8] { &self.header[..self.header_len] }

    /// Payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Total number of bytes this frame occupies on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize { self.header_len + self.payload.len() }

    /// Header followed by payload as a single [`Buf`], without copying.
    pub fn as_buf(&self) -> Chain<&[u8], Bytes> { self.header().chain(self.payload.clone()) }
}

/// XOR `buf` with `mask`, cycling through the four key bytes.
///
/// Masking is its own inverse, so the same call masks and unmasks.
///
/// ```
/// use wsengine::frame::apply_mask;
///
/// let mut data = *b"hello";
/// apply_mask(&mut data, [1, 2, 3, 4]);
/// apply_mask(&mut data, [1, 2, 3, 4]);
/// assert_eq!(&data, b"hello");
/// ```
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (byte, key) in buf.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= key;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(0, &[0x82, 0x00])]
    #[case::largest_inline(125, &[0x82, 125])]
    #[case::smallest_16_bit(126, &[0x82, 126, 0x00, 0x7E])]
    #[case::largest_16_bit(65_535, &[0x82, 126, 0xFF, 0xFF])]
    #[case::smallest_64_bit(65_536, &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0])]
    fn header_uses_three_tier_length(#[case] len: usize, #[case] expected: &[u8]) {
        let frame = ServerFrame::binary(vec![0_u8; len]);
        assert_eq!(frame.header(), expected);
        assert_eq!(frame.wire_len(), expected.len() + len);
    }

    #[rstest]
    #[case(Opcode::Text)]
    #[case(Opcode::Binary)]
    #[case(Opcode::Close)]
    #[case(Opcode::Ping)]
    #[case(Opcode::Pong)]
    fn header_is_final_and_unmasked(#[case] opcode: Opcode) {
        let frame = ServerFrame::new(opcode, Bytes::from_static(b"x"));
        let header = frame.header();
        assert_eq!(header[0] & FIN_BIT, FIN_BIT);
        assert_eq!(header[0] & RSV_BITS, 0);
        assert_eq!(Opcode::from_bits(header[0]), opcode);
        assert_eq!(header[1] & MASK_BIT, 0);
    }

    #[test]
    fn opcode_bits_round_trip_for_every_nibble() {
        for bits in 0..=OPCODE_BITS {
            assert_eq!(Opcode::from_bits(bits).bits(), bits);
        }
    }

    #[test]
    fn only_close_ping_pong_are_control() {
        let control: Vec<_> = (0..=OPCODE_BITS)
            .map(Opcode::from_bits)
            .filter(|op| op.is_control())
            .collect();
        assert_eq!(control, vec![Opcode::Close, Opcode::Ping, Opcode::Pong]);
    }

    #[test]
    fn as_buf_yields_header_then_payload() {
        let frame = ServerFrame::text("abc");
        let mut buf = frame.as_buf();
        let bytes = buf.copy_to_bytes(buf.remaining());
        assert_eq!(&bytes[..], &[0x81, 0x03, b'a', b'b', b'c']);
    }

    #[rstest]
    #[case::with_status(&[0x03, 0xE8, b'b', b'y', b'e'], &[0x03, 0xE8])]
    #[case::without_status(&[], &[])]
    fn close_reply_echoes_status_code(#[case] peer: &[u8], #[case] expected: &[u8]) {
        let frame = ServerFrame::close_reply(peer);
        assert_eq!(frame.opcode(), Opcode::Close);
        assert_eq!(&frame.payload()[..], expected);
    }

    #[test]
    fn mask_cycles_key_bytes() {
        let mut data = [0_u8; 6];
        apply_mask(&mut data, [1, 2, 3, 4]);
        assert_eq!(data, [1, 2, 3, 4, 1, 2]);
    }
}
