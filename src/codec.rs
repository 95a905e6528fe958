//! Incremental decoder for client-to-server WebSocket frames.
//!
//! [`FrameDecoder`] implements [`tokio_util::codec::Decoder`] over a
//! [`BytesMut`] accumulation buffer. Bytes may arrive in chunks of any size;
//! the decoder waits for a complete header, then for the complete payload,
//! validates the frame, unmasks the payload in place and splits it off the
//! buffer. Bytes belonging to the next frame stay in the buffer.
//!
//! Only single-frame messages are supported. Fragmented frames, reserved
//! bits, reserved opcodes and unmasked frames are rejected with a
//! [`CodecError`]; the caller is expected to terminate the connection.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::{
    byte_order::{read_network_u16, read_network_u64},
    frame::{
        FIN_BIT,
        LEN_16,
        LEN_64,
        LEN_BITS,
        MASK_BIT,
        MAX_CONTROL_PAYLOAD,
        Opcode,
        RSV_BITS,
        apply_mask,
    },
};

pub mod error;

pub use error::CodecError;

/// Default upper bound on the payload of a single inbound frame (16 MiB).
pub const MAX_PAYLOAD_LENGTH: usize = 16 * 1024 * 1024;

const MASK_KEY_LEN: usize = 4;

/// Most the buffer grows ahead of payload bytes actually arriving.
const RESERVE_STEP: usize = 64 * 1024;

/// Payload limits below the control frame maximum are raised to it so Close,
/// Ping and Pong frames are always accepted.
pub(crate) fn clamp_payload_length(value: usize) -> usize { value.max(MAX_CONTROL_PAYLOAD) }

/// A complete, validated and unmasked client frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    opcode: Opcode,
    payload: Bytes,
}

impl InboundFrame {
    /// Opcode of the frame.
    #[must_use]
    pub fn opcode(&self) -> Opcode { self.opcode }

    /// Unmasked payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Split the frame into its opcode and payload.
    #[must_use]
    pub fn into_parts(self) -> (Opcode, Bytes) { (self.opcode, self.payload) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameHeader {
    opcode: Opcode,
    mask: [u8; MASK_KEY_LEN],
    payload_len: usize,
}

#[derive(Clone, Copy, Debug)]
enum DecodeState {
    Head,
    Data(FrameHeader),
}

/// Stateful decoder for masked client frames.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use tokio_util::codec::Decoder;
/// use wsengine::{codec::FrameDecoder, frame::Opcode};
///
/// let mut decoder = FrameDecoder::default();
/// // "Hi" masked with an all-zero key.
/// let mut buf = BytesMut::from(&[0x81, 0x82, 0, 0, 0, 0, b'H', b'i'][..]);
/// let frame = decoder.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(frame.opcode(), Opcode::Text);
/// assert_eq!(&frame.payload()[..], b"Hi");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload_len: usize,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self { Self::new(MAX_PAYLOAD_LENGTH) }
}

impl FrameDecoder {
    /// Create a decoder rejecting payloads larger than `max_payload_len`.
    #[must_use]
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            max_payload_len: clamp_payload_length(max_payload_len),
            state: DecodeState::Head,
        }
    }

    /// Largest payload this decoder accepts.
    #[must_use]
    pub fn max_payload_len(&self) -> usize { self.max_payload_len }

    /// Validate and consume a frame header once all of its bytes are buffered.
    ///
    /// The fixed two bytes are validated as soon as they arrive so that bad
    /// frames are rejected without waiting for the rest of the header.
    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<FrameHeader>, CodecError> {
        let (first, second) = match src.get(..2) {
            Some(&[first, second]) => (first, second),
            _ => return Ok(None),
        };

        if first & RSV_BITS != 0 {
            return Err(CodecError::ReservedBits {
                bits: first & RSV_BITS,
            });
        }
        let opcode = Opcode::from_bits(first);
        if matches!(opcode, Opcode::Continuation | Opcode::Reserved(_)) {
            return Err(CodecError::UnsupportedOpcode(opcode));
        }
        if first & FIN_BIT == 0 {
            return Err(CodecError::Fragmented);
        }
        if second & MASK_BIT == 0 {
            return Err(CodecError::Unmasked);
        }

        let (extended_len, declared) = match second & LEN_BITS {
            LEN_16 => match src.get(2..4) {
                Some(&[hi, lo]) => (2, u64::from(read_network_u16([hi, lo]))),
                _ => return Ok(None),
            },
            LEN_64 => match src.get(2..10).and_then(|s| <[u8; 8]>::try_from(s).ok()) {
                Some(bytes) => (8, read_network_u64(bytes)),
                None => return Ok(None),
            },
            short => (0, u64::from(short)),
        };

        if declared >> 63 != 0 {
            return Err(CodecError::InvalidLength);
        }
        if opcode.is_control() && declared > MAX_CONTROL_PAYLOAD as u64 {
            return Err(CodecError::OversizedControl { size: declared });
        }
        let payload_len = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= self.max_payload_len)
            .ok_or(CodecError::OversizedPayload {
                size: declared,
                max: self.max_payload_len,
            })?;

        let mask_start = 2 + extended_len;
        let header_len = mask_start + MASK_KEY_LEN;
        let Some(mask) = src
            .get(mask_start..header_len)
            .and_then(|s| <[u8; MASK_KEY_LEN]>::try_from(s).ok())
        else {
            return Ok(None);
        };

        src.advance(header_len);
        Ok(Some(FrameHeader {
            opcode,
            mask,
            payload_len,
        }))
    }
}

impl Decoder for FrameDecoder {
    type Item = InboundFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.state {
            DecodeState::Head => match self.decode_head(src)? {
                Some(header) => {
                    self.state = DecodeState::Data(header);
                    header
                }
                None => return Ok(None),
            },
            DecodeState::Data(header) => header,
        };

        if src.len() < header.payload_len {
            src.reserve((header.payload_len - src.len()).min(RESERVE_STEP));
            return Ok(None);
        }

        self.state = DecodeState::Head;
        let mut payload = src.split_to(header.payload_len);
        apply_mask(&mut payload, header.mask);
        Ok(Some(InboundFrame {
            opcode: header.opcode,
            payload: payload.freeze(),
        }))
    }
}
