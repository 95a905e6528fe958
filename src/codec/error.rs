//! Error types for the frame codec.
//!
//! Every variant except [`CodecError::Io`] is a protocol violation by the
//! peer. The engine never tries to resynchronise after one: the connection
//! is dropped.

use std::{io, str::Utf8Error};

use thiserror::Error;

use crate::frame::Opcode;

/// Errors raised while decoding or interpreting an inbound frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// One of the RSV1-3 bits was set without a negotiated extension.
    #[error("reserved header bits set: {bits:#04x}")]
    ReservedBits {
        /// The offending bits, in header position.
        bits: u8,
    },

    /// A frame arrived with FIN clear.
    #[error("fragmented messages are not supported")]
    Fragmented,

    /// Continuation frames and undefined opcodes are not accepted.
    #[error("unsupported opcode: {0:?}")]
    UnsupportedOpcode(Opcode),

    /// Clients must mask every frame they send.
    #[error("client frame is not masked")]
    Unmasked,

    /// Declared payload exceeds the configured maximum.
    #[error("payload exceeds max length: {size} > {max}")]
    OversizedPayload {
        /// Length declared in the header.
        size: u64,
        /// Maximum accepted payload length.
        max: usize,
    },

    /// Control frames carry at most 125 payload bytes.
    #[error("control frame payload too large: {size} > 125")]
    OversizedControl {
        /// Length declared in the header.
        size: u64,
    },

    /// A 64-bit length with the most significant bit set.
    #[error("invalid 64-bit payload length")]
    InvalidLength,

    /// A text frame whose payload is not UTF-8.
    #[error("text frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] Utf8Error),

    /// Transport failure surfaced through the decoder.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Returns `true` when the peer broke the protocol, as opposed to the
    /// transport failing.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool { !matches!(self, Self::Io(_)) }

    /// Error category used for logging and metrics labels.
    ///
    /// One of `"protocol"` or `"io"`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        if self.is_protocol_violation() {
            "protocol"
        } else {
            "io"
        }
    }
}
