//! Network byte-order helpers for WebSocket extended payload lengths.
//!
//! Frames carrying more than 125 payload bytes append a 16- or 64-bit
//! big-endian length after the second header byte. These helpers keep the
//! Clippy expectation for big-endian conversions in one place.

/// Encode a 16-bit extended payload length.
///
/// # Examples
///
/// ```
/// use wsengine::byte_order::write_network_u16;
///
/// assert_eq!(write_network_u16(0x0100), [0x01, 0x00]);
/// ```
#[must_use]
pub fn write_network_u16(value: u16) -> [u8; 2] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "WebSocket lengths are transmitted in network byte order."
    )]
    value.to_be_bytes()
}

/// Decode a 16-bit extended payload length.
#[must_use]
pub fn read_network_u16(bytes: [u8; 2]) -> u16 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "WebSocket lengths are transmitted in network byte order."
    )]
    u16::from_be_bytes(bytes)
}

/// Encode a 64-bit extended payload length.
///
/// # Examples
///
/// ```
/// use wsengine::byte_order::write_network_u64;
///
/// assert_eq!(write_network_u64(65_536), [0, 0, 0, 0, 0, 1, 0, 0]);
/// ```
#[must_use]
pub fn write_network_u64(value: u64) -> [u8; 8] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "WebSocket lengths are transmitted in network byte order."
    )]
    value.to_be_bytes()
}

/// Decode a 64-bit extended payload length.
#[must_use]
pub fn read_network_u64(bytes: [u8; 8]) -> u64 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "WebSocket lengths are transmitted in network byte order."
    )]
    u64::from_be_bytes(bytes)
}
