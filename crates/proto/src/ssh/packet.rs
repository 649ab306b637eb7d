//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include `mac` or the length field itself
//! - `padding_length` is at least 4 and leaves room for the padding byte
//! - The padded packet is a multiple of the cipher block size (at least 8).
//!   AEAD ciphers align everything after the length field.
//! - Packets above the configured maximum are rejected as soon as the length
//!   is known, before any MAC check or decompression.
//!
//! The encoder and decoder that apply these rules live in
//! [`codec`](super::codec); this module holds the framing arithmetic and the
//! decoded unit.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::packet::{padding_length, MIN_PADDING_LEN};
//!
//! // 4 (length) + 1 (padding length) + 11 (payload) = 16, already aligned,
//! // so a full extra block is added to reach the minimum padding.
//! assert_eq!(padding_length(16, 8), 8);
//! assert!(padding_length(13, 8) >= MIN_PADDING_LEN as usize);
//! ```

use bytes::Bytes;

/// Default maximum packet size in bytes (RFC 4253 Section 6.1).
///
/// Every implementation must accept packets up to this size.
pub const MAX_PACKET_SIZE: usize = 35000;

/// Smallest legal packet: 5 bytes of header and 4 of padding, rounded up to
/// the minimum block size.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Smallest block size used for alignment, even for stream ciphers.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Computes the padding for `unpadded` bytes that must be aligned to `block`.
///
/// The result is in `[4, 4 + block)`.
pub fn padding_length(unpadded: usize, block: usize) -> usize {
    let block = block.max(MIN_BLOCK_SIZE);
    let mut padding = block - (unpadded % block);
    if padding < MIN_PADDING_LEN as usize {
        padding += block;
    }
    padding
}

/// One decoded packet: the plaintext, decompressed payload and the sequence
/// number it arrived under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    sequence_number: u32,
    payload: Bytes,
}

impl Packet {
    /// Wraps a decoded payload.
    pub fn new(sequence_number: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_number,
            payload: payload.into(),
        }
    }

    /// Sequence number the packet was received under.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Message payload, starting with the message type byte.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// First payload byte, or `None` for an empty payload.
    pub fn message_type(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
