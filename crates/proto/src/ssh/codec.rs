//! Packet encoder and decoder.
//!
//! [`PacketEncoder`] and [`PacketDecoder`] are the two directions of the wire
//! codec. Each owns its sequence counter and the active cipher, MAC and
//! compression for its direction. New keys are swapped in with `install` at
//! NEWKEYS; the decoder refuses the swap while a packet is half read.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use rand::{rngs::StdRng, SeedableRng};
//! use strand_proto::ssh::codec::{PacketDecoder, PacketEncoder};
//!
//! let mut rng = StdRng::seed_from_u64(1);
//! let mut encoder = PacketEncoder::new(35000);
//! let mut decoder = PacketDecoder::new(35000);
//!
//! let mut wire = BytesMut::new();
//! encoder.encode(&[2, 0, 0, 0, 0], &mut rng, &mut wire).unwrap();
//! decoder.feed(&wire);
//!
//! let packet = decoder.decode().unwrap().unwrap();
//! assert_eq!(packet.payload(), &[2, 0, 0, 0, 0]);
//! assert_eq!(packet.sequence_number(), 0);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use strand_platform::{StrandError, StrandResult};
use tracing::{debug, trace};

use super::compression::{Compressor, Decompressor};
use super::crypto::{MacKey, OpeningCipher, Plaintext, SealingCipher};
use super::packet::{padding_length, Packet, MAX_PADDING_LEN, MIN_PADDING_LEN};

/// Algorithms for the outbound direction, ready to install.
pub struct SealingSuite {
    /// Cipher
    pub cipher: Box<dyn SealingCipher>,
    /// MAC; ignored when the cipher is an AEAD
    pub mac: Option<MacKey>,
    /// Compression stream
    pub compressor: Compressor,
}

/// Algorithms for the inbound direction, ready to install.
pub struct OpeningSuite {
    /// Cipher
    pub cipher: Box<dyn OpeningCipher>,
    /// MAC; ignored when the cipher is an AEAD
    pub mac: Option<MacKey>,
    /// Decompression stream
    pub decompressor: Decompressor,
}

/// Outbound half of the wire codec.
pub struct PacketEncoder {
    sequence_number: u32,
    cipher: Box<dyn SealingCipher>,
    mac: Option<MacKey>,
    compressor: Compressor,
    max_packet_size: usize,
    total_bytes: u64,
}

impl std::fmt::Debug for PacketEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEncoder")
            .field("sequence_number", &self.sequence_number)
            .field("cipher", &self.cipher.algorithm())
            .field("mac", &self.mac)
            .field("compressor", &self.compressor)
            .finish()
    }
}

impl PacketEncoder {
    /// Creates an encoder with no encryption, MAC or compression.
    /// `max_packet_size` bounds the `packet_length` of what we write.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            sequence_number: 0,
            cipher: Box::new(Plaintext),
            mac: None,
            compressor: Compressor::default(),
            max_packet_size,
            total_bytes: 0,
        }
    }

    /// Switches to freshly derived algorithms. The sequence number carries on.
    pub fn install(&mut self, suite: SealingSuite) {
        let aead = suite.cipher.tag_len() > 0;
        debug!(
            cipher = suite.cipher.algorithm().name(),
            mac = suite.mac.as_ref().filter(|_| !aead).map(|m| m.algorithm().name()),
            compression = suite.compressor.algorithm().name(),
            seq = self.sequence_number,
            "installing outbound keys"
        );
        self.cipher = suite.cipher;
        self.mac = if aead { None } else { suite.mac };
        self.compressor = suite.compressor;
    }

    /// Starts delayed compression.
    pub fn activate_compression(&mut self) {
        self.compressor.activate();
    }

    /// Sequence number the next packet will carry.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Total bytes written since creation.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Frames, compresses, pads, authenticates and encrypts one payload,
    /// appending the wire bytes to `out`.
    ///
    /// Returns the number of bytes appended.
    pub fn encode(
        &mut self,
        payload: &[u8],
        rng: &mut dyn RngCore,
        out: &mut BytesMut,
    ) -> StrandResult<usize> {
        let compressed = self.compressor.compress(payload)?;
        let body = compressed.as_deref().unwrap_or(payload);

        let tag_len = self.cipher.tag_len();
        let aligned = if tag_len > 0 { 1 + body.len() } else { 5 + body.len() };
        let padding = padding_length(aligned, self.cipher.block_size());
        let length = 1 + body.len() + padding;
        if length > self.max_packet_size {
            return Err(StrandError::ResourceExhausted(format!(
                "Outbound packet of {} bytes exceeds maximum {}",
                length, self.max_packet_size
            )));
        }

        let seq = self.sequence_number;
        let start = out.len();
        let mac_len = self.mac.as_ref().map_or(0, MacKey::len);
        out.reserve(4 + length + tag_len + mac_len);
        out.put_u32(length as u32);
        out.put_u8(padding as u8);
        out.put_slice(body);
        let mut random = [0u8; MAX_PADDING_LEN as usize];
        rng.fill_bytes(&mut random[..padding]);
        out.put_slice(&random[..padding]);

        let mac = self.mac.as_ref().map(|m| m.compute(seq, &out[start..]));
        out.put_bytes(0, tag_len);
        self.cipher.seal(seq, &mut out[start..])?;
        if let Some(mac) = mac {
            out.put_slice(&mac);
        }

        let written = out.len() - start;
        self.sequence_number = seq.wrapping_add(1);
        self.total_bytes += written as u64;
        trace!(seq, len = written, msg = payload.first().copied(), "encoded packet");
        Ok(written)
    }
}

/// Inbound half of the wire codec.
///
/// Bytes are fed as they arrive; [`decode`](Self::decode) yields at most one
/// packet per call and remembers the decrypted length of a partial packet.
pub struct PacketDecoder {
    sequence_number: u32,
    cipher: Box<dyn OpeningCipher>,
    mac: Option<MacKey>,
    decompressor: Decompressor,
    max_packet_size: usize,
    buffer: BytesMut,
    pending_length: Option<usize>,
    total_bytes: u64,
}

impl std::fmt::Debug for PacketDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDecoder")
            .field("sequence_number", &self.sequence_number)
            .field("cipher", &self.cipher.algorithm())
            .field("mac", &self.mac)
            .field("buffered", &self.buffer.len())
            .field("pending_length", &self.pending_length)
            .finish()
    }
}

impl PacketDecoder {
    /// Creates a decoder with no encryption, MAC or compression.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            sequence_number: 0,
            cipher: Box::new(Plaintext),
            mac: None,
            decompressor: Decompressor::default(),
            max_packet_size,
            buffer: BytesMut::new(),
            pending_length: None,
            total_bytes: 0,
        }
    }

    /// Switches to freshly derived algorithms.
    ///
    /// # Errors
    ///
    /// Fails if part of the next packet has already been decrypted under the
    /// old keys.
    pub fn install(&mut self, suite: OpeningSuite) -> StrandResult<()> {
        if self.pending_length.is_some() {
            return Err(StrandError::malformed(
                "Key change while a packet is partially decoded",
            ));
        }
        let aead = suite.cipher.tag_len() > 0;
        debug!(
            cipher = suite.cipher.algorithm().name(),
            mac = suite.mac.as_ref().filter(|_| !aead).map(|m| m.algorithm().name()),
            compression = suite.decompressor.algorithm().name(),
            seq = self.sequence_number,
            "installing inbound keys"
        );
        self.cipher = suite.cipher;
        self.mac = if aead { None } else { suite.mac };
        self.decompressor = suite.decompressor;
        Ok(())
    }

    /// Starts delayed compression.
    pub fn activate_compression(&mut self) {
        self.decompressor.activate();
    }

    /// Sequence number the next packet is expected under.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Total wire bytes of fully decoded packets.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Appends received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Raw receive buffer, used by the version exchange before packets start.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn check_length(&self, length: usize) -> StrandResult<()> {
        if length > self.max_packet_size {
            return Err(StrandError::malformed(format!(
                "Packet too large: {} bytes (max {})",
                length, self.max_packet_size
            )));
        }
        if length < 1 + MIN_PADDING_LEN as usize {
            return Err(StrandError::malformed(format!(
                "Packet too small: {} bytes",
                length
            )));
        }
        let block = self.cipher.block_size();
        let aligned = if self.cipher.tag_len() > 0 { length } else { length + 4 };
        if aligned % block != 0 {
            return Err(StrandError::malformed(format!(
                "Packet length {} not aligned to block size {}",
                length, block
            )));
        }
        Ok(())
    }

    /// Decodes the next packet if it has fully arrived.
    ///
    /// # Errors
    ///
    /// - oversized, undersized or misaligned length (checked as soon as the
    ///   length is known, before waiting for the rest of the packet)
    /// - MAC or AEAD tag mismatch (`MAC_ERROR`)
    /// - padding length below 4 or leaving no room for the payload
    /// - decompression failure (`COMPRESSION_ERROR`)
    pub fn decode(&mut self) -> StrandResult<Option<Packet>> {
        let length = match self.pending_length {
            Some(length) => length,
            None => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                let first = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
                let length = self.cipher.packet_length(self.sequence_number, first) as usize;
                self.check_length(length)?;
                self.pending_length = Some(length);
                length
            }
        };

        let aead_tag = self.cipher.tag_len();
        let mac_len = self.mac.as_ref().map_or(0, MacKey::len);
        let total = 4 + length + aead_tag + mac_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let seq = self.sequence_number;
        let mut raw = self.buffer.split_to(total);
        self.pending_length = None;

        self.cipher.open(seq, &mut raw[..4 + length + aead_tag])?;
        raw[..4].copy_from_slice(&(length as u32).to_be_bytes());
        if let Some(mac) = &self.mac {
            let (packet, tag) = raw.split_at(4 + length);
            mac.verify(seq, packet, tag)?;
        }

        let padding = raw[4] as usize;
        if padding < MIN_PADDING_LEN as usize || padding >= length {
            return Err(StrandError::malformed(format!(
                "Invalid padding length {} for packet length {}",
                padding, length
            )));
        }
        let end = 4 + length - padding;

        let inflated = self.decompressor.decompress(&raw[5..end])?;
        let payload = match inflated {
            Some(data) => Bytes::from(data),
            None => raw.freeze().slice(5..end),
        };

        self.sequence_number = seq.wrapping_add(1);
        self.total_bytes += total as u64;
        trace!(seq, len = total, msg = payload.first().copied(), "decoded packet");
        Ok(Some(Packet::new(seq, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::compression::CompressionAlgorithm;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use strand_platform::DisconnectReason;

    fn suites(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        compression: CompressionAlgorithm,
    ) -> (SealingSuite, OpeningSuite) {
        let key = [0x11u8; 64];
        let iv = [0x22u8; 16];
        let mac_key = [0x33u8; 64];
        let seal = SealingSuite {
            cipher: cipher.sealing(&key, &iv).unwrap(),
            mac: mac.map(|m| MacKey::new(m, &mac_key).unwrap()),
            compressor: compression.compressor(false),
        };
        let open = OpeningSuite {
            cipher: cipher.opening(&key, &iv).unwrap(),
            mac: mac.map(|m| MacKey::new(m, &mac_key).unwrap()),
            decompressor: compression.decompressor(false),
        };
        (seal, open)
    }

    fn pair(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        compression: CompressionAlgorithm,
    ) -> (PacketEncoder, PacketDecoder) {
        let (seal, open) = suites(cipher, mac, compression);
        let mut encoder = PacketEncoder::new(35000);
        let mut decoder = PacketDecoder::new(35000);
        encoder.install(seal);
        decoder.install(open).unwrap();
        (encoder, decoder)
    }

    fn expect_reason(result: StrandResult<Option<Packet>>, expected: DisconnectReason) {
        match result {
            Err(StrandError::Protocol { reason, .. }) => assert_eq!(reason, expected),
            other => panic!("Expected {:?}, got {:?}", expected, other),
        }
    }

    #[test]
    fn test_round_trip_every_suite() {
        let mut rng = StdRng::seed_from_u64(42);
        let cases = [
            (CipherAlgorithm::None, None),
            (CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256)),
            (CipherAlgorithm::Aes256Ctr, Some(MacAlgorithm::HmacSha512)),
            (CipherAlgorithm::Aes256Ctr, Some(MacAlgorithm::HmacSha1)),
            (CipherAlgorithm::Aes128Gcm, None),
            (CipherAlgorithm::Aes256Gcm, Some(MacAlgorithm::HmacSha256)),
            (CipherAlgorithm::ChaCha20Poly1305, None),
        ];
        for (cipher, mac) in cases {
            let (mut encoder, mut decoder) = pair(cipher, mac, CompressionAlgorithm::Zlib);
            let payloads: Vec<Vec<u8>> = vec![
                vec![94, 0, 0, 0, 0, 0, 0, 0, 3, b'a', b'b', b'c'],
                vec![2; 1],
                (0..5000u32).map(|i| (i % 251) as u8).collect(),
            ];
            let mut wire = BytesMut::new();
            for payload in &payloads {
                encoder.encode(payload, &mut rng, &mut wire).unwrap();
            }
            decoder.feed(&wire);
            for (i, payload) in payloads.iter().enumerate() {
                let packet = decoder.decode().unwrap().unwrap();
                assert_eq!(packet.payload(), &payload[..], "cipher {}", cipher.name());
                assert_eq!(packet.sequence_number(), i as u32);
            }
            assert!(decoder.decode().unwrap().is_none());
            assert_eq!(decoder.total_bytes(), encoder.total_bytes());
        }
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let mut rng = StdRng::seed_from_u64(5);
        let (mut encoder, mut decoder) = pair(
            CipherAlgorithm::Aes128Ctr,
            Some(MacAlgorithm::HmacSha256),
            CompressionAlgorithm::None,
        );
        let mut wire = BytesMut::new();
        encoder.encode(b"\x05hello", &mut rng, &mut wire).unwrap();

        let (last, head) = wire.split_last().unwrap();
        for byte in head {
            decoder.feed(&[*byte]);
            assert!(decoder.decode().unwrap().is_none());
        }
        decoder.feed(&[*last]);
        assert_eq!(decoder.decode().unwrap().unwrap().payload(), b"\x05hello");
    }

    #[test]
    fn test_sequence_numbers_monotonic() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut encoder = PacketEncoder::new(35000);
        let mut decoder = PacketDecoder::new(35000);
        for i in 0..10u32 {
            let mut wire = BytesMut::new();
            assert_eq!(encoder.sequence_number(), i);
            encoder.encode(&[2, 0, 0, 0, 0], &mut rng, &mut wire).unwrap();
            decoder.feed(&wire);
            assert_eq!(decoder.decode().unwrap().unwrap().sequence_number(), i);
        }
        assert_eq!(decoder.sequence_number(), 10);
    }

    #[test]
    fn test_replayed_packet_fails_mac() {
        let mut rng = StdRng::seed_from_u64(3);
        let (mut encoder, mut decoder) = pair(
            CipherAlgorithm::None,
            Some(MacAlgorithm::HmacSha256),
            CompressionAlgorithm::None,
        );
        let mut wire = BytesMut::new();
        encoder.encode(&[2, 0, 0, 0, 0], &mut rng, &mut wire).unwrap();

        decoder.feed(&wire);
        assert!(decoder.decode().unwrap().is_some());
        decoder.feed(&wire);
        expect_reason(decoder.decode(), DisconnectReason::MacError);
    }

    #[test]
    fn test_tampered_payload_fails_mac() {
        let mut rng = StdRng::seed_from_u64(4);
        let (mut encoder, mut decoder) = pair(
            CipherAlgorithm::Aes256Ctr,
            Some(MacAlgorithm::HmacSha512),
            CompressionAlgorithm::None,
        );
        let mut wire = BytesMut::new();
        encoder.encode(b"\x5eimportant data", &mut rng, &mut wire).unwrap();
        wire[8] ^= 0x40;
        decoder.feed(&wire);
        expect_reason(decoder.decode(), DisconnectReason::MacError);
    }

    #[test]
    fn test_oversized_length_rejected_before_body() {
        let (_, mut decoder) = pair(
            CipherAlgorithm::None,
            Some(MacAlgorithm::HmacSha256),
            CompressionAlgorithm::Zlib,
        );
        // Only the length has arrived: the rejection cannot depend on the
        // MAC or the decompressor.
        decoder.feed(&0x0010_0000u32.to_be_bytes());
        match decoder.decode() {
            Err(StrandError::Protocol { reason, message }) => {
                assert_eq!(reason, DisconnectReason::ProtocolError);
                assert!(message.contains("too large"));
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_padding_rejected() {
        let mut decoder = PacketDecoder::new(35000);
        // length 12, padding 2
        let mut wire = vec![0, 0, 0, 12, 2];
        wire.extend_from_slice(&[20; 11]);
        decoder.feed(&wire);
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn test_padding_beyond_one_block_accepted() {
        let mut decoder = PacketDecoder::new(35000);
        // length 28: 7 payload bytes, 20 padding bytes
        let mut wire = vec![0, 0, 0, 28, 20];
        wire.extend_from_slice(&[2, 1, 2, 3, 4, 5, 6]);
        wire.extend_from_slice(&[0xee; 20]);
        decoder.feed(&wire);
        let packet = decoder.decode().unwrap().unwrap();
        assert_eq!(packet.payload(), &[2, 1, 2, 3, 4, 5, 6][..]);
    }

    #[test]
    fn test_misaligned_length_rejected() {
        let mut decoder = PacketDecoder::new(35000);
        decoder.feed(&[0, 0, 0, 13]);
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn test_install_refused_mid_packet() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut encoder = PacketEncoder::new(35000);
        let mut decoder = PacketDecoder::new(35000);
        let mut wire = BytesMut::new();
        encoder.encode(&[21], &mut rng, &mut wire).unwrap();
        decoder.feed(&wire[..6]);
        assert!(decoder.decode().unwrap().is_none());

        let (_, open) = suites(CipherAlgorithm::Aes128Gcm, None, CompressionAlgorithm::None);
        assert!(decoder.install(open).is_err());
    }

    #[test]
    fn test_keys_switch_between_packets() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut encoder = PacketEncoder::new(35000);
        let mut decoder = PacketDecoder::new(35000);

        let mut wire = BytesMut::new();
        encoder.encode(&[21], &mut rng, &mut wire).unwrap();
        let (seal, open) = suites(
            CipherAlgorithm::ChaCha20Poly1305,
            None,
            CompressionAlgorithm::None,
        );
        encoder.install(seal);
        encoder.encode(&[2, 0, 0, 0, 1, 7], &mut rng, &mut wire).unwrap();

        // Both packets arrive in one read; the second must wait for install.
        decoder.feed(&wire);
        assert_eq!(decoder.decode().unwrap().unwrap().message_type(), Some(21));
        decoder.install(open).unwrap();
        let second = decoder.decode().unwrap().unwrap();
        assert_eq!(second.payload(), &[2, 0, 0, 0, 1, 7]);
        assert_eq!(second.sequence_number(), 1);
    }

    #[test]
    fn test_encoder_rejects_oversized_payload() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut encoder = PacketEncoder::new(1024);
        let mut wire = BytesMut::new();
        let result = encoder.encode(&vec![94; 2048], &mut rng, &mut wire);
        assert!(matches!(result, Err(StrandError::ResourceExhausted(_))));
        assert!(wire.is_empty());
    }
}
