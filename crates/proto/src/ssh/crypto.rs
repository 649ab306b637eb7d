//! Packet ciphers and MACs.
//!
//! Ciphers sit behind two fixed interfaces, [`SealingCipher`] for the outbound
//! direction and [`OpeningCipher`] for the inbound one, so the packet codec
//! never needs to know which algorithm is active. Supported:
//!
//! - `none` (before the first NEWKEYS)
//! - `aes128-ctr`, `aes256-ctr`: length encrypted, separate MAC
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com`: length in clear as AAD
//! - `chacha20-poly1305@openssh.com`: length encrypted under its own key
//!
//! MACs (`hmac-sha2-256`, `hmac-sha2-512`, `hmac-sha1`) are computed over
//! `sequence_number || unencrypted packet` and compared in constant time.

use aes::{Aes128, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use ring::aead::chacha20_poly1305_openssh as chacha;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

fn mac_error(message: &str) -> StrandError {
    StrandError::protocol(DisconnectReason::MacError, message)
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption
    None,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// ChaCha20-Poly1305 AEAD cipher (OpenSSH construction)
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CipherAlgorithm::None),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::ChaCha20Poly1305 => chacha::KEY_LEN,
        }
    }

    /// Returns the IV/nonce size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
        }
    }

    /// Cipher block size used for padding alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 16,
            CipherAlgorithm::ChaCha20Poly1305 => chacha::TAG_LEN,
            _ => 0,
        }
    }

    /// Returns true if this is an AEAD cipher (no separate MAC).
    pub fn is_aead(&self) -> bool {
        self.tag_size() > 0
    }

    /// Builds the outbound half of this cipher.
    pub fn sealing(&self, key: &[u8], iv: &[u8]) -> StrandResult<Box<dyn SealingCipher>> {
        check_material(*self, key, iv)?;
        Ok(match self {
            CipherAlgorithm::None => Box::new(Plaintext),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                Box::new(AesCtr::new(*self, key, iv)?)
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                Box::new(AesGcm::new(*self, key, iv)?)
            }
            CipherAlgorithm::ChaCha20Poly1305 => Box::new(ChaChaSealer(chacha::SealingKey::new(
                chacha_key(key)?,
            ))),
        })
    }

    /// Builds the inbound half of this cipher.
    pub fn opening(&self, key: &[u8], iv: &[u8]) -> StrandResult<Box<dyn OpeningCipher>> {
        check_material(*self, key, iv)?;
        Ok(match self {
            CipherAlgorithm::None => Box::new(Plaintext),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                Box::new(AesCtr::new(*self, key, iv)?)
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                Box::new(AesGcm::new(*self, key, iv)?)
            }
            CipherAlgorithm::ChaCha20Poly1305 => Box::new(ChaChaOpener(chacha::OpeningKey::new(
                chacha_key(key)?,
            ))),
        })
    }
}

fn check_material(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> StrandResult<()> {
    if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
        return Err(StrandError::Security(format!(
            "Insufficient key material for {}: key {} of {}, iv {} of {}",
            algorithm.name(),
            key.len(),
            algorithm.key_size(),
            iv.len(),
            algorithm.iv_size()
        )));
    }
    Ok(())
}

fn chacha_key(key: &[u8]) -> StrandResult<&[u8; chacha::KEY_LEN]> {
    key.get(..chacha::KEY_LEN)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| StrandError::Security("Invalid ChaCha20-Poly1305 key length".to_string()))
}

/// Outbound cipher interface.
///
/// `packet` is `packet_length || padding_length || payload || padding`
/// followed by `tag_len()` bytes reserved for the tag.
pub trait SealingCipher: Send {
    /// Algorithm implemented by this instance.
    fn algorithm(&self) -> CipherAlgorithm;

    /// Encrypts in place and writes the tag, if any.
    fn seal(&mut self, sequence_number: u32, packet: &mut [u8]) -> StrandResult<()>;

    /// Block size for padding alignment.
    fn block_size(&self) -> usize {
        self.algorithm().block_size()
    }

    /// Tag length appended after the encrypted packet.
    fn tag_len(&self) -> usize {
        self.algorithm().tag_size()
    }
}

/// Inbound cipher interface.
pub trait OpeningCipher: Send {
    /// Algorithm implemented by this instance.
    fn algorithm(&self) -> CipherAlgorithm;

    /// Recovers `packet_length` from the first four bytes on the wire.
    ///
    /// Called exactly once per packet, before the rest has arrived.
    fn packet_length(&mut self, sequence_number: u32, first: [u8; 4]) -> u32;

    /// Decrypts `packet` (length field, body and trailing tag) in place and
    /// authenticates it if the cipher is an AEAD.
    ///
    /// On success the body bytes after the length field hold plaintext.
    fn open(&mut self, sequence_number: u32, packet: &mut [u8]) -> StrandResult<()>;

    /// Block size for alignment checks.
    fn block_size(&self) -> usize {
        self.algorithm().block_size()
    }

    /// Tag length trailing the encrypted packet.
    fn tag_len(&self) -> usize {
        self.algorithm().tag_size()
    }
}

/// The `none` cipher.
#[derive(Debug, Default)]
pub struct Plaintext;

impl SealingCipher for Plaintext {
    fn algorithm(&self) -> CipherAlgorithm {
        CipherAlgorithm::None
    }

    fn seal(&mut self, _sequence_number: u32, _packet: &mut [u8]) -> StrandResult<()> {
        Ok(())
    }
}

impl OpeningCipher for Plaintext {
    fn algorithm(&self) -> CipherAlgorithm {
        CipherAlgorithm::None
    }

    fn packet_length(&mut self, _sequence_number: u32, first: [u8; 4]) -> u32 {
        u32::from_be_bytes(first)
    }

    fn open(&mut self, _sequence_number: u32, _packet: &mut [u8]) -> StrandResult<()> {
        Ok(())
    }
}

enum CtrState {
    A128(Aes128Ctr),
    A256(Aes256Ctr),
}

impl CtrState {
    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrState::A128(c) => c.apply_keystream(data),
            CtrState::A256(c) => c.apply_keystream(data),
        }
    }
}

/// AES in counter mode. The keystream runs continuously across packets.
pub struct AesCtr {
    algorithm: CipherAlgorithm,
    state: CtrState,
}

impl AesCtr {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> StrandResult<Self> {
        let bad = |_| StrandError::Security(format!("Invalid {} key or IV", algorithm.name()));
        let state = match algorithm {
            CipherAlgorithm::Aes128Ctr => {
                CtrState::A128(Aes128Ctr::new_from_slices(&key[..16], &iv[..16]).map_err(bad)?)
            }
            _ => CtrState::A256(Aes256Ctr::new_from_slices(&key[..32], &iv[..16]).map_err(bad)?),
        };
        Ok(Self { algorithm, state })
    }
}

impl std::fmt::Debug for AesCtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtr")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SealingCipher for AesCtr {
    fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    fn seal(&mut self, _sequence_number: u32, packet: &mut [u8]) -> StrandResult<()> {
        self.state.apply(packet);
        Ok(())
    }
}

impl OpeningCipher for AesCtr {
    fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    fn packet_length(&mut self, _sequence_number: u32, mut first: [u8; 4]) -> u32 {
        self.state.apply(&mut first);
        u32::from_be_bytes(first)
    }

    fn open(&mut self, _sequence_number: u32, packet: &mut [u8]) -> StrandResult<()> {
        // The length field was already run through the keystream.
        if packet.len() > 4 {
            self.state.apply(&mut packet[4..]);
        }
        Ok(())
    }
}

/// AES-GCM per RFC 5647: the length travels in clear as associated data and
/// the invocation counter in the nonce increments once per packet.
pub struct AesGcm {
    algorithm: CipherAlgorithm,
    key: LessSafeKey,
    nonce: [u8; 12],
}

impl AesGcm {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> StrandResult<Self> {
        let aead = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            _ => &AES_256_GCM,
        };
        let unbound = UnboundKey::new(aead, &key[..algorithm.key_size()]).map_err(|_| {
            StrandError::Security(format!("Failed to create {} key", algorithm.name()))
        })?;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&iv[..12]);
        Ok(Self {
            algorithm,
            key: LessSafeKey::new(unbound),
            nonce,
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let current = Nonce::assume_unique_for_key(self.nonce);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.nonce[4..]);
        let next = u64::from_be_bytes(counter).wrapping_add(1);
        self.nonce[4..].copy_from_slice(&next.to_be_bytes());
        current
    }
}

impl std::fmt::Debug for AesGcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcm")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SealingCipher for AesGcm {
    fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    fn seal(&mut self, _sequence_number: u32, packet: &mut [u8]) -> StrandResult<()> {
        let nonce = self.next_nonce();
        let tag_start = packet.len() - 16;
        let (body, tag_out) = packet.split_at_mut(tag_start);
        let (length, plaintext) = body.split_at_mut(4);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(&*length), plaintext)
            .map_err(|_| StrandError::Security("AES-GCM encryption failed".to_string()))?;
        tag_out.copy_from_slice(tag.as_ref());
        Ok(())
    }
}

impl OpeningCipher for AesGcm {
    fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    fn packet_length(&mut self, _sequence_number: u32, first: [u8; 4]) -> u32 {
        u32::from_be_bytes(first)
    }

    fn open(&mut self, _sequence_number: u32, packet: &mut [u8]) -> StrandResult<()> {
        let nonce = self.next_nonce();
        let (length, in_out) = packet.split_at_mut(4);
        self.key
            .open_in_place(nonce, Aad::from(&*length), in_out)
            .map_err(|_| mac_error("AES-GCM authentication failed"))?;
        Ok(())
    }
}

struct ChaChaSealer(chacha::SealingKey);

impl SealingCipher for ChaChaSealer {
    fn algorithm(&self) -> CipherAlgorithm {
        CipherAlgorithm::ChaCha20Poly1305
    }

    fn seal(&mut self, sequence_number: u32, packet: &mut [u8]) -> StrandResult<()> {
        let tag_start = packet.len() - chacha::TAG_LEN;
        let (body, tag_out) = packet.split_at_mut(tag_start);
        let tag_out: &mut [u8; chacha::TAG_LEN] = tag_out
            .try_into()
            .map_err(|_| StrandError::Security("Bad ChaCha20-Poly1305 tag slot".to_string()))?;
        self.0.seal_in_place(sequence_number, body, tag_out);
        Ok(())
    }
}

struct ChaChaOpener(chacha::OpeningKey);

impl OpeningCipher for ChaChaOpener {
    fn algorithm(&self) -> CipherAlgorithm {
        CipherAlgorithm::ChaCha20Poly1305
    }

    fn packet_length(&mut self, sequence_number: u32, first: [u8; 4]) -> u32 {
        u32::from_be_bytes(self.0.decrypt_packet_length(sequence_number, first))
    }

    fn open(&mut self, sequence_number: u32, packet: &mut [u8]) -> StrandResult<()> {
        let tag_start = packet.len() - chacha::TAG_LEN;
        let (body, tag) = packet.split_at_mut(tag_start);
        let tag: &[u8; chacha::TAG_LEN] = (&*tag)
            .try_into()
            .map_err(|_| mac_error("Bad ChaCha20-Poly1305 tag"))?;
        self.0
            .open_in_place(sequence_number, body, tag)
            .map_err(|_| mac_error("ChaCha20-Poly1305 authentication failed"))?;
        Ok(())
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum HmacState {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// Keyed MAC for one direction. The packet codec supplies sequence numbers.
pub struct MacKey {
    algorithm: MacAlgorithm,
    state: HmacState,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> StrandResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(StrandError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }
        let key = &key_material[..algorithm.key_size()];
        let bad = |_| StrandError::Security("Invalid HMAC key".to_string());
        let state = match algorithm {
            MacAlgorithm::HmacSha1 => HmacState::Sha1(Hmac::new_from_slice(key).map_err(bad)?),
            MacAlgorithm::HmacSha256 => {
                HmacState::Sha256(Hmac::new_from_slice(key).map_err(bad)?)
            }
            MacAlgorithm::HmacSha512 => {
                HmacState::Sha512(Hmac::new_from_slice(key).map_err(bad)?)
            }
        };
        Ok(Self { algorithm, state })
    }

    /// Computes the MAC of `sequence_number || packet`.
    pub fn compute(&self, sequence_number: u32, packet: &[u8]) -> Vec<u8> {
        fn run<M: Mac + Clone>(mac: &M, seq: u32, packet: &[u8]) -> Vec<u8> {
            let mut mac = mac.clone();
            mac.update(&seq.to_be_bytes());
            mac.update(packet);
            mac.finalize().into_bytes().to_vec()
        }
        match &self.state {
            HmacState::Sha1(m) => run(m, sequence_number, packet),
            HmacState::Sha256(m) => run(m, sequence_number, packet),
            HmacState::Sha512(m) => run(m, sequence_number, packet),
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence_number: u32, packet: &[u8], received: &[u8]) -> StrandResult<()> {
        let computed = self.compute(sequence_number, packet);
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(mac_error("MAC verification failed"))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Length of the tag appended to each packet.
    pub fn len(&self) -> usize {
        self.algorithm.mac_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_tag(body: &[u8], tag_len: usize) -> Vec<u8> {
        let mut packet = (body.len() as u32).to_be_bytes().to_vec();
        packet.extend_from_slice(body);
        packet.resize(4 + body.len() + tag_len, 0);
        packet
    }

    #[test]
    fn test_cipher_algorithm_properties() {
        let chacha = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chacha.name(), "chacha20-poly1305@openssh.com");
        assert_eq!(chacha.key_size(), 64);
        assert_eq!(chacha.tag_size(), 16);
        assert!(chacha.is_aead());

        let aes256_ctr = CipherAlgorithm::Aes256Ctr;
        assert_eq!(aes256_ctr.key_size(), 32);
        assert_eq!(aes256_ctr.block_size(), 16);
        assert!(!aes256_ctr.is_aead());
        assert!(!CipherAlgorithm::None.is_aead());
    }

    #[test]
    fn test_cipher_from_name() {
        for alg in [
            CipherAlgorithm::None,
            CipherAlgorithm::Aes128Ctr,
            CipherAlgorithm::Aes256Ctr,
            CipherAlgorithm::Aes128Gcm,
            CipherAlgorithm::Aes256Gcm,
            CipherAlgorithm::ChaCha20Poly1305,
        ] {
            assert_eq!(CipherAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert!(CipherAlgorithm::from_name("invalid").is_none());
    }

    #[test]
    fn test_insufficient_key_material() {
        assert!(CipherAlgorithm::Aes256Ctr.sealing(&[0u8; 16], &[0u8; 16]).is_err());
        assert!(CipherAlgorithm::Aes128Gcm.opening(&[0u8; 16], &[0u8; 4]).is_err());
    }

    #[test]
    fn test_ctr_length_is_encrypted() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let mut sealer = CipherAlgorithm::Aes256Ctr.sealing(&key, &iv).unwrap();
        let mut opener = CipherAlgorithm::Aes256Ctr.opening(&key, &iv).unwrap();

        let body = b"\x04payload-xxxx";
        let mut packet = packet_with_tag(body, 0);
        sealer.seal(0, &mut packet).unwrap();
        assert_ne!(&packet[..4], &(body.len() as u32).to_be_bytes());

        let first = [packet[0], packet[1], packet[2], packet[3]];
        assert_eq!(opener.packet_length(0, first), body.len() as u32);
        opener.open(0, &mut packet).unwrap();
        assert_eq!(&packet[4..], body);
    }

    #[test]
    fn test_gcm_length_in_clear_and_tamper() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let mut sealer = CipherAlgorithm::Aes128Gcm.sealing(&key, &iv).unwrap();
        let mut opener = CipherAlgorithm::Aes128Gcm.opening(&key, &iv).unwrap();

        let body = [0x04u8; 16];
        let mut packet = packet_with_tag(&body, 16);
        sealer.seal(0, &mut packet).unwrap();
        assert_eq!(&packet[..4], &16u32.to_be_bytes());

        let mut tampered = packet.clone();
        tampered[6] ^= 1;
        let mut other = CipherAlgorithm::Aes128Gcm.opening(&key, &iv).unwrap();
        assert!(other.open(0, &mut tampered).is_err());

        opener.open(0, &mut packet).unwrap();
        assert_eq!(&packet[4..20], &body);
    }

    #[test]
    fn test_chacha_round_trip() {
        let key = [3u8; 64];
        let mut sealer = CipherAlgorithm::ChaCha20Poly1305.sealing(&key, &[]).unwrap();
        let mut opener = CipherAlgorithm::ChaCha20Poly1305.opening(&key, &[]).unwrap();

        let body = [0x05u8; 24];
        let mut packet = packet_with_tag(&body, 16);
        sealer.seal(42, &mut packet).unwrap();

        let first = [packet[0], packet[1], packet[2], packet[3]];
        assert_eq!(opener.packet_length(42, first), 24);
        opener.open(42, &mut packet).unwrap();
        assert_eq!(&packet[4..28], &body);
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha256.mac_size(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.key_size(), 64);
        assert_eq!(MacAlgorithm::HmacSha1.mac_size(), 20);
        assert_eq!(
            MacAlgorithm::from_name("hmac-sha2-512"),
            Some(MacAlgorithm::HmacSha512)
        );
        assert!(MacAlgorithm::from_name("invalid").is_none());
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let mac_key = MacKey::new(MacAlgorithm::HmacSha256, &[0u8; 32]).unwrap();
        let data = b"Hello, SSH!";
        let mac = mac_key.compute(0, data);

        assert!(mac_key.verify(0, data, &mac).is_ok());
        // A stale sequence number must not verify.
        assert!(mac_key.verify(1, data, &mac).is_err());
        assert!(mac_key.verify(0, data, &[0u8; 32]).is_err());
        assert!(mac_key.verify(0, data, &mac[..16]).is_err());
    }

    #[test]
    fn test_mac_insufficient_key() {
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0u8; 32]).is_err());
    }
}
