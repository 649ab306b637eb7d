//! Server host keys (RFC 4253 Section 6.6).
//!
//! The server proves its identity by signing the exchange hash with a
//! [`HostKey`]. The client checks that signature with
//! [`verify_host_signature`] and asks an injected [`HostKeyVerifier`] whether
//! the key itself is trusted. Persisting or looking up known keys is the
//! verifier's business.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - signing and verification
//! - `rsa-sha2-256`, `rsa-sha2-512` - verification only
//!
//! # Example
//!
//! ```rust
//! use rand::{rngs::StdRng, SeedableRng};
//! use strand_proto::ssh::hostkey::{verify_host_signature, Ed25519HostKey, HostKey};
//!
//! let mut rng = StdRng::seed_from_u64(7);
//! let hostkey = Ed25519HostKey::generate(&mut rng);
//!
//! let blob = hostkey.public_key_bytes();
//! let signature = hostkey.sign(b"exchange hash").unwrap();
//! verify_host_signature(&blob, &signature, b"exchange hash").unwrap();
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::RngCore;
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512};
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use zeroize::Zeroizing;

use super::wire::{put_string, Reader};

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519
    SshEd25519,
    /// rsa-sha2-256 - RSA signature with SHA-256
    RsaSha2_256,
    /// rsa-sha2-512 - RSA signature with SHA-512
    RsaSha2_512,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as used in SSH protocol
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            _ => None,
        }
    }
}

/// Signing half of a host key, held by the server.
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format (`K_S`)
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Sign data and return the signature blob in SSH wire format
    fn sign(&self, data: &[u8]) -> StrandResult<Vec<u8>>;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new key pair from the given RNG.
    pub fn generate(rng: &mut dyn RngCore) -> Self {
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        rng.fill_bytes(&mut secret[..]);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> StrandResult<Self> {
        let key_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret_bytes
                .try_into()
                .map_err(|_| StrandError::Security("Ed25519 secret key must be 32 bytes".into()))?,
        );
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = bytes::BytesMut::with_capacity(51);
        put_string(&mut buf, b"ssh-ed25519");
        put_string(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> StrandResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = bytes::BytesMut::with_capacity(83);
        put_string(&mut buf, b"ssh-ed25519");
        put_string(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

fn bad_signature(message: impl Into<String>) -> StrandError {
    StrandError::protocol(DisconnectReason::KeyExchangeFailed, message)
}

/// Verifies a server signature blob over `data` with the key in `key_blob`.
///
/// # Errors
///
/// Returns a `KEY_EXCHANGE_FAILED` protocol error when the blobs are
/// malformed, the algorithms do not match, or the signature is wrong.
pub fn verify_host_signature(key_blob: &[u8], signature_blob: &[u8], data: &[u8]) -> StrandResult<()> {
    let mut key = Reader::new(key_blob);
    let key_type = key.read_string()?;
    let mut sig = Reader::new(signature_blob);
    let sig_type = std::str::from_utf8(sig.read_string()?)
        .map_err(|_| bad_signature("Signature algorithm is not UTF-8"))?;
    let signature = sig.read_string()?;

    match (key_type, HostKeyAlgorithm::from_name(sig_type)) {
        (b"ssh-ed25519", Some(HostKeyAlgorithm::SshEd25519)) => {
            let public: [u8; 32] = key
                .read_string()?
                .try_into()
                .map_err(|_| bad_signature("Ed25519 public key must be 32 bytes"))?;
            let signature: [u8; 64] = signature
                .try_into()
                .map_err(|_| bad_signature("Ed25519 signature must be 64 bytes"))?;
            let verifying_key = VerifyingKey::from_bytes(&public)
                .map_err(|e| bad_signature(format!("Invalid Ed25519 public key: {}", e)))?;
            verifying_key
                .verify(data, &Signature::from_bytes(&signature))
                .map_err(|_| bad_signature("Ed25519 host signature does not verify"))
        }
        (b"ssh-rsa", Some(alg @ (HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512))) => {
            let e = strip_zeros(key.read_mpint()?);
            let n = strip_zeros(key.read_mpint()?);
            let params = if alg == HostKeyAlgorithm::RsaSha2_256 {
                &RSA_PKCS1_2048_8192_SHA256
            } else {
                &RSA_PKCS1_2048_8192_SHA512
            };
            RsaPublicKeyComponents { n, e }
                .verify(params, data, signature)
                .map_err(|_| bad_signature(format!("{} host signature does not verify", alg.name())))
        }
        (key_type, _) => Err(bad_signature(format!(
            "Signature type {} does not match host key type {}",
            sig_type,
            String::from_utf8_lossy(key_type)
        ))),
    }
}

fn strip_zeros(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    &value[start..]
}

/// Decides whether a server host key is trusted.
///
/// Called on the client once per key exchange, before the signature is
/// checked.
pub trait HostKeyVerifier: Send {
    /// Returns `true` if `key_blob` may be used for this connection.
    fn verify(&mut self, algorithm: &str, key_blob: &[u8]) -> bool;
}

/// Trusts every host key. Only suitable for tests and loopback setups.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&mut self, _algorithm: &str, _key_blob: &[u8]) -> bool {
        true
    }
}

/// Trusts exactly one host key blob.
#[derive(Debug, Clone)]
pub struct PinnedHostKey {
    blob: Vec<u8>,
}

impl PinnedHostKey {
    /// Pins the given `K_S` blob.
    pub fn new(blob: Vec<u8>) -> Self {
        Self { blob }
    }
}

impl HostKeyVerifier for PinnedHostKey {
    fn verify(&mut self, _algorithm: &str, key_blob: &[u8]) -> bool {
        self.blob == key_blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn key() -> Ed25519HostKey {
        Ed25519HostKey::generate(&mut StdRng::seed_from_u64(1))
    }

    #[test]
    fn test_algorithm_names() {
        for alg in [
            HostKeyAlgorithm::SshEd25519,
            HostKeyAlgorithm::RsaSha2_256,
            HostKeyAlgorithm::RsaSha2_512,
        ] {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert!(HostKeyAlgorithm::from_name("ssh-dss").is_none());
    }

    #[test]
    fn test_ed25519_blob_format() {
        let blob = key().public_key_bytes();
        let mut r = Reader::new(&blob);
        assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");
        assert_eq!(r.read_string().unwrap().len(), 32);
        assert!(r.is_empty());
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let hostkey = key();
        let blob = hostkey.public_key_bytes();
        let signature = hostkey.sign(b"hash").unwrap();
        assert!(verify_host_signature(&blob, &signature, b"hash").is_ok());
        assert!(verify_host_signature(&blob, &signature, b"other").is_err());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let signer = key();
        let other = Ed25519HostKey::generate(&mut StdRng::seed_from_u64(2));
        let signature = signer.sign(b"hash").unwrap();
        assert!(verify_host_signature(&other.public_key_bytes(), &signature, b"hash").is_err());
    }

    #[test]
    fn test_mismatched_algorithms_rejected() {
        let hostkey = key();
        let mut sig = bytes::BytesMut::new();
        put_string(&mut sig, b"rsa-sha2-256");
        put_string(&mut sig, &[0u8; 256]);
        match verify_host_signature(&hostkey.public_key_bytes(), &sig, b"hash") {
            Err(StrandError::Protocol { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::KeyExchangeFailed)
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let original = key();
        let secret = original.signing_key.to_bytes();
        let restored = Ed25519HostKey::from_bytes(&secret).unwrap();
        assert_eq!(restored.public_key_bytes(), original.public_key_bytes());
        assert!(Ed25519HostKey::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_verifiers() {
        let blob = key().public_key_bytes();
        assert!(AcceptAnyHostKey.verify("ssh-ed25519", &blob));

        let mut pinned = PinnedHostKey::new(blob.clone());
        assert!(pinned.verify("ssh-ed25519", &blob));
        assert!(!pinned.verify("ssh-ed25519", b"other"));
    }
}
