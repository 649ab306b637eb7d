//! Key exchange methods and key derivation (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - the exchange hash `H` and the `A`..`F` key derivation
//!
//! The DH exponent comes from the connection's injected RNG; shared secrets
//! are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::kex_dh::Curve25519Exchange;
//!
//! let client = Curve25519Exchange::new().unwrap();
//! let server = Curve25519Exchange::new().unwrap();
//!
//! let client_public = *client.public_key();
//! let server_public = *server.public_key();
//! let k1 = client.compute_shared_secret(&server_public).unwrap();
//! let k2 = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(k1, k2);
//! ```

use bytes::BytesMut;
use num_bigint::{BigUint, RandBigInt};
use rand::RngCore;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use zeroize::{Zeroize, Zeroizing};

use super::wire::{mpint_bytes, put_mpint, put_string};

/// Diffie-Hellman Group 14 parameters (RFC 3526).
///
/// This is a 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const PRIME_HEX: &[u8] = b"\
        FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
        29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
        EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
        E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
        EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
        C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
        83655D23DCA3AD961C62F356208552BB9ED529077096966D\
        670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
        E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
        DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
        15728E5A8AACAA68FFFFFFFFFFFFFFFF";

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(PRIME_HEX, 16).expect("Invalid group 14 prime")
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Bits of private exponent. Twice the strength of the group is plenty.
const DH_PRIVATE_BITS: u64 = 512;

fn kex_failed(message: impl Into<String>) -> StrandError {
    StrandError::protocol(DisconnectReason::KeyExchangeFailed, message)
}

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    /// Private key (x)
    private_key: Vec<u8>,
    /// Public key (g^x mod p)
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh key pair.
    pub fn new(rng: &mut dyn RngCore) -> Self {
        let mut x = rng.gen_biguint(DH_PRIVATE_BITS);
        if x < BigUint::from(2u32) {
            x += 2u32;
        }
        let y = dh_group14::G.modpow(&x, &dh_group14::P);
        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value `e` (client) or `f` (server).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// The peer value must satisfy `1 < y < p - 1`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> StrandResult<Zeroizing<Vec<u8>>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = &*dh_group14::P - 1u32;
        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(kex_failed("Invalid peer DH public value: out of range"));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);
        Ok(Zeroizing::new(k.to_bytes_be()))
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for DhGroup14Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroup14Exchange")
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair from the system RNG.
    ///
    /// ring only accepts its own RNG for agreement keys, so the injected
    /// connection RNG is not used here.
    pub fn new() -> StrandResult<Self> {
        let private_key = EphemeralPrivateKey::generate(&X25519, &SystemRandom::new())
            .map_err(|_| StrandError::Security("Failed to generate Curve25519 key".into()))?;
        let public = private_key.compute_public_key().map_err(|_| {
            StrandError::Security("Failed to compute Curve25519 public key".into())
        })?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(public.as_ref());
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Returns the public key `Q_C` / `Q_S`.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> StrandResult<Zeroizing<Vec<u8>>> {
        if peer_public.len() != 32 {
            return Err(kex_failed(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer, |material| {
            Zeroizing::new(material.to_vec())
        })
        .map_err(|_| kex_failed("Curve25519 key agreement failed"))
    }
}

impl std::fmt::Debug for Curve25519Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519Exchange")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Inputs to the exchange hash common to every method.
#[derive(Debug, Clone, Copy)]
pub struct HashInputs<'a> {
    /// Client identification line, without CR LF
    pub client_version: &'a str,
    /// Server identification line, without CR LF
    pub server_version: &'a str,
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// Server host key blob
    pub host_key: &'a [u8],
}

impl HashInputs<'_> {
    fn prefix(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.client_version.as_bytes());
        put_string(&mut buf, self.server_version.as_bytes());
        put_string(&mut buf, self.client_kexinit);
        put_string(&mut buf, self.server_kexinit);
        put_string(&mut buf, self.host_key);
        buf
    }
}

/// Exchange hash for finite-field DH: `e` and `f` are mpints.
pub fn dh_exchange_hash(inputs: &HashInputs<'_>, e: &[u8], f: &[u8], k: &[u8]) -> Vec<u8> {
    let mut buf = inputs.prefix();
    put_mpint(&mut buf, e);
    put_mpint(&mut buf, f);
    put_mpint(&mut buf, k);
    Sha256::digest(&buf).to_vec()
}

/// Exchange hash for ECDH: `Q_C` and `Q_S` are strings.
pub fn ecdh_exchange_hash(inputs: &HashInputs<'_>, q_c: &[u8], q_s: &[u8], k: &[u8]) -> Vec<u8> {
    let mut buf = inputs.prefix();
    put_string(&mut buf, q_c);
    put_string(&mut buf, q_s);
    put_mpint(&mut buf, k);
    Sha256::digest(&buf).to_vec()
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// ```
///
/// `K` is encoded as an mpint.
///
/// ```rust
/// use strand_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let k_mpint = Zeroizing::new(mpint_bytes(shared_secret));
    let mut key = Zeroizing::new(Vec::with_capacity(key_length + 32));

    let mut hasher = Sha256::new();
    hasher.update(&*k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize());

    while key.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(&*k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key[..]);
        key.extend_from_slice(&hasher.finalize());
    }

    key.truncate(key_length);
    key
}
