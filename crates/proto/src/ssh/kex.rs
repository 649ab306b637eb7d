//! SSH key exchange (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - Algorithm negotiation (first client entry the server also lists)
//! - [`KeyExchange`], the per-connection state machine that runs the
//!   exchange, signs or verifies the exchange hash, derives keys, and hands
//!   the resulting codec suites to the connection
//!
//! # Key Exchange Flow
//!
//! ```text
//! Init ──send/recv KEXINIT──▶ InProgress ──we send NEWKEYS──▶ NewKeysPending
//!   ▲                          │    ▲                               │
//!   │              wrong guess ▼    │ one packet dropped            │
//!   │                         Ignore                                │
//!   └──────────────────────────recv NEWKEYS─────────────────────────┘
//! ```
//!
//! Outbound keys switch right after our NEWKEYS is encoded; inbound keys
//! switch when the peer's NEWKEYS is decoded. The session identifier is the
//! exchange hash of the first exchange and never changes afterwards.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::kex::{negotiate, KexInit, NewKeys};
//!
//! let client = KexInit::builder()
//!     .kex(&["curve25519-sha256", "diffie-hellman-group14-sha256"])
//!     .build([0u8; 16]);
//! let server = KexInit::builder()
//!     .kex(&["diffie-hellman-group14-sha256"])
//!     .build([1u8; 16]);
//!
//! let negotiated = negotiate(&client, &server).unwrap();
//! assert_eq!(negotiated.kex.name(), "diffie-hellman-group14-sha256");
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::codec::{OpeningSuite, SealingSuite};
use super::compression::CompressionAlgorithm;
use super::crypto::{CipherAlgorithm, MacAlgorithm, MacKey};
use super::hostkey::{verify_host_signature, HostKey, HostKeyAlgorithm, HostKeyVerifier};
use super::kex_dh::{
    derive_key, dh_exchange_hash, ecdh_exchange_hash, Curve25519Exchange, DhGroup14Exchange,
    HashInputs,
};
use super::message::MessageType;
use super::transport::{Role, TransportConfig};
use super::wire::{put_mpint, put_name_list, put_string, Reader};

fn kex_failed(message: impl Into<String>) -> StrandError {
    StrandError::protocol(DisconnectReason::KeyExchangeFailed, message)
}

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org, the pre-standard name
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
}

impl KexMethod {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::Curve25519Sha256 => "curve25519-sha256",
            KexMethod::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexMethod::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Parses from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" => Some(KexMethod::Curve25519Sha256),
            "curve25519-sha256@libssh.org" => Some(KexMethod::Curve25519Sha256Libssh),
            "diffie-hellman-group14-sha256" => Some(KexMethod::DhGroup14Sha256),
            _ => None,
        }
    }

    fn is_ecdh(&self) -> bool {
        !matches!(self, KexMethod::DhGroup14Sha256)
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

/// Builder for [`KexInit`]; unspecified lists start empty except
/// compression, which defaults to `none`.
#[derive(Debug, Clone, Default)]
pub struct KexInitBuilder {
    kex: Vec<String>,
    host_key: Vec<String>,
    cipher: Vec<String>,
    mac: Vec<String>,
    compression: Vec<String>,
    first_kex_packet_follows: bool,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl KexInitBuilder {
    /// Key exchange methods.
    pub fn kex(mut self, list: &[&str]) -> Self {
        self.kex = owned(list);
        self
    }

    /// Host key algorithms.
    pub fn host_key(mut self, list: &[&str]) -> Self {
        self.host_key = owned(list);
        self
    }

    /// Ciphers for both directions.
    pub fn cipher(mut self, list: &[&str]) -> Self {
        self.cipher = owned(list);
        self
    }

    /// MACs for both directions.
    pub fn mac(mut self, list: &[&str]) -> Self {
        self.mac = owned(list);
        self
    }

    /// Compression for both directions.
    pub fn compression(mut self, list: &[&str]) -> Self {
        self.compression = owned(list);
        self
    }

    /// Announces that a guessed kex packet follows.
    pub fn first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Finishes the message with the given cookie.
    pub fn build(self, cookie: [u8; 16]) -> KexInit {
        let compression = if self.compression.is_empty() {
            vec!["none".to_string()]
        } else {
            self.compression
        };
        KexInit {
            cookie,
            kex_algorithms: self.kex,
            server_host_key_algorithms: self.host_key,
            encryption_algorithms_client_to_server: self.cipher.clone(),
            encryption_algorithms_server_to_client: self.cipher,
            mac_algorithms_client_to_server: self.mac.clone(),
            mac_algorithms_server_to_client: self.mac,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: self.first_kex_packet_follows,
        }
    }
}

impl KexInit {
    /// Starts building a KEXINIT by hand.
    pub fn builder() -> KexInitBuilder {
        KexInitBuilder::default()
    }

    /// Builds our KEXINIT from configuration with a random cookie.
    ///
    /// `host_keys` overrides the configured host key list; servers pass the
    /// algorithms of the keys they actually hold.
    pub fn from_config(
        config: &TransportConfig,
        host_keys: Option<&[String]>,
        rng: &mut dyn RngCore,
    ) -> Self {
        let mut cookie = [0u8; 16];
        rng.fill_bytes(&mut cookie);
        Self {
            cookie,
            kex_algorithms: config.kex_algorithms.clone(),
            server_host_key_algorithms: host_keys
                .map(<[String]>::to_vec)
                .unwrap_or_else(|| config.host_key_algorithms.clone()),
            encryption_algorithms_client_to_server: config.cipher_algorithms.clone(),
            encryption_algorithms_server_to_client: config.cipher_algorithms.clone(),
            mac_algorithms_client_to_server: config.mac_algorithms.clone(),
            mac_algorithms_server_to_client: config.mac_algorithms.clone(),
            compression_algorithms_client_to_server: config.compression_algorithms.clone(),
            compression_algorithms_server_to_client: config.compression_algorithms.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        put_name_list(&mut buf, &self.kex_algorithms);
        put_name_list(&mut buf, &self.server_host_key_algorithms);
        put_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        put_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        put_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        put_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        put_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        put_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        put_name_list(&mut buf, &self.languages_client_to_server);
        put_name_list(&mut buf, &self.languages_server_to_client);
        buf.put_u8(u8::from(self.first_kex_packet_follows));
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the message is truncated, has the wrong
    /// type byte, or a name-list is not valid UTF-8.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(data, MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_algorithms_client_to_server = r.read_name_list()?;
        let encryption_algorithms_server_to_client = r.read_name_list()?;
        let mac_algorithms_client_to_server = r.read_name_list()?;
        let mac_algorithms_server_to_client = r.read_name_list()?;
        let compression_algorithms_client_to_server = r.read_name_list()?;
        let compression_algorithms_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// The packet sequence number is NOT reset when keys change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        Reader::for_message(data, MessageType::NewKeys as u8, "SSH_MSG_NEWKEYS")?;
        Ok(Self)
    }
}

/// Picks the first entry of `client_list` that `server_list` also contains.
///
/// # Errors
///
/// Fails with `KEY_EXCHANGE_FAILED` when the lists share nothing.
///
/// ```rust
/// use strand_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
/// assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    slot: &str,
    client_list: &[String],
    server_list: &[String],
) -> StrandResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            kex_failed(format!(
                "No common {} algorithm: client={:?}, server={:?}",
                slot, client_list, server_list
            ))
        })
}

fn negotiate_known<T>(
    slot: &str,
    client_list: &[String],
    server_list: &[String],
    parse: impl Fn(&str) -> Option<T>,
) -> StrandResult<T> {
    let name = negotiate_algorithm(slot, client_list, server_list)?;
    parse(&name).ok_or_else(|| kex_failed(format!("Unsupported {} algorithm: {}", slot, name)))
}

/// Algorithms agreed for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: KexMethod,
    /// Server host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_s2c: CipherAlgorithm,
    /// MAC client to server; `None` with an AEAD cipher
    pub mac_c2s: Option<MacAlgorithm>,
    /// MAC server to client; `None` with an AEAD cipher
    pub mac_s2c: Option<MacAlgorithm>,
    /// Compression client to server
    pub compression_c2s: CompressionAlgorithm,
    /// Compression server to client
    pub compression_s2c: CompressionAlgorithm,
}

/// Negotiates every slot between a client and a server KEXINIT.
///
/// MACs are only negotiated for directions whose cipher is not an AEAD.
pub fn negotiate(client: &KexInit, server: &KexInit) -> StrandResult<NegotiatedAlgorithms> {
    let kex = negotiate_known(
        "kex",
        &client.kex_algorithms,
        &server.kex_algorithms,
        KexMethod::from_name,
    )?;
    let host_key = negotiate_known(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
        HostKeyAlgorithm::from_name,
    )?;
    let cipher_c2s = negotiate_known(
        "cipher (client to server)",
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
        CipherAlgorithm::from_name,
    )?;
    let cipher_s2c = negotiate_known(
        "cipher (server to client)",
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
        CipherAlgorithm::from_name,
    )?;
    let mac_c2s = if cipher_c2s.is_aead() {
        None
    } else {
        Some(negotiate_known(
            "MAC (client to server)",
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
            MacAlgorithm::from_name,
        )?)
    };
    let mac_s2c = if cipher_s2c.is_aead() {
        None
    } else {
        Some(negotiate_known(
            "MAC (server to client)",
            &client.mac_algorithms_server_to_client,
            &server.mac_algorithms_server_to_client,
            MacAlgorithm::from_name,
        )?)
    };
    let compression_c2s = negotiate_known(
        "compression (client to server)",
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
        CompressionAlgorithm::from_name,
    )?;
    let compression_s2c = negotiate_known(
        "compression (server to client)",
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
        CompressionAlgorithm::from_name,
    )?;

    Ok(NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
    })
}

/// Whether a guessed first kex packet was built for the wrong method
/// (RFC 4253 Section 7: the first kex or host key entries differ).
pub fn guess_is_wrong(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms.first() != server.kex_algorithms.first()
        || client.server_host_key_algorithms.first() != server.server_host_key_algorithms.first()
}

/// Key exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// No exchange running; KEXINIT may be sent or received.
    Init,
    /// The next incoming packet is a wrong guess and is dropped.
    Ignore,
    /// Exchange running; only kex method messages are legal.
    InProgress,
    /// Our NEWKEYS is out; only the peer's NEWKEYS is legal.
    NewKeysPending,
}

impl std::fmt::Display for KexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KexState::Init => "Init",
            KexState::Ignore => "Ignore",
            KexState::InProgress => "InProgress",
            KexState::NewKeysPending => "NewKeysPending",
        };
        f.write_str(name)
    }
}

/// What the connection must do after feeding the engine a message.
#[derive(Default)]
pub struct KexStep {
    /// Payloads to encode immediately, in order.
    pub messages: Vec<Vec<u8>>,
    /// Outbound suite to install once `messages` (ending with NEWKEYS) are
    /// encoded.
    pub outbound: Option<SealingSuite>,
}

impl std::fmt::Debug for KexStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexStep")
            .field("messages", &self.messages.len())
            .field("outbound", &self.outbound.is_some())
            .finish()
    }
}

enum Ephemeral {
    Curve(Curve25519Exchange),
    Dh(DhGroup14Exchange),
}

impl Ephemeral {
    fn generate(method: KexMethod, rng: &mut dyn RngCore) -> StrandResult<Self> {
        Ok(if method.is_ecdh() {
            Ephemeral::Curve(Curve25519Exchange::new()?)
        } else {
            Ephemeral::Dh(DhGroup14Exchange::new(rng))
        })
    }

    fn public_key(&self) -> Vec<u8> {
        match self {
            Ephemeral::Curve(c) => c.public_key().to_vec(),
            Ephemeral::Dh(d) => d.public_key().to_vec(),
        }
    }

    fn agree(self, peer: &[u8]) -> StrandResult<Zeroizing<Vec<u8>>> {
        match self {
            Ephemeral::Curve(c) => c.compute_shared_secret(peer),
            Ephemeral::Dh(d) => d.compute_shared_secret(peer),
        }
    }
}

fn put_public(buf: &mut BytesMut, method: KexMethod, value: &[u8]) {
    if method.is_ecdh() {
        put_string(buf, value);
    } else {
        put_mpint(buf, value);
    }
}

fn read_public<'a>(r: &mut Reader<'a>, method: KexMethod) -> StrandResult<&'a [u8]> {
    if method.is_ecdh() {
        r.read_string()
    } else {
        r.read_mpint()
    }
}

enum Identity {
    Client(Box<dyn HostKeyVerifier>),
    Server(Arc<dyn HostKey>),
}

/// Key exchange state machine for one connection.
pub struct KeyExchange {
    identity: Identity,
    state: KexState,
    local_version: String,
    remote_version: String,
    local_kexinit: Option<(KexInit, Vec<u8>)>,
    remote_kexinit: Option<(KexInit, Vec<u8>)>,
    negotiated: Option<NegotiatedAlgorithms>,
    ephemeral: Option<Ephemeral>,
    pending_inbound: Option<OpeningSuite>,
    session_id: Option<Vec<u8>>,
    completed: u32,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("role", &self.role())
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl KeyExchange {
    /// Engine for a client that trusts host keys through `verifier`.
    pub fn client(local_version: String, verifier: Box<dyn HostKeyVerifier>) -> Self {
        Self::new(Identity::Client(verifier), local_version)
    }

    /// Engine for a server signing with `host_key`.
    pub fn server(local_version: String, host_key: Arc<dyn HostKey>) -> Self {
        Self::new(Identity::Server(host_key), local_version)
    }

    fn new(identity: Identity, local_version: String) -> Self {
        Self {
            identity,
            state: KexState::Init,
            local_version,
            remote_version: String::new(),
            local_kexinit: None,
            remote_kexinit: None,
            negotiated: None,
            ephemeral: None,
            pending_inbound: None,
            session_id: None,
            completed: 0,
        }
    }

    /// Records the peer's identification line once version exchange is done.
    pub fn set_remote_version(&mut self, line: String) {
        self.remote_version = line;
    }

    /// Our role.
    pub fn role(&self) -> Role {
        match self.identity {
            Identity::Client(_) => Role::Client,
            Identity::Server(_) => Role::Server,
        }
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// Session identifier, set by the first exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Algorithms of the most recent negotiation.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Number of exchanges that reached NEWKEYS in both directions.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Whether an exchange is running.
    pub fn in_progress(&self) -> bool {
        self.state != KexState::Init
    }

    /// Whether the peer's KEXINIT for the running exchange has arrived.
    pub fn peer_kexinit_received(&self) -> bool {
        self.remote_kexinit.is_some()
    }

    fn host_key_list(&self) -> Option<Vec<String>> {
        match &self.identity {
            Identity::Server(key) => Some(vec![key.algorithm_name().to_string()]),
            Identity::Client(_) => None,
        }
    }

    /// Starts an exchange by producing our KEXINIT.
    ///
    /// # Errors
    ///
    /// Fails if an exchange is already running.
    pub fn start(&mut self, config: &TransportConfig, rng: &mut dyn RngCore) -> StrandResult<Vec<u8>> {
        if self.state != KexState::Init {
            return Err(StrandError::malformed(format!(
                "Cannot start key exchange in state {}",
                self.state
            )));
        }
        let host_keys = self.host_key_list();
        let kexinit = KexInit::from_config(config, host_keys.as_deref(), rng);
        let payload = kexinit.to_bytes();
        info!(role = %self.role(), rekey = self.session_id.is_some(), "sending KEXINIT");
        self.local_kexinit = Some((kexinit, payload.clone()));
        self.remote_kexinit = None;
        self.state = KexState::InProgress;
        Ok(payload)
    }

    /// Handles the peer's KEXINIT.
    ///
    /// In `Init` this is a peer-initiated exchange and our own KEXINIT is
    /// emitted first. In `InProgress` it is the continuation of the exchange
    /// we started; a second one within the same exchange is an error.
    pub fn handle_kexinit(
        &mut self,
        payload: &[u8],
        config: &TransportConfig,
        rng: &mut dyn RngCore,
    ) -> StrandResult<KexStep> {
        let mut step = KexStep::default();
        match self.state {
            KexState::Init => step.messages.push(self.start(config, rng)?),
            KexState::InProgress if self.remote_kexinit.is_none() => {}
            state => {
                return Err(StrandError::malformed(format!(
                    "Unexpected SSH_MSG_KEXINIT in state {}",
                    state
                )))
            }
        }

        let remote = KexInit::from_bytes(payload)?;
        info!(
            role = %self.role(),
            guess = remote.first_kex_packet_follows(),
            "received KEXINIT"
        );
        let (local, _) = self
            .local_kexinit
            .as_ref()
            .ok_or_else(|| StrandError::malformed("KEXINIT received without local KEXINIT"))?;
        let (client, server) = match self.role() {
            Role::Client => (local, &remote),
            Role::Server => (&remote, local),
        };
        let negotiated = negotiate(client, server)?;
        let wrong_guess = remote.first_kex_packet_follows() && guess_is_wrong(client, server);
        info!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher_c2s = negotiated.cipher_c2s.name(),
            cipher_s2c = negotiated.cipher_s2c.name(),
            mac_c2s = negotiated.mac_c2s.map(|m| m.name()),
            mac_s2c = negotiated.mac_s2c.map(|m| m.name()),
            compression_c2s = negotiated.compression_c2s.name(),
            compression_s2c = negotiated.compression_s2c.name(),
            "negotiated algorithms"
        );

        self.negotiated = Some(negotiated);
        self.remote_kexinit = Some((remote, payload.to_vec()));

        if self.role() == Role::Client {
            let ephemeral = Ephemeral::generate(negotiated.kex, rng)?;
            let mut init = BytesMut::new();
            init.put_u8(MessageType::KexdhInit as u8);
            put_public(&mut init, negotiated.kex, &ephemeral.public_key());
            self.ephemeral = Some(ephemeral);
            step.messages.push(init.to_vec());
        }

        if wrong_guess {
            debug!("peer guessed the kex method wrong, dropping its next packet");
            self.state = KexState::Ignore;
        }
        Ok(step)
    }

    /// Consumes the packet dropped in the `Ignore` state.
    pub fn ignore_packet(&mut self, message_type: Option<u8>) {
        if self.state == KexState::Ignore {
            debug!(msg = message_type, "discarded guessed kex packet");
            self.state = KexState::InProgress;
        }
    }

    /// Handles a kex method message (30..=49).
    pub fn handle_method_message(
        &mut self,
        payload: &[u8],
        rng: &mut dyn RngCore,
    ) -> StrandResult<KexStep> {
        let negotiated = match (self.state, self.negotiated, &self.remote_kexinit) {
            (KexState::InProgress, Some(n), Some(_)) => n,
            _ => {
                return Err(StrandError::malformed(format!(
                    "Unexpected kex method message {} in state {}",
                    payload.first().copied().unwrap_or(0),
                    self.state
                )))
            }
        };
        match self.role() {
            Role::Server => self.server_reply(negotiated, payload, rng),
            Role::Client => self.client_finish(negotiated, payload),
        }
    }

    fn hash_inputs<'a>(&'a self, host_key: &'a [u8]) -> StrandResult<HashInputs<'a>> {
        let (local, remote) = match (&self.local_kexinit, &self.remote_kexinit) {
            (Some((_, l)), Some((_, r))) => (l.as_slice(), r.as_slice()),
            _ => return Err(StrandError::malformed("Key exchange without both KEXINITs")),
        };
        Ok(match self.role() {
            Role::Client => HashInputs {
                client_version: &self.local_version,
                server_version: &self.remote_version,
                client_kexinit: local,
                server_kexinit: remote,
                host_key,
            },
            Role::Server => HashInputs {
                client_version: &self.remote_version,
                server_version: &self.local_version,
                client_kexinit: remote,
                server_kexinit: local,
                host_key,
            },
        })
    }

    fn exchange_hash(
        &self,
        method: KexMethod,
        host_key: &[u8],
        client_public: &[u8],
        server_public: &[u8],
        shared: &[u8],
    ) -> StrandResult<Vec<u8>> {
        let inputs = self.hash_inputs(host_key)?;
        Ok(if method.is_ecdh() {
            ecdh_exchange_hash(&inputs, client_public, server_public, shared)
        } else {
            dh_exchange_hash(&inputs, client_public, server_public, shared)
        })
    }

    fn server_reply(
        &mut self,
        negotiated: NegotiatedAlgorithms,
        payload: &[u8],
        rng: &mut dyn RngCore,
    ) -> StrandResult<KexStep> {
        let host_key = match &self.identity {
            Identity::Server(key) => Arc::clone(key),
            Identity::Client(_) => return Err(StrandError::malformed("server reply on client")),
        };
        let mut r = Reader::for_message(payload, MessageType::KexdhInit as u8, "SSH_MSG_KEX_ECDH_INIT")?;
        let client_public = read_public(&mut r, negotiated.kex)?.to_vec();

        let ephemeral = Ephemeral::generate(negotiated.kex, rng)?;
        let server_public = ephemeral.public_key();
        let shared = ephemeral.agree(&client_public)?;

        let key_blob = host_key.public_key_bytes();
        let h = self.exchange_hash(negotiated.kex, &key_blob, &client_public, &server_public, &shared)?;
        let signature = host_key.sign(&h)?;

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::KexdhReply as u8);
        put_string(&mut reply, &key_blob);
        put_public(&mut reply, negotiated.kex, &server_public);
        put_string(&mut reply, &signature);

        let outbound = self.finish(negotiated, &shared, &h)?;
        Ok(KexStep {
            messages: vec![reply.to_vec(), NewKeys::new().to_bytes()],
            outbound: Some(outbound),
        })
    }

    fn client_finish(
        &mut self,
        negotiated: NegotiatedAlgorithms,
        payload: &[u8],
    ) -> StrandResult<KexStep> {
        let mut r =
            Reader::for_message(payload, MessageType::KexdhReply as u8, "SSH_MSG_KEX_ECDH_REPLY")?;
        let key_blob = r.read_string()?;
        let server_public = read_public(&mut r, negotiated.kex)?;
        let signature = r.read_string()?;

        let sig_alg = Reader::new(signature).read_utf8()?;
        if sig_alg != negotiated.host_key.name() {
            return Err(kex_failed(format!(
                "Host signature uses {} but {} was negotiated",
                sig_alg,
                negotiated.host_key.name()
            )));
        }

        if let Identity::Client(verifier) = &mut self.identity {
            if !verifier.verify(negotiated.host_key.name(), key_blob) {
                warn!(host_key = negotiated.host_key.name(), "host key rejected by verifier");
                return Err(StrandError::protocol(
                    DisconnectReason::HostKeyNotVerifiable,
                    "Host key not trusted",
                ));
            }
        }

        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| StrandError::malformed("Kex reply without a pending kex init"))?;
        let client_public = ephemeral.public_key();
        let shared = ephemeral.agree(server_public)?;
        let h = self.exchange_hash(negotiated.kex, key_blob, &client_public, server_public, &shared)?;
        verify_host_signature(key_blob, signature, &h)?;

        let outbound = self.finish(negotiated, &shared, &h)?;
        Ok(KexStep {
            messages: vec![NewKeys::new().to_bytes()],
            outbound: Some(outbound),
        })
    }

    /// Derives both suites, keeps the inbound one for the peer's NEWKEYS and
    /// returns the outbound one. Delayed compression starts inactive in both;
    /// the session turns it on when the suite is installed.
    fn finish(
        &mut self,
        negotiated: NegotiatedAlgorithms,
        shared: &[u8],
        h: &[u8],
    ) -> StrandResult<SealingSuite> {
        let session_id = self.session_id.get_or_insert_with(|| h.to_vec()).clone();
        let keys = DirectionKeys {
            shared,
            h,
            session_id: &session_id,
        };

        let (out_letters, in_letters, out_algs, in_algs) = match self.role() {
            Role::Client => (
                [b'A', b'C', b'E'],
                [b'B', b'D', b'F'],
                negotiated.client_to_server(),
                negotiated.server_to_client(),
            ),
            Role::Server => (
                [b'B', b'D', b'F'],
                [b'A', b'C', b'E'],
                negotiated.server_to_client(),
                negotiated.client_to_server(),
            ),
        };

        let (iv, key, mac) = keys.material(out_letters, out_algs);
        let outbound = SealingSuite {
            cipher: out_algs.0.sealing(&key, &iv)?,
            mac: out_algs.1.map(|m| MacKey::new(m, &mac)).transpose()?,
            compressor: out_algs.2.compressor(false),
        };
        let (iv, key, mac) = keys.material(in_letters, in_algs);
        self.pending_inbound = Some(OpeningSuite {
            cipher: in_algs.0.opening(&key, &iv)?,
            mac: in_algs.1.map(|m| MacKey::new(m, &mac)).transpose()?,
            decompressor: in_algs.2.decompressor(false),
        });

        self.ephemeral = None;
        self.state = KexState::NewKeysPending;
        debug!(role = %self.role(), "sending NEWKEYS");
        Ok(outbound)
    }

    /// Handles the peer's NEWKEYS and returns the inbound suite to install.
    ///
    /// # Errors
    ///
    /// NEWKEYS is only legal in `NewKeysPending`.
    pub fn handle_newkeys(&mut self, payload: &[u8]) -> StrandResult<OpeningSuite> {
        NewKeys::from_bytes(payload)?;
        if self.state != KexState::NewKeysPending {
            return Err(StrandError::malformed(format!(
                "Unexpected SSH_MSG_NEWKEYS in state {}",
                self.state
            )));
        }
        let suite = self
            .pending_inbound
            .take()
            .ok_or_else(|| StrandError::malformed("NEWKEYS without derived keys"))?;
        self.state = KexState::Init;
        self.local_kexinit = None;
        self.remote_kexinit = None;
        self.completed += 1;
        info!(role = %self.role(), exchanges = self.completed, "key exchange complete");
        Ok(suite)
    }
}

type DirectionAlgorithms = (CipherAlgorithm, Option<MacAlgorithm>, CompressionAlgorithm);

impl NegotiatedAlgorithms {
    fn client_to_server(&self) -> DirectionAlgorithms {
        (self.cipher_c2s, self.mac_c2s, self.compression_c2s)
    }

    fn server_to_client(&self) -> DirectionAlgorithms {
        (self.cipher_s2c, self.mac_s2c, self.compression_s2c)
    }
}

struct DirectionKeys<'a> {
    shared: &'a [u8],
    h: &'a [u8],
    session_id: &'a [u8],
}

impl DirectionKeys<'_> {
    fn material(
        &self,
        letters: [u8; 3],
        algs: DirectionAlgorithms,
    ) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
        let (cipher, mac, _) = algs;
        let derive = |letter, len| derive_key(self.shared, self.h, self.session_id, letter, len);
        (
            derive(letters[0], cipher.iv_size()),
            derive(letters[1], cipher.key_size()),
            derive(letters[2], mac.map_or(0, |m| m.key_size())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(list: &[&str]) -> Vec<String> {
        owned(list)
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::from_config(
            &TransportConfig::default(),
            None,
            &mut StdRng::seed_from_u64(1),
        );
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);
        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut bytes = KexInit::builder().kex(&["curve25519-sha256"]).build([0; 16]).to_bytes();
        bytes[0] = 21;
        assert!(matches!(
            KexInit::from_bytes(&bytes),
            Err(StrandError::Protocol { .. })
        ));
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let bytes = KexInit::builder().kex(&["curve25519-sha256"]).build([0; 16]).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(KexInit::from_bytes(&[20, 1, 2]).is_err());
    }

    #[test]
    fn test_negotiate_algorithm_no_match() {
        let result = negotiate_algorithm(
            "cipher",
            &names(&["aes256-ctr"]),
            &names(&["aes128-ctr"]),
        );
        match result {
            Err(StrandError::Protocol { reason, message }) => {
                assert_eq!(reason, DisconnectReason::KeyExchangeFailed);
                assert!(message.contains("No common cipher"));
            }
            other => panic!("Expected KeyExchangeFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiation_literal_lists() {
        // Client: kex [dh14], host [rsa], enc [aes256]; server overlaps.
        let dh14 = "diffie-hellman-group14-sha256";
        let rsa = "rsa-sha2-256";
        let aes256 = "aes256-ctr";
        let client = KexInit::builder()
            .kex(&[dh14])
            .host_key(&[rsa])
            .cipher(&[aes256])
            .mac(&["hmac-sha2-256"])
            .build([1; 16]);
        let server = KexInit::builder()
            .kex(&["curve25519-sha256", dh14])
            .host_key(&["ssh-ed25519", rsa])
            .cipher(&["aes128-ctr", aes256])
            .mac(&["hmac-sha2-512", "hmac-sha2-256"])
            .build([2; 16]);

        let n = negotiate(&client, &server).unwrap();
        assert_eq!(n.kex, KexMethod::DhGroup14Sha256);
        assert_eq!(n.host_key, HostKeyAlgorithm::RsaSha2_256);
        assert_eq!(n.cipher_c2s, CipherAlgorithm::Aes256Ctr);
        assert_eq!(n.cipher_s2c, CipherAlgorithm::Aes256Ctr);
        assert_eq!(n.mac_c2s, Some(MacAlgorithm::HmacSha256));
        assert_eq!(n.compression_c2s, CompressionAlgorithm::None);
    }

    #[test]
    fn test_negotiation_client_preference_wins() {
        let client = KexInit::builder()
            .kex(&["curve25519-sha256", "diffie-hellman-group14-sha256"])
            .host_key(&["ssh-ed25519"])
            .cipher(&["chacha20-poly1305@openssh.com", "aes128-ctr"])
            .mac(&["hmac-sha1"])
            .build([0; 16]);
        let server = KexInit::builder()
            .kex(&["diffie-hellman-group14-sha256", "curve25519-sha256"])
            .host_key(&["ssh-ed25519"])
            .cipher(&["aes128-ctr", "chacha20-poly1305@openssh.com"])
            .mac(&["hmac-sha2-256"])
            .build([0; 16]);

        let n = negotiate(&client, &server).unwrap();
        assert_eq!(n.kex, KexMethod::Curve25519Sha256);
        assert_eq!(n.cipher_c2s, CipherAlgorithm::ChaCha20Poly1305);
        // No common MAC is fine when the cipher is an AEAD.
        assert_eq!(n.mac_c2s, None);
    }

    #[test]
    fn test_negotiation_missing_mac_for_ctr_fails() {
        let client = KexInit::builder()
            .kex(&["curve25519-sha256"])
            .host_key(&["ssh-ed25519"])
            .cipher(&["aes128-ctr"])
            .mac(&["hmac-sha1"])
            .build([0; 16]);
        let server = KexInit::builder()
            .kex(&["curve25519-sha256"])
            .host_key(&["ssh-ed25519"])
            .cipher(&["aes128-ctr"])
            .mac(&["hmac-sha2-256"])
            .build([0; 16]);
        assert!(negotiate(&client, &server).is_err());
    }

    #[test]
    fn test_guess_detection() {
        let a = KexInit::builder()
            .kex(&["curve25519-sha256", "diffie-hellman-group14-sha256"])
            .host_key(&["ssh-ed25519"])
            .build([0; 16]);
        let b = KexInit::builder()
            .kex(&["diffie-hellman-group14-sha256", "curve25519-sha256"])
            .host_key(&["ssh-ed25519"])
            .build([0; 16]);
        assert!(guess_is_wrong(&a, &b));
        assert!(!guess_is_wrong(&a, &a.clone()));
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys::new().to_bytes(), vec![21]);
        assert!(NewKeys::from_bytes(&[21]).is_ok());
        assert!(NewKeys::from_bytes(&[]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }

    fn engines() -> (KeyExchange, KeyExchange) {
        let mut rng = StdRng::seed_from_u64(99);
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate(&mut rng));
        let mut client = KeyExchange::client("SSH-2.0-c".into(), Box::new(AcceptAnyHostKey));
        let mut server = KeyExchange::server("SSH-2.0-s".into(), host_key);
        client.set_remote_version("SSH-2.0-s".into());
        server.set_remote_version("SSH-2.0-c".into());
        (client, server)
    }

    #[test]
    fn test_engine_full_exchange() {
        let config = TransportConfig::default();
        let mut rng = StdRng::seed_from_u64(5);
        let (mut client, mut server) = engines();

        let c_init = client.start(&config, &mut rng).unwrap();
        let s_init = server.start(&config, &mut rng).unwrap();
        assert_eq!(client.state(), KexState::InProgress);

        let c_step = client.handle_kexinit(&s_init, &config, &mut rng).unwrap();
        assert_eq!(c_step.messages.len(), 1);
        assert_eq!(c_step.messages[0][0], 30);
        let s_step = server.handle_kexinit(&c_init, &config, &mut rng).unwrap();
        assert!(s_step.messages.is_empty());

        let s_step = server
            .handle_method_message(&c_step.messages[0], &mut rng)
            .unwrap();
        assert_eq!(s_step.messages.len(), 2);
        assert_eq!(s_step.messages[1], vec![21]);
        assert!(s_step.outbound.is_some());
        assert_eq!(server.state(), KexState::NewKeysPending);

        let c_step = client
            .handle_method_message(&s_step.messages[0], &mut rng)
            .unwrap();
        assert_eq!(c_step.messages, vec![vec![21]]);
        assert_eq!(client.state(), KexState::NewKeysPending);

        client.handle_newkeys(&[21]).unwrap();
        server.handle_newkeys(&[21]).unwrap();
        assert_eq!(client.state(), KexState::Init);
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(client.completed(), 1);
    }

    #[test]
    fn test_session_id_survives_rekey() {
        let config = TransportConfig::default();
        let mut rng = StdRng::seed_from_u64(6);
        let (mut client, mut server) = engines();

        let mut first = None;
        for _ in 0..2 {
            let c_init = client.start(&config, &mut rng).unwrap();
            // The server sees a peer-initiated exchange and answers with its own KEXINIT.
            let s_step = server.handle_kexinit(&c_init, &config, &mut rng).unwrap();
            let c_step = client.handle_kexinit(&s_step.messages[0], &config, &mut rng).unwrap();
            let s_step = server.handle_method_message(&c_step.messages[0], &mut rng).unwrap();
            client.handle_method_message(&s_step.messages[0], &mut rng).unwrap();
            client.handle_newkeys(&[21]).unwrap();
            server.handle_newkeys(&[21]).unwrap();

            let id = client.session_id().unwrap().to_vec();
            assert_eq!(*first.get_or_insert_with(|| id.clone()), id);
        }
        assert_eq!(server.completed(), 2);
    }

    #[test]
    fn test_newkeys_in_init_is_error() {
        let (mut client, _) = engines();
        assert!(client.handle_newkeys(&[21]).is_err());
    }

    #[test]
    fn test_second_kexinit_in_same_exchange_is_error() {
        let config = TransportConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let (mut client, mut server) = engines();
        client.start(&config, &mut rng).unwrap();
        let s_init = server.start(&config, &mut rng).unwrap();

        client.handle_kexinit(&s_init, &config, &mut rng).unwrap();
        assert_eq!(client.state(), KexState::InProgress);
        assert!(client.handle_kexinit(&s_init, &config, &mut rng).is_err());
    }

    #[test]
    fn test_wrong_guess_enters_ignore() {
        let config = TransportConfig::default();
        let mut rng = StdRng::seed_from_u64(8);
        let (_, mut server) = engines();

        let guess = KexInit::builder()
            .kex(&["diffie-hellman-group14-sha256", "curve25519-sha256"])
            .host_key(&["ssh-ed25519"])
            .cipher(&["aes128-ctr"])
            .mac(&["hmac-sha2-256"])
            .first_kex_packet_follows(true)
            .build([3; 16]);
        server.handle_kexinit(&guess.to_bytes(), &config, &mut rng).unwrap();
        assert_eq!(server.state(), KexState::Ignore);
        server.ignore_packet(Some(30));
        assert_eq!(server.state(), KexState::InProgress);
    }

    #[test]
    fn test_untrusted_host_key_rejected() {
        let config = TransportConfig::default();
        let mut rng = StdRng::seed_from_u64(9);
        let (_, mut server) = engines();
        let mut client = KeyExchange::client(
            "SSH-2.0-c".into(),
            Box::new(crate::ssh::hostkey::PinnedHostKey::new(vec![1, 2, 3])),
        );
        client.set_remote_version("SSH-2.0-s".into());
        server.set_remote_version("SSH-2.0-c".into());

        let c_init = client.start(&config, &mut rng).unwrap();
        let s_step = server.handle_kexinit(&c_init, &config, &mut rng).unwrap();
        let c_step = client.handle_kexinit(&s_step.messages[0], &config, &mut rng).unwrap();
        let s_step = server.handle_method_message(&c_step.messages[0], &mut rng).unwrap();
        match client.handle_method_message(&s_step.messages[0], &mut rng) {
            Err(StrandError::Protocol { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::HostKeyNotVerifiable)
            }
            other => panic!("Expected host key rejection, got {:?}", other.map(|_| ())),
        }
    }
}
