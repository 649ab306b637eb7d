//! Transport configuration.
//!
//! [`TransportConfig`] carries everything a [`Connection`](super::Connection)
//! needs to know before the first byte is exchanged: identification string,
//! algorithm preferences, packet and window limits, the rekey threshold and
//! the handshake timeout.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use strand_proto::ssh::transport::TransportConfig;
//!
//! let config = TransportConfig::default()
//!     .with_ciphers(&["aes256-ctr"])
//!     .with_rekey_limit(64 * 1024 * 1024)
//!     .with_handshake_timeout(Duration::from_secs(30));
//! config.validate().unwrap();
//! assert_eq!(config.cipher_algorithms, vec!["aes256-ctr"]);
//! ```

use std::time::Duration;

use strand_platform::{StrandError, StrandResult};

use super::compression::CompressionAlgorithm;
use super::crypto::{CipherAlgorithm, MacAlgorithm};
use super::hostkey::HostKeyAlgorithm;
use super::kex::KexMethod;
use super::packet::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use super::version::Version;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the TCP connection
    Client,
    /// Accepted the TCP connection
    Server,
}

impl Role {
    /// Whether this is the client side.
    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Default rekey threshold: 1 GiB of sent packet bytes.
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default time allowed for version exchange plus the first key exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on concurrently allocated channels.
pub const DEFAULT_MAX_CHANNELS: usize = 1024;

/// Default receive window advertised for new channels.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum data packet advertised for new channels.
pub const DEFAULT_CHANNEL_PACKET: u32 = 32 * 1024;

/// Default OutputQueue coalescing bound.
pub const DEFAULT_OUTPUT_BUFFER: usize = 64 * 1024;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification string.
    pub version: Version,
    /// Key exchange methods, most preferred first.
    pub kex_algorithms: Vec<String>,
    /// Host key algorithms. A server advertises only those it has keys for.
    pub host_key_algorithms: Vec<String>,
    /// Ciphers, used for both directions.
    pub cipher_algorithms: Vec<String>,
    /// MACs, used for both directions.
    pub mac_algorithms: Vec<String>,
    /// Compression methods, used for both directions.
    pub compression_algorithms: Vec<String>,
    /// Largest `packet_length` accepted from the peer.
    pub max_packet_size: usize,
    /// Largest `packet_length` we write. Keep it at the RFC 4253 floor
    /// unless the peer is known to accept more.
    pub max_send_packet_size: usize,
    /// Bytes after which a new key exchange is started.
    pub rekey_bytes_limit: u64,
    /// Whether received bytes count toward the rekey threshold.
    pub rekey_count_received: bool,
    /// Deadline for version exchange plus the first key exchange.
    pub handshake_timeout: Duration,
    /// Maximum number of channels allocated at once.
    pub max_channels: usize,
    /// Receive window advertised for channels we open or accept.
    pub channel_window_size: u32,
    /// Maximum packet advertised for channels we open or accept.
    pub channel_max_packet: u32,
    /// Bound of the OutputQueue coalescing buffer.
    pub output_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_strand(),
            kex_algorithms: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "diffie-hellman-group14-sha256",
            ]),
            host_key_algorithms: names(&["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256"]),
            cipher_algorithms: names(&[
                "chacha20-poly1305@openssh.com",
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes128-ctr",
            ]),
            mac_algorithms: names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"]),
            compression_algorithms: names(&["none", "zlib@openssh.com", "zlib"]),
            max_packet_size: MAX_PACKET_SIZE,
            max_send_packet_size: MAX_PACKET_SIZE,
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_count_received: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_channels: DEFAULT_MAX_CHANNELS,
            channel_window_size: DEFAULT_WINDOW_SIZE,
            channel_max_packet: DEFAULT_CHANNEL_PACKET,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER,
        }
    }
}

impl TransportConfig {
    /// Sets the identification string.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Sets the key exchange preference list.
    pub fn with_kex_algorithms(mut self, list: &[&str]) -> Self {
        self.kex_algorithms = names(list);
        self
    }

    /// Sets the host key algorithm preference list.
    pub fn with_host_key_algorithms(mut self, list: &[&str]) -> Self {
        self.host_key_algorithms = names(list);
        self
    }

    /// Sets the cipher preference list.
    pub fn with_ciphers(mut self, list: &[&str]) -> Self {
        self.cipher_algorithms = names(list);
        self
    }

    /// Sets the MAC preference list.
    pub fn with_macs(mut self, list: &[&str]) -> Self {
        self.mac_algorithms = names(list);
        self
    }

    /// Sets the compression preference list.
    pub fn with_compression(mut self, list: &[&str]) -> Self {
        self.compression_algorithms = names(list);
        self
    }

    /// Sets the largest accepted packet.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Sets the largest packet we write.
    pub fn with_max_send_packet_size(mut self, size: usize) -> Self {
        self.max_send_packet_size = size;
        self
    }

    /// Sets the rekey threshold in bytes.
    pub fn with_rekey_limit(mut self, bytes: u64) -> Self {
        self.rekey_bytes_limit = bytes;
        self
    }

    /// Counts received bytes toward the rekey threshold.
    pub fn with_rekey_count_received(mut self, enabled: bool) -> Self {
        self.rekey_count_received = enabled;
        self
    }

    /// Sets the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the channel table cap.
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    /// Sets the window and packet size advertised for new channels.
    pub fn with_channel_window(mut self, window: u32, max_packet: u32) -> Self {
        self.channel_window_size = window;
        self.channel_max_packet = max_packet;
        self
    }

    /// Sets the OutputQueue coalescing bound.
    pub fn with_output_buffer_size(mut self, size: usize) -> Self {
        self.output_buffer_size = size;
        self
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Config`] for an empty or unknown algorithm list
    /// entry, a packet limit below the protocol minimum, or zero-sized
    /// channel limits.
    pub fn validate(&self) -> StrandResult<()> {
        check_list("kex", &self.kex_algorithms, |n| KexMethod::from_name(n).is_some())?;
        check_list("host key", &self.host_key_algorithms, |n| {
            HostKeyAlgorithm::from_name(n).is_some()
        })?;
        check_list("cipher", &self.cipher_algorithms, |n| {
            CipherAlgorithm::from_name(n).is_some()
        })?;
        check_list("MAC", &self.mac_algorithms, |n| MacAlgorithm::from_name(n).is_some())?;
        check_list("compression", &self.compression_algorithms, |n| {
            CompressionAlgorithm::from_name(n).is_some()
        })?;

        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(StrandError::Config(format!(
                "max_packet_size {} is below the minimum packet size {}",
                self.max_packet_size, MIN_PACKET_SIZE
            )));
        }
        if self.max_send_packet_size < MIN_PACKET_SIZE {
            return Err(StrandError::Config(format!(
                "max_send_packet_size {} is below the minimum packet size {}",
                self.max_send_packet_size, MIN_PACKET_SIZE
            )));
        }
        if self.rekey_bytes_limit == 0 {
            return Err(StrandError::Config("rekey_bytes_limit must be non-zero".into()));
        }
        if self.max_channels == 0 {
            return Err(StrandError::Config("max_channels must be non-zero".into()));
        }
        if self.channel_max_packet == 0 {
            return Err(StrandError::Config("channel_max_packet must be non-zero".into()));
        }
        if self.output_buffer_size == 0 {
            return Err(StrandError::Config("output_buffer_size must be non-zero".into()));
        }
        Ok(())
    }
}

fn check_list(what: &str, list: &[String], known: impl Fn(&str) -> bool) -> StrandResult<()> {
    if list.is_empty() {
        return Err(StrandError::Config(format!("{} algorithm list is empty", what)));
    }
    if let Some(unknown) = list.iter().find(|name| !known(name)) {
        return Err(StrandError::Config(format!(
            "Unsupported {} algorithm: {}",
            what, unknown
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_packet_size, 35000);
        assert_eq!(config.max_send_packet_size, 35000);
        assert_eq!(config.rekey_bytes_limit, 1 << 30);
        assert!(!config.rekey_count_received);
        assert_eq!(config.handshake_timeout, Duration::from_secs(120));
        assert_eq!(config.max_channels, 1024);
    }

    #[test]
    fn test_empty_kex_list_rejected() {
        let config = TransportConfig::default().with_kex_algorithms(&[]);
        assert!(matches!(config.validate(), Err(StrandError::Config(_))));
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let config = TransportConfig::default().with_ciphers(&["3des-cbc"]);
        match config.validate() {
            Err(StrandError::Config(msg)) => assert!(msg.contains("3des-cbc")),
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_tiny_max_packet_rejected() {
        let config = TransportConfig::default().with_max_packet_size(8);
        assert!(config.validate().is_err());
        let config = TransportConfig::default().with_max_send_packet_size(8);
        match config.validate() {
            Err(StrandError::Config(msg)) => assert!(msg.contains("max_send_packet_size")),
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_send_limit_independent_of_receive_limit() {
        let config = TransportConfig::default()
            .with_max_packet_size(256 * 1024)
            .with_max_send_packet_size(MIN_PACKET_SIZE);
        config.validate().unwrap();
        assert_eq!(config.max_packet_size, 256 * 1024);
        assert_eq!(config.max_send_packet_size, MIN_PACKET_SIZE);
    }

    #[test]
    fn test_builders() {
        let config = TransportConfig::default()
            .with_macs(&["hmac-sha1"])
            .with_compression(&["zlib"])
            .with_channel_window(10000, 16384)
            .with_max_channels(4)
            .with_rekey_count_received(true);
        config.validate().unwrap();
        assert_eq!(config.mac_algorithms, vec!["hmac-sha1"]);
        assert_eq!(config.channel_window_size, 10000);
        assert_eq!(config.channel_max_packet, 16384);
        assert_eq!(config.max_channels, 4);
        assert!(config.rekey_count_received);
    }

    #[test]
    fn test_role() {
        assert!(Role::Client.is_client());
        assert_eq!(Role::Server.to_string(), "server");
    }
}
