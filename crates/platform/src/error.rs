//! Error types for strand

use std::fmt;

/// Disconnect reason codes (RFC 4253 Section 11.1).
///
/// Carried by every fatal protocol error so the connection can tell the peer
/// why it is being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Returns the numeric wire code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Maps a wire code back to a reason.
    ///
    /// Unknown codes map to `None`; callers usually fall back to
    /// [`DisconnectReason::ProtocolError`].
    pub fn from_code(code: u32) -> Option<Self> {
        use DisconnectReason::*;
        Some(match code {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        })
    }

    /// Human-readable description used when no better text is available.
    pub fn description(self) -> &'static str {
        use DisconnectReason::*;
        match self {
            HostNotAllowedToConnect => "host not allowed to connect",
            ProtocolError => "protocol error",
            KeyExchangeFailed => "key exchange failed",
            Reserved => "reserved",
            MacError => "MAC error",
            CompressionError => "compression error",
            ServiceNotAvailable => "service not available",
            ProtocolVersionNotSupported => "protocol version not supported",
            HostKeyNotVerifiable => "host key not verifiable",
            ConnectionLost => "connection lost",
            ByApplication => "disconnected by application",
            TooManyConnections => "too many connections",
            AuthCancelledByUser => "authentication cancelled by user",
            NoMoreAuthMethodsAvailable => "no more authentication methods available",
            IllegalUserName => "illegal user name",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Unified error type for all strand operations
#[derive(Debug)]
pub enum StrandError {
    /// I/O error on the transport or a channel consumer
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed or out-of-state wire data. Always fatal to the connection.
    Protocol {
        /// Code sent to the peer in the best-effort DISCONNECT
        reason: DisconnectReason,
        /// Human-readable description
        message: String,
    },

    /// Error scoped to a single channel (open failure, request failure)
    Channel {
        /// Local channel number
        channel: u32,
        /// Human-readable description
        message: String,
    },

    /// A local limit was hit (channel table full, window exhausted)
    ResourceExhausted(String),

    /// Key material, signature or host key failure
    Security(String),

    /// The peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Reason code sent by the peer
        reason: DisconnectReason,
        /// Description sent by the peer
        description: String,
    },

    /// Operation attempted on a connection that has been torn down
    Closed,

    /// A bounded phase did not complete in time
    Timeout(String),
}

impl StrandError {
    /// Builds a protocol error with the given disconnect reason.
    pub fn protocol(reason: DisconnectReason, message: impl Into<String>) -> Self {
        StrandError::Protocol {
            reason,
            message: message.into(),
        }
    }

    /// Builds a protocol error with [`DisconnectReason::ProtocolError`].
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::protocol(DisconnectReason::ProtocolError, message)
    }

    /// Builds a channel-scoped error.
    pub fn channel(channel: u32, message: impl Into<String>) -> Self {
        StrandError::Channel {
            channel,
            message: message.into(),
        }
    }

    /// Whether this error must tear the whole connection down.
    ///
    /// Channel errors and local capacity errors are reported to the requester
    /// and leave the connection running.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StrandError::Channel { .. } | StrandError::ResourceExhausted(_) | StrandError::Config(_)
        )
    }

    /// Reason code to put in the DISCONNECT sent before teardown.
    ///
    /// Returns `None` when no DISCONNECT should be sent (the peer already
    /// disconnected, or the transport itself is gone).
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            StrandError::Protocol { reason, .. } => Some(*reason),
            StrandError::Security(_) => Some(DisconnectReason::KeyExchangeFailed),
            StrandError::Timeout(_) => Some(DisconnectReason::ByApplication),
            StrandError::Io(_) | StrandError::Disconnected { .. } | StrandError::Closed => None,
            StrandError::Channel { .. }
            | StrandError::ResourceExhausted(_)
            | StrandError::Config(_) => None,
        }
    }
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrandError::Io(e) => write!(f, "IO error: {}", e),
            StrandError::Config(msg) => write!(f, "Configuration error: {}", msg),
            StrandError::Protocol { reason, message } => {
                write!(f, "Protocol error ({}): {}", reason.description(), message)
            }
            StrandError::Channel { channel, message } => {
                write!(f, "Channel {} error: {}", channel, message)
            }
            StrandError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            StrandError::Security(msg) => write!(f, "Security error: {}", msg),
            StrandError::Disconnected {
                reason,
                description,
            } => write!(f, "Peer disconnected ({}): {}", reason.description(), description),
            StrandError::Closed => write!(f, "Connection closed"),
            StrandError::Timeout(msg) => write!(f, "Timed out: {}", msg),
        }
    }
}

impl std::error::Error for StrandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StrandError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StrandError {
    fn from(err: std::io::Error) -> Self {
        StrandError::Io(err)
    }
}

/// Result type for strand operations
pub type StrandResult<T> = Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrandError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = StrandError::protocol(DisconnectReason::MacError, "bad tag");
        assert_eq!(err.to_string(), "Protocol error (MAC error): bad tag");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StrandError = io_err.into();
        assert!(matches!(err, StrandError::Io(_)));
        assert!(err.is_fatal());
        assert_eq!(err.disconnect_reason(), None);
    }

    #[test]
    fn test_fatality() {
        assert!(StrandError::malformed("x").is_fatal());
        assert!(!StrandError::channel(3, "refused").is_fatal());
        assert!(!StrandError::ResourceExhausted("table full".into()).is_fatal());
    }

    #[test]
    fn test_disconnect_reason_codes() {
        for code in 1..=15 {
            let reason = DisconnectReason::from_code(code).unwrap();
            assert_eq!(reason.code(), code);
        }
        assert_eq!(DisconnectReason::from_code(0), None);
        assert_eq!(DisconnectReason::from_code(16), None);
        assert_eq!(
            DisconnectReason::KeyExchangeFailed.to_string(),
            "key exchange failed (3)"
        );
    }
}
