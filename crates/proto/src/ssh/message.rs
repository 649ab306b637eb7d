//! SSH message numbers and transport-generic messages (RFC 4253).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Routed opaquely to the auth collaborator
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::message::{MessageClass, MessageType};
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert_eq!(MessageClass::of(31), MessageClass::KexMethod);
//! ```

use bytes::{BufMut, BytesMut};
use strand_platform::{DisconnectReason, StrandResult};

use super::wire::{put_bool, put_string, Reader};

/// SSH message types handled by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message type.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - switch to freshly derived keys.
    NewKeys = 21,
    /// DH/ECDH key exchange init.
    KexdhInit = 30,
    /// DH/ECDH key exchange reply.
    KexdhReply = 31,
    /// User authentication success; the only auth message the core names.
    UserauthSuccess = 52,
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use strand_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        Some(match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexdhInit,
            31 => KexdhReply,
            52 => UserauthSuccess,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        })
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Formats a raw message number for logs, naming it when known.
pub fn describe(byte: u8) -> String {
    match MessageType::from_u8(byte) {
        Some(ty) => ty.to_string(),
        None => format!("SSH_MSG_{}", byte),
    }
}

/// Numeric range a message number falls into (RFC 4250 Section 4.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// 1-19
    TransportGeneric,
    /// 20-29
    AlgorithmNegotiation,
    /// 30-49
    KexMethod,
    /// 50-79
    UserAuth,
    /// 80-127
    Connection,
    /// 0 and 128-191
    Reserved,
    /// 192-255
    LocalExtension,
}

impl MessageClass {
    /// Classifies a message number.
    pub fn of(byte: u8) -> Self {
        match byte {
            1..=19 => MessageClass::TransportGeneric,
            20..=29 => MessageClass::AlgorithmNegotiation,
            30..=49 => MessageClass::KexMethod,
            50..=79 => MessageClass::UserAuth,
            80..=127 => MessageClass::Connection,
            192..=255 => MessageClass::LocalExtension,
            _ => MessageClass::Reserved,
        }
    }

    /// Whether messages of this class belong to key exchange and may be sent
    /// while an exchange is running.
    pub fn is_kex(self) -> bool {
        matches!(
            self,
            MessageClass::AlgorithmNegotiation | MessageClass::KexMethod
        )
    }
}

/// Whether a message may be written to the wire while a key exchange is in
/// progress (RFC 4253 Section 7.1).
///
/// Covers the algorithm negotiation and kex method ranges plus DISCONNECT,
/// IGNORE, UNIMPLEMENTED and DEBUG.
pub fn allowed_during_kex(byte: u8) -> bool {
    MessageClass::of(byte).is_kex() || matches!(byte, 1..=4)
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason: DisconnectReason,
    /// Human-readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason.code());
        put_string(&mut buf, self.description.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses from bytes. Unknown reason codes map to `ProtocolError`.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(data, MessageType::Disconnect as u8, "SSH_MSG_DISCONNECT")?;
        let code = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        Ok(Self {
            reason: DisconnectReason::from_code(code).unwrap_or(DisconnectReason::ProtocolError),
            description,
        })
    }
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be shown
    pub always_display: bool,
    /// Message text
    pub message: String,
}

impl DebugMessage {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Debug as u8);
        put_bool(&mut buf, self.always_display);
        put_string(&mut buf, self.message.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(data, MessageType::Debug as u8, "SSH_MSG_DEBUG")?;
        let always_display = r.read_bool()?;
        let message = String::from_utf8_lossy(r.read_string()?).into_owned();
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// Builds an SSH_MSG_IGNORE payload.
pub fn ignore(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Ignore as u8);
    put_string(&mut buf, data);
    buf.to_vec()
}

/// Builds an SSH_MSG_UNIMPLEMENTED payload naming the rejected sequence number.
pub fn unimplemented(sequence_number: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence_number);
    buf.to_vec()
}

/// Reads the sequence number out of an SSH_MSG_UNIMPLEMENTED payload.
pub fn parse_unimplemented(data: &[u8]) -> StrandResult<u32> {
    Reader::for_message(
        data,
        MessageType::Unimplemented as u8,
        "SSH_MSG_UNIMPLEMENTED",
    )?
    .read_u32()
}

/// Builds SSH_MSG_SERVICE_REQUEST or SSH_MSG_SERVICE_ACCEPT.
pub fn service(kind: MessageType, name: &str) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + name.len());
    buf.put_u8(kind as u8);
    put_string(&mut buf, name.as_bytes());
    buf.to_vec()
}

/// Reads the service name out of a SERVICE_REQUEST or SERVICE_ACCEPT payload.
pub fn parse_service(data: &[u8], kind: MessageType) -> StrandResult<String> {
    Reader::for_message(data, kind as u8, kind.name())?.read_utf8()
}
