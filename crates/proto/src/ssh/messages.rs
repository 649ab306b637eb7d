//! SSH connection protocol messages (RFC 4254).
//!
//! Wire structs for global requests and everything channel related:
//! - Channel open, confirmation and failure
//! - Flow control (window adjust) and data (plain and extended)
//! - EOF and close
//! - Channel requests and their replies
//!
//! The state these messages drive lives in [`channel`](super::channel) and
//! [`channel_table`](super::channel_table).
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::messages::{ChannelKind, ChannelOpen};
//!
//! let open = ChannelOpen::new(ChannelKind::Session, 0, 1048576, 32768);
//! let bytes = open.to_bytes();
//! assert_eq!(bytes[0], 90);
//! assert_eq!(ChannelOpen::from_bytes(&bytes).unwrap(), open);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use strand_platform::{StrandError, StrandResult};

use super::message::MessageType;
use super::wire::{put_bool, put_string, Reader};

/// Extended data type code for stderr (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type carried by SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (remote port forwarding).
    ForwardedTcpip {
        /// Address that was connected
        connected_address: String,
        /// Port that was connected
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other type; the type-specific data is kept opaque.
    Other {
        /// Channel type name
        name: String,
        /// Raw type-specific data
        data: Vec<u8>,
    },
}

impl ChannelKind {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and its specific data
    pub kind: ChannelKind,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        kind: ChannelKind,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            kind,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes to bytes.
    ///
    /// Format:
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        put_string(&mut buf, self.kind.name().as_bytes());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.kind {
            ChannelKind::Session => {}
            ChannelKind::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, host.as_bytes());
                buf.put_u32(*port);
                put_string(&mut buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelKind::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, connected_address.as_bytes());
                buf.put_u32(*connected_port);
                put_string(&mut buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelKind::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the data is truncated.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(data, MessageType::ChannelOpen as u8, "SSH_MSG_CHANNEL_OPEN")?;
        let type_name = r.read_utf8()?;
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;

        let kind = match type_name.as_str() {
            "session" => ChannelKind::Session,
            "direct-tcpip" => ChannelKind::DirectTcpip {
                host: r.read_utf8()?,
                port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelKind::ForwardedTcpip {
                connected_address: r.read_utf8()?,
                connected_port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            _ => ChannelKind::Other {
                name: type_name,
                data: r.remaining().to_vec(),
            },
        };

        Ok(Self {
            kind,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Recipient channel number (the opener's number)
    pub recipient_channel: u32,
    /// Sender channel number (the responder's number)
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(
            data,
            MessageType::ChannelOpenConfirmation as u8,
            "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
        )?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage,
    /// Any code outside the registered range
    Other(u32),
}

impl ChannelOpenFailureReason {
    /// Returns the numeric code.
    pub fn code(&self) -> u32 {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => 1,
            ChannelOpenFailureReason::ConnectFailed => 2,
            ChannelOpenFailureReason::UnknownChannelType => 3,
            ChannelOpenFailureReason::ResourceShortage => 4,
            ChannelOpenFailureReason::Other(code) => *code,
        }
    }

    /// Maps a numeric code.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ChannelOpenFailureReason::AdministrativelyProhibited,
            2 => ChannelOpenFailureReason::ConnectFailed,
            3 => ChannelOpenFailureReason::UnknownChannelType,
            4 => ChannelOpenFailureReason::ResourceShortage,
            other => ChannelOpenFailureReason::Other(other),
        }
    }

    /// Returns a human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => "administratively prohibited",
            ChannelOpenFailureReason::ConnectFailed => "connect failed",
            ChannelOpenFailureReason::UnknownChannelType => "unknown channel type",
            ChannelOpenFailureReason::ResourceShortage => "resource shortage",
            ChannelOpenFailureReason::Other(_) => "unknown reason",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Reason code
    pub reason: ChannelOpenFailureReason,
    /// Human-readable description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason,
            description: reason.as_str().to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason.code());
        put_string(&mut buf, self.description.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses from bytes. The language tag is optional on input.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(
            data,
            MessageType::ChannelOpenFailure as u8,
            "SSH_MSG_CHANNEL_OPEN_FAILURE",
        )?;
        let recipient_channel = r.read_u32()?;
        let reason = ChannelOpenFailureReason::from_code(r.read_u32()?);
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        Ok(Self {
            recipient_channel,
            reason,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Bytes to add to the window
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(
            data,
            MessageType::ChannelWindowAdjust as u8,
            "SSH_MSG_CHANNEL_WINDOW_ADJUST",
        )?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA and SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Extended data type code; `None` for plain data
    pub data_type: Option<u32>,
    /// Payload
    pub data: Bytes,
}

impl ChannelData {
    /// Bytes of framing before the data in either message.
    pub fn overhead(extended: bool) -> usize {
        if extended {
            13
        } else {
            9
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::overhead(true) + self.data.len());
        match self.data_type {
            None => {
                buf.put_u8(MessageType::ChannelData as u8);
                buf.put_u32(self.recipient_channel);
            }
            Some(code) => {
                buf.put_u8(MessageType::ChannelExtendedData as u8);
                buf.put_u32(self.recipient_channel);
                buf.put_u32(code);
            }
        }
        put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses either message type.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let extended = data.first() == Some(&(MessageType::ChannelExtendedData as u8));
        let mut r = if extended {
            Reader::for_message(
                data,
                MessageType::ChannelExtendedData as u8,
                "SSH_MSG_CHANNEL_EXTENDED_DATA",
            )?
        } else {
            Reader::for_message(data, MessageType::ChannelData as u8, "SSH_MSG_CHANNEL_DATA")?
        };
        let recipient_channel = r.read_u32()?;
        let data_type = if extended { Some(r.read_u32()?) } else { None };
        let data = Bytes::copy_from_slice(r.read_string()?);
        Ok(Self {
            recipient_channel,
            data_type,
            data,
        })
    }
}

/// Builds one of the messages that carry only a recipient channel
/// (EOF, CLOSE, SUCCESS, FAILURE).
pub fn recipient_only(kind: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(kind as u8);
    buf.put_u32(recipient_channel);
    buf.to_vec()
}

/// Reads the recipient channel of any channel message.
///
/// Every message in the 91..=100 range starts with it.
pub fn recipient_channel(data: &[u8]) -> StrandResult<u32> {
    let mut r = Reader::new(data);
    let ty = r.read_u8()?;
    r.read_u32().map_err(|_| {
        StrandError::malformed(format!(
            "{} truncated before recipient channel",
            super::message::describe(ty)
        ))
    })
}

/// Channel request type (RFC 4254 Sections 6.2 to 6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes, opaque to the core
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Deliver a signal
    Signal {
        /// Signal name without the "SIG" prefix
        name: String,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// eow@openssh.com, end of write on a half-closed channel
    Eow,
    /// Any other request; the type-specific data is kept opaque.
    Other {
        /// Request name
        name: String,
        /// Raw type-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Eow => "eow@openssh.com",
            ChannelRequestType::Other { name, .. } => name,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                put_string(buf, term.as_bytes());
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                put_string(buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                put_string(buf, name.as_bytes());
                put_string(buf, value.as_bytes());
            }
            ChannelRequestType::Exec { command } => put_string(buf, command.as_bytes()),
            ChannelRequestType::Subsystem { name } => put_string(buf, name.as_bytes()),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::Signal { name } => put_string(buf, name.as_bytes()),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                put_string(buf, signal_name.as_bytes());
                put_bool(buf, *core_dumped);
                put_string(buf, error_message.as_bytes());
                put_string(buf, language_tag.as_bytes());
            }
            ChannelRequestType::Shell | ChannelRequestType::Eow => {}
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn read(name: String, r: &mut Reader<'_>) -> StrandResult<Self> {
        Ok(match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: String::from_utf8_lossy(r.read_string()?).into_owned(),
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "signal" => ChannelRequestType::Signal {
                name: r.read_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_utf8()?,
                core_dumped: r.read_bool()?,
                error_message: String::from_utf8_lossy(r.read_string()?).into_owned(),
                language_tag: r.read_utf8()?,
            },
            "eow@openssh.com" => ChannelRequestType::Eow,
            _ => ChannelRequestType::Other {
                data: r.remaining().to_vec(),
                name,
            },
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Whether the sender expects SUCCESS or FAILURE back
    pub want_reply: bool,
    /// Request type and its specific data
    pub request: ChannelRequestType,
}

impl ChannelRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        put_string(&mut buf, self.request.name().as_bytes());
        put_bool(&mut buf, self.want_reply);
        self.request.put(&mut buf);
        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a known request type is malformed.
    /// Unknown request types parse as [`ChannelRequestType::Other`].
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(
            data,
            MessageType::ChannelRequest as u8,
            "SSH_MSG_CHANNEL_REQUEST",
        )?;
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        let request = ChannelRequestType::read(name, &mut r)?;
        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// Global request type (RFC 4254 Sections 4 and 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Ask the peer to listen on a port and forward connections back
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind; 0 lets the peer choose
        port: u32,
    },
    /// Cancel a previous `tcpip-forward`
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// keepalive@openssh.com
    Keepalive,
    /// Any other request; data kept opaque
    Other {
        /// Request name
        name: String,
        /// Raw request-specific data
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Keepalive => "keepalive@openssh.com",
            GlobalRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Whether the sender expects REQUEST_SUCCESS or REQUEST_FAILURE back
    pub want_reply: bool,
    /// Request type and data
    pub request: GlobalRequestType,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        put_string(&mut buf, self.request.name().as_bytes());
        put_bool(&mut buf, self.want_reply);
        match &self.request {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                put_string(&mut buf, address.as_bytes());
                buf.put_u32(*port);
            }
            GlobalRequestType::Keepalive => {}
            GlobalRequestType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = Reader::for_message(
            data,
            MessageType::GlobalRequest as u8,
            "SSH_MSG_GLOBAL_REQUEST",
        )?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        let request = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: r.read_utf8()?,
                port: r.read_u32()?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: r.read_utf8()?,
                port: r.read_u32()?,
            },
            "keepalive@openssh.com" => GlobalRequestType::Keepalive,
            _ => GlobalRequestType::Other {
                data: r.remaining().to_vec(),
                name,
            },
        };
        Ok(Self {
            want_reply,
            request,
        })
    }
}

/// Builds SSH_MSG_REQUEST_SUCCESS with optional response data.
pub fn request_success(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(MessageType::RequestSuccess as u8);
    buf.put_slice(data);
    buf.to_vec()
}

/// Builds SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_direct_tcpip() {
        let open = ChannelOpen::new(
            ChannelKind::DirectTcpip {
                host: "example.com".into(),
                port: 80,
                originator_address: "127.0.0.1".into(),
                originator_port: 5000,
            },
            7,
            65536,
            16384,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
        assert_eq!(parsed.kind.name(), "direct-tcpip");
    }

    #[test]
    fn test_channel_open_unknown_type_kept_opaque() {
        let open = ChannelOpen::new(
            ChannelKind::Other {
                name: "x11".into(),
                data: vec![0, 0, 0, 1, b'h'],
            },
            1,
            0,
            1024,
        );
        match ChannelOpen::from_bytes(&open.to_bytes()).unwrap().kind {
            ChannelKind::Other { name, data } => {
                assert_eq!(name, "x11");
                assert_eq!(data, vec![0, 0, 0, 1, b'h']);
            }
            other => panic!("Expected opaque kind, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_open_truncated() {
        let bytes = ChannelOpen::new(ChannelKind::Session, 0, 100, 100).to_bytes();
        assert!(ChannelOpen::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_open_failure_reason_codes() {
        let failure = ChannelOpenFailure::new(3, ChannelOpenFailureReason::ResourceShortage);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.reason.code(), 4);
        assert_eq!(parsed.description, "resource shortage");
        assert_eq!(
            ChannelOpenFailureReason::from_code(77),
            ChannelOpenFailureReason::Other(77)
        );
    }

    #[test]
    fn test_extended_data() {
        let msg = ChannelData {
            recipient_channel: 2,
            data_type: Some(EXTENDED_DATA_STDERR),
            data: Bytes::from_static(b"oops"),
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 95);
        assert_eq!(bytes.len(), ChannelData::overhead(true) + 4);
        assert_eq!(ChannelData::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_recipient_channel() {
        let eof = recipient_only(MessageType::ChannelEof, 42);
        assert_eq!(eof, vec![96, 0, 0, 0, 42]);
        assert_eq!(recipient_channel(&eof).unwrap(), 42);
        assert!(recipient_channel(&[97, 0, 0]).is_err());
    }

    #[test]
    fn test_pty_req() {
        let req = ChannelRequest {
            recipient_channel: 0,
            want_reply: true,
            request: ChannelRequestType::PtyReq {
                term: "xterm-256color".into(),
                width_chars: 80,
                height_rows: 24,
                width_pixels: 0,
                height_pixels: 0,
                modes: vec![0],
            },
        };
        assert_eq!(ChannelRequest::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn test_exit_signal_truncated() {
        let req = ChannelRequest {
            recipient_channel: 0,
            want_reply: false,
            request: ChannelRequestType::ExitSignal {
                signal_name: "KILL".into(),
                core_dumped: false,
                error_message: String::new(),
                language_tag: String::new(),
            },
        };
        let bytes = req.to_bytes();
        assert!(ChannelRequest::from_bytes(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_unknown_channel_request_is_opaque() {
        let req = ChannelRequest {
            recipient_channel: 9,
            want_reply: true,
            request: ChannelRequestType::Other {
                name: "auth-agent-req@openssh.com".into(),
                data: vec![],
            },
        };
        let parsed = ChannelRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed.request.name(), "auth-agent-req@openssh.com");
    }

    #[test]
    fn test_global_requests() {
        let req = GlobalRequest {
            want_reply: true,
            request: GlobalRequestType::TcpipForward {
                address: "0.0.0.0".into(),
                port: 8080,
            },
        };
        assert_eq!(GlobalRequest::from_bytes(&req.to_bytes()).unwrap(), req);

        let keepalive = GlobalRequest {
            want_reply: true,
            request: GlobalRequestType::Keepalive,
        };
        assert_eq!(
            GlobalRequest::from_bytes(&keepalive.to_bytes()).unwrap().request,
            GlobalRequestType::Keepalive
        );
        assert_eq!(request_success(&[0, 0, 0x1f, 0x90]), vec![81, 0, 0, 0x1f, 0x90]);
        assert_eq!(request_failure(), vec![82]);
    }
}
