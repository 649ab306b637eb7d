//! Message-type dispatch table and the key exchange gate.
//!
//! Every inbound packet is looked up by its first byte. Entries are rebound
//! as the connection moves through its phases: transport messages are bound
//! from the start, the service range once a service is accepted and the
//! connection protocol once the user is authenticated. Before the lookup,
//! [`kex_gate`] rejects messages that are illegal in the current key
//! exchange state.

use std::ops::RangeInclusive;

use strand_platform::{StrandError, StrandResult};

use super::kex::KexState;
use super::message::{describe, MessageType};

/// Range of kex-method specific messages.
pub const KEX_METHOD_RANGE: RangeInclusive<u8> = 30..=49;

/// Range of messages owned by the accepted service (user authentication).
pub const SERVICE_RANGE: RangeInclusive<u8> = 50..=79;

/// What processes one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// SSH_MSG_DISCONNECT
    Disconnect,
    /// SSH_MSG_IGNORE
    Ignore,
    /// SSH_MSG_UNIMPLEMENTED
    Unimplemented,
    /// SSH_MSG_DEBUG
    Debug,
    /// SSH_MSG_SERVICE_REQUEST (server)
    ServiceRequest,
    /// SSH_MSG_SERVICE_ACCEPT (client)
    ServiceAccept,
    /// SSH_MSG_KEXINIT
    KexInit,
    /// SSH_MSG_NEWKEYS
    NewKeys,
    /// Kex method messages, 30..=49
    KexMethod,
    /// Messages of the accepted service, 50..=79
    Service,
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest,
    /// SSH_MSG_REQUEST_SUCCESS and SSH_MSG_REQUEST_FAILURE
    GlobalReply,
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen,
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation,
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure,
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust,
    /// SSH_MSG_CHANNEL_DATA and SSH_MSG_CHANNEL_EXTENDED_DATA
    Data,
    /// SSH_MSG_CHANNEL_EOF
    Eof,
    /// SSH_MSG_CHANNEL_CLOSE
    Close,
    /// SSH_MSG_CHANNEL_REQUEST
    ChannelRequest,
    /// SSH_MSG_CHANNEL_SUCCESS and SSH_MSG_CHANNEL_FAILURE
    ChannelReply,
}

/// 256-entry map from message type to handler.
#[derive(Clone)]
pub struct DispatchTable {
    entries: [Option<HandlerKind>; 256],
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound = self.entries.iter().filter(|e| e.is_some()).count();
        f.debug_struct("DispatchTable").field("bound", &bound).finish()
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    /// A table with nothing bound.
    pub fn new() -> Self {
        Self {
            entries: [None; 256],
        }
    }

    /// A table with the transport layer bound: generic messages, KEXINIT,
    /// NEWKEYS and the kex method range.
    pub fn transport() -> Self {
        use HandlerKind::*;
        let mut table = Self::new();
        table.bind(MessageType::Disconnect as u8, Disconnect);
        table.bind(MessageType::Ignore as u8, Ignore);
        table.bind(MessageType::Unimplemented as u8, Unimplemented);
        table.bind(MessageType::Debug as u8, Debug);
        table.bind(MessageType::KexInit as u8, KexInit);
        table.bind(MessageType::NewKeys as u8, NewKeys);
        table.bind_range(KEX_METHOD_RANGE, KexMethod);
        table
    }

    /// Binds one message type.
    pub fn bind(&mut self, message_type: u8, kind: HandlerKind) {
        self.entries[message_type as usize] = Some(kind);
    }

    /// Binds every type in `range`.
    pub fn bind_range(&mut self, range: RangeInclusive<u8>, kind: HandlerKind) {
        for byte in range {
            self.bind(byte, kind);
        }
    }

    /// Removes a binding; the type falls back to UNIMPLEMENTED.
    pub fn unbind(&mut self, message_type: u8) {
        self.entries[message_type as usize] = None;
    }

    /// The handler bound to `message_type`.
    pub fn lookup(&self, message_type: u8) -> Option<HandlerKind> {
        self.entries[message_type as usize]
    }

    /// Binds the connection protocol (RFC 4254), 80..=100.
    pub fn install_connection(&mut self) {
        use HandlerKind::*;
        self.bind(MessageType::GlobalRequest as u8, GlobalRequest);
        self.bind(MessageType::RequestSuccess as u8, GlobalReply);
        self.bind(MessageType::RequestFailure as u8, GlobalReply);
        self.bind(MessageType::ChannelOpen as u8, ChannelOpen);
        self.bind(MessageType::ChannelOpenConfirmation as u8, ChannelOpenConfirmation);
        self.bind(MessageType::ChannelOpenFailure as u8, ChannelOpenFailure);
        self.bind(MessageType::ChannelWindowAdjust as u8, WindowAdjust);
        self.bind(MessageType::ChannelData as u8, Data);
        self.bind(MessageType::ChannelExtendedData as u8, Data);
        self.bind(MessageType::ChannelEof as u8, Eof);
        self.bind(MessageType::ChannelClose as u8, Close);
        self.bind(MessageType::ChannelRequest as u8, ChannelRequest);
        self.bind(MessageType::ChannelSuccess as u8, ChannelReply);
        self.bind(MessageType::ChannelFailure as u8, ChannelReply);
    }
}

fn out_of_state(byte: u8, state: KexState) -> StrandError {
    StrandError::malformed(format!("{} not allowed in kex state {}", describe(byte), state))
}

/// Decides whether an inbound message may be processed in `state`.
///
/// Generic transport messages (1..=4) always pass. While an exchange runs,
/// upper-layer messages still pass until the peer's KEXINIT arrives, since
/// the peer may have sent them before it saw ours.
///
/// # Errors
///
/// A message that is illegal in `state` is a protocol violation.
pub fn kex_gate(state: KexState, peer_kexinit_received: bool, byte: u8) -> StrandResult<()> {
    if (1..=4).contains(&byte) {
        return Ok(());
    }
    let kex_method = KEX_METHOD_RANGE.contains(&byte);
    let allowed = match state {
        KexState::Init => byte != MessageType::NewKeys as u8 && !kex_method,
        KexState::Ignore | KexState::InProgress => {
            if kex_method {
                true
            } else if byte == MessageType::NewKeys as u8 {
                false
            } else {
                !peer_kexinit_received
            }
        }
        KexState::NewKeysPending => byte == MessageType::NewKeys as u8,
    };
    if allowed {
        Ok(())
    } else {
        Err(out_of_state(byte, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_table() {
        let table = DispatchTable::transport();
        assert_eq!(table.lookup(1), Some(HandlerKind::Disconnect));
        assert_eq!(table.lookup(20), Some(HandlerKind::KexInit));
        assert_eq!(table.lookup(31), Some(HandlerKind::KexMethod));
        assert_eq!(table.lookup(49), Some(HandlerKind::KexMethod));
        assert_eq!(table.lookup(50), None);
        assert_eq!(table.lookup(90), None);
        assert_eq!(table.lookup(255), None);
    }

    #[test]
    fn test_install_connection() {
        let mut table = DispatchTable::transport();
        table.install_connection();
        assert_eq!(table.lookup(95), Some(HandlerKind::Data));
        assert_eq!(table.lookup(100), Some(HandlerKind::ChannelReply));
        assert_eq!(table.lookup(101), None);
        table.unbind(95);
        assert_eq!(table.lookup(95), None);
    }

    #[test]
    fn test_newkeys_in_init_rejected() {
        assert!(kex_gate(KexState::Init, false, 21).is_err());
        assert!(kex_gate(KexState::Init, false, 31).is_err());
        assert!(kex_gate(KexState::Init, false, 20).is_ok());
        assert!(kex_gate(KexState::Init, false, 94).is_ok());
    }

    #[test]
    fn test_in_progress_blocks_upper_layer_after_peer_kexinit() {
        assert!(kex_gate(KexState::InProgress, false, 94).is_ok());
        assert!(kex_gate(KexState::InProgress, true, 94).is_err());
        assert!(kex_gate(KexState::InProgress, true, 50).is_err());
        assert!(kex_gate(KexState::InProgress, true, 31).is_ok());
        assert!(kex_gate(KexState::InProgress, true, 21).is_err());
        assert!(kex_gate(KexState::InProgress, true, 2).is_ok());
    }

    #[test]
    fn test_newkeys_pending_only_newkeys() {
        assert!(kex_gate(KexState::NewKeysPending, true, 21).is_ok());
        assert!(kex_gate(KexState::NewKeysPending, true, 20).is_err());
        assert!(kex_gate(KexState::NewKeysPending, true, 31).is_err());
        assert!(kex_gate(KexState::NewKeysPending, true, 4).is_ok());
    }
}
