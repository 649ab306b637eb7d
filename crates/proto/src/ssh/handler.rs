//! Collaborator callbacks.
//!
//! A [`Handler`] is whatever sits on top of the connection core: an
//! authentication service, a shell server, a port forwarder. Every callback
//! receives the [`Session`] so it can answer, open channels or send data;
//! those sends are queued and written once the callback returns.

use strand_platform::{DisconnectReason, StrandError, StrandResult};

use super::channel_table::ChannelId;
use super::connection::Session;
use super::messages::{ChannelKind, ChannelOpenFailureReason, ChannelRequestType, GlobalRequestType};
use super::requests::RequestToken;

/// Answer to an incoming CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    /// Confirm with the configured window and packet size
    Accept,
    /// Confirm with explicit limits. A zero window defers data until
    /// [`Session::start_window`].
    AcceptWith {
        /// Initial receive window
        window: u32,
        /// Maximum data packet
        max_packet: u32,
    },
    /// Refuse
    Reject {
        /// Reason code sent to the peer
        reason: ChannelOpenFailureReason,
        /// Description sent to the peer
        description: String,
    },
    /// Decide later with [`Session::accept_channel`] or
    /// [`Session::reject_channel`]
    Defer,
}

impl OpenDecision {
    /// Refusal carrying the reason's standard text.
    pub fn reject(reason: ChannelOpenFailureReason) -> Self {
        OpenDecision::Reject {
            reason,
            description: reason.as_str().to_string(),
        }
    }
}

/// Answer to an incoming channel or global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestReply {
    /// Success
    Success,
    /// Success with response data (global requests only, e.g. a bound port)
    SuccessWith(Vec<u8>),
    /// Failure
    Failure,
    /// Answer later through the session
    Defer,
}

impl RequestReply {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, RequestReply::Success | RequestReply::SuccessWith(_))
    }
}

/// Callbacks from the connection to its collaborator.
///
/// Every method has a default: unknown channel types and requests are
/// refused, received data is consumed immediately.
#[allow(unused_variables)]
pub trait Handler {
    /// The first key exchange completed.
    fn on_established(&mut self, session: &mut Session) {}

    /// Server side: the client asked for a service. Returning `true` sends
    /// SERVICE_ACCEPT and routes messages 50..=79 to
    /// [`on_service_message`](Self::on_service_message); `false` disconnects
    /// with `SERVICE_NOT_AVAILABLE`.
    fn on_service_request(&mut self, session: &mut Session, name: &str) -> bool {
        false
    }

    /// Client side: the server accepted our service request.
    fn on_service_accept(&mut self, session: &mut Session, name: &str) {}

    /// A message of the accepted service (50..=79).
    ///
    /// # Errors
    ///
    /// An error is fatal to the connection.
    fn on_service_message(&mut self, session: &mut Session, payload: &[u8]) -> StrandResult<()> {
        Err(StrandError::malformed(format!(
            "No service handler for message {}",
            payload.first().copied().unwrap_or(0)
        )))
    }

    /// The peer wants to open a channel. `id` is reserved until decided.
    fn on_channel_open(&mut self, session: &mut Session, id: ChannelId, kind: &ChannelKind) -> OpenDecision {
        OpenDecision::reject(ChannelOpenFailureReason::UnknownChannelType)
    }

    /// A channel we opened was confirmed.
    fn on_open_confirmed(&mut self, session: &mut Session, id: ChannelId) {}

    /// A channel we opened was refused, or the connection closed first.
    fn on_open_failed(
        &mut self,
        session: &mut Session,
        id: ChannelId,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) {
    }

    /// Channel data arrived; `extended` carries the extended data type.
    ///
    /// Call [`Session::consume`] once the bytes have been taken so the
    /// peer's window is reopened.
    fn on_receive(&mut self, session: &mut Session, id: ChannelId, data: &[u8], extended: Option<u32>) {
        session.consume(id, data.len());
    }

    /// The peer granted more send window.
    fn on_window_adjust(&mut self, session: &mut Session, id: ChannelId) {}

    /// The peer will send no more data.
    fn on_eof(&mut self, session: &mut Session, id: ChannelId) {}

    /// The channel is closed and its number released. Called exactly once
    /// per open channel.
    fn on_close(&mut self, session: &mut Session, id: ChannelId) {}

    /// A CHANNEL_REQUEST arrived. The answer is only sent when the peer
    /// asked for one; replies leave in receive order regardless of when
    /// they are decided.
    fn on_channel_request(
        &mut self,
        session: &mut Session,
        id: ChannelId,
        request: &ChannelRequestType,
        token: RequestToken,
    ) -> RequestReply {
        RequestReply::Failure
    }

    /// A GLOBAL_REQUEST arrived.
    fn on_global_request(
        &mut self,
        session: &mut Session,
        request: &GlobalRequestType,
        token: RequestToken,
    ) -> RequestReply {
        RequestReply::Failure
    }

    /// A request we sent was answered, `channel` is `None` for global
    /// requests. Outstanding requests fail when their channel closes.
    fn on_request_reply(
        &mut self,
        session: &mut Session,
        channel: Option<ChannelId>,
        token: RequestToken,
        success: bool,
    ) {
    }

    /// The connection is gone, by either side's DISCONNECT or an error.
    fn on_disconnect(&mut self, reason: DisconnectReason, description: &str) {}
}
