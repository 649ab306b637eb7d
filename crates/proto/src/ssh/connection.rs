//! SSH connection: transport state plus channel multiplexing.
//!
//! A [`Connection`] is a sans-I/O state machine. Bytes from the peer go in
//! through [`Connection::feed`]; bytes for the peer accumulate in the
//! [`OutputQueue`] returned by [`Connection::output_mut`]. The async
//! [`driver`](super::driver) pumps a tokio stream through it, tests pump two
//! connections into each other directly.
//!
//! # Structure
//!
//! ```text
//! Connection<H>
//! ├── Session               (everything the Handler may touch)
//! │   ├── PacketEncoder / PacketDecoder
//! │   ├── KeyExchange
//! │   ├── DispatchTable      message type → HandlerKind
//! │   ├── ChannelTable       ChannelId → Channel
//! │   └── OutputQueue
//! └── H: Handler             collaborator callbacks
//! ```
//!
//! Handler callbacks run in the middle of dispatch. Anything they send is
//! put in an outbox and written once the callback returns, so the codec is
//! never entered twice.
//!
//! # Ordering
//!
//! While a key exchange runs, or while the session is paused, outbound
//! messages other than transport and kex messages are kept in a FIFO and
//! released in send order. While paused, inbound messages from the service
//! and connection layers (type 50 and up) are held and dispatched after
//! [`Session::unpause`].

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use tracing::{debug, error, info, trace, warn};

use super::channel::{Channel, ChannelFlags};
use super::channel_table::{ChannelId, ChannelTable, ForwardedPort, Reservation, SlotState};
use super::codec::{PacketDecoder, PacketEncoder};
use super::dispatch::{kex_gate, DispatchTable, HandlerKind, SERVICE_RANGE};
use super::handler::{Handler, OpenDecision, RequestReply};
use super::hostkey::{HostKey, HostKeyVerifier};
use super::kex::{KexState, KeyExchange, KexStep, NegotiatedAlgorithms};
use super::message::{
    self, allowed_during_kex, describe, parse_service, parse_unimplemented, DebugMessage,
    Disconnect, MessageType,
};
use super::messages::{
    recipient_channel, request_failure, request_success, ChannelData, ChannelKind, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelWindowAdjust, GlobalRequest, GlobalRequestType,
};
use super::output::OutputQueue;
use super::packet::Packet;
use super::requests::{RequestToken, Resolution};
use super::transport::{Role, TransportConfig};
use super::version::VersionReader;
use super::wire::Reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Version,
    Running,
    Closed,
}

/// One entry of the outbound queues. The compression switch travels with
/// the messages so it takes effect at its place in send order.
#[derive(Debug)]
enum Outbound {
    Message(Vec<u8>),
    StartCompression,
}

/// Notifications raised inside [`Session`] methods, delivered to the
/// handler once the current step finishes.
#[derive(Debug)]
enum Event {
    OpenFailed {
        id: ChannelId,
        reason: ChannelOpenFailureReason,
        description: String,
    },
    RequestReply {
        channel: Option<ChannelId>,
        token: RequestToken,
        success: bool,
    },
    Closed(ChannelId),
    Disconnected {
        reason: DisconnectReason,
        description: String,
    },
}

/// Connection state shared with the [`Handler`].
pub struct Session {
    role: Role,
    config: TransportConfig,
    rng: Box<dyn RngCore + Send>,
    phase: Phase,
    version_reader: VersionReader,
    inbound: BytesMut,
    remote_version: Option<String>,
    encoder: PacketEncoder,
    decoder: PacketDecoder,
    kex: KeyExchange,
    output: OutputQueue,
    dispatch: DispatchTable,
    channels: ChannelTable,
    outbox: VecDeque<Outbound>,
    deferred: VecDeque<Outbound>,
    held: VecDeque<Packet>,
    paused: bool,
    events: VecDeque<Event>,
    established: bool,
    authenticated: bool,
    compressing: bool,
    decompressing: bool,
    requested_service: Option<String>,
    service: Option<String>,
    sent_at_kex: u64,
    received_at_kex: u64,
    next_token: u64,
    scratch: BytesMut,
    disconnect: Option<(DisconnectReason, String)>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("kex", &self.kex)
            .field("channels", &self.channels.len())
            .field("paused", &self.paused)
            .field("deferred", &self.deferred.len())
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(role: Role, config: TransportConfig, kex: KeyExchange, rng: Box<dyn RngCore + Send>) -> Self {
        let mut dispatch = DispatchTable::transport();
        match role {
            Role::Server => dispatch.bind(MessageType::ServiceRequest as u8, HandlerKind::ServiceRequest),
            Role::Client => dispatch.bind(MessageType::ServiceAccept as u8, HandlerKind::ServiceAccept),
        }
        Self {
            role,
            version_reader: VersionReader::new(role.is_client()),
            inbound: BytesMut::new(),
            remote_version: None,
            encoder: PacketEncoder::new(config.max_send_packet_size),
            decoder: PacketDecoder::new(config.max_packet_size),
            kex,
            output: OutputQueue::new(config.output_buffer_size),
            dispatch,
            channels: ChannelTable::new(config.max_channels),
            outbox: VecDeque::new(),
            deferred: VecDeque::new(),
            held: VecDeque::new(),
            paused: false,
            events: VecDeque::new(),
            established: false,
            authenticated: false,
            compressing: false,
            decompressing: false,
            requested_service: None,
            service: None,
            sent_at_kex: 0,
            received_at_kex: 0,
            next_token: 0,
            scratch: BytesMut::new(),
            disconnect: None,
            phase: Phase::Version,
            rng,
            config,
        }
    }

    /// Sends our identification line and first KEXINIT.
    fn start(&mut self) -> StrandResult<()> {
        info!(role = %self.role, local = %self.config.version, "sending identification");
        self.output.enqueue(self.config.version.to_wire_format());
        self.start_kex()
    }

    // ---- accessors ------------------------------------------------------

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Configuration in effect.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Key exchange state.
    pub fn kex_state(&self) -> KexState {
        self.kex.state()
    }

    /// Number of completed key exchanges.
    pub fn kex_count(&self) -> u32 {
        self.kex.completed()
    }

    /// Session identifier, fixed by the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.kex.session_id()
    }

    /// Algorithms of the most recent negotiation.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.kex.negotiated()
    }

    /// The peer's identification line.
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    /// Whether the first key exchange completed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Whether [`set_authenticated`](Self::set_authenticated) was called.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Whether the session is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Accepted service, if any.
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Why the connection closed.
    pub fn disconnect_reason(&self) -> Option<(DisconnectReason, &str)> {
        self.disconnect.as_ref().map(|(r, d)| (*r, d.as_str()))
    }

    /// The channel table.
    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// An open channel.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// Outbound bytes for the peer.
    pub fn output(&self) -> &OutputQueue {
        &self.output
    }

    /// Outbound bytes for the peer, mutably (to drain them).
    pub fn output_mut(&mut self) -> &mut OutputQueue {
        &mut self.output
    }

    /// Messages waiting for the key exchange or an unpause.
    pub fn deferred_len(&self) -> usize {
        self.deferred
            .iter()
            .filter(|entry| matches!(entry, Outbound::Message(_)))
            .count()
    }

    fn next_token(&mut self) -> RequestToken {
        self.next_token += 1;
        RequestToken::new(self.next_token)
    }

    fn ensure_open(&self) -> StrandResult<()> {
        if self.phase == Phase::Closed {
            Err(StrandError::Closed)
        } else {
            Ok(())
        }
    }

    fn channel_mut(&mut self, id: ChannelId) -> StrandResult<&mut Channel> {
        self.channels
            .get_mut(id)
            .ok_or_else(|| StrandError::channel(id.raw(), "No such open channel"))
    }

    fn lookup_channel(&self, raw: u32) -> StrandResult<ChannelId> {
        self.channels
            .lookup(raw)
            .ok_or_else(|| StrandError::malformed(format!("Message for unknown channel {}", raw)))
    }

    // ---- outbound path --------------------------------------------------

    /// Queues a raw message payload for the peer.
    ///
    /// Kex and transport messages go out at once; anything else waits while
    /// a key exchange runs or the session is paused. After teardown the
    /// message is dropped.
    pub fn send(&mut self, payload: Vec<u8>) {
        if self.phase == Phase::Closed {
            warn!(
                msg = %describe(payload.first().copied().unwrap_or(0)),
                "send on closed connection dropped"
            );
            return;
        }
        self.outbox.push_back(Outbound::Message(payload));
    }

    pub(crate) fn flush_outbox(&mut self) -> StrandResult<()> {
        self.release_deferred()?;
        while let Some(entry) = self.outbox.pop_front() {
            self.route(entry)?;
        }
        Ok(())
    }

    fn route(&mut self, entry: Outbound) -> StrandResult<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let waits = self.kex.in_progress() || self.paused || !self.deferred.is_empty();
        match entry {
            Outbound::Message(payload) => {
                let byte = payload.first().copied().unwrap_or(0);
                if waits && !allowed_during_kex(byte) {
                    trace!(msg = %describe(byte), queued = self.deferred.len() + 1, "deferring outbound message");
                    self.deferred.push_back(Outbound::Message(payload));
                    return Ok(());
                }
                self.write_packet(&payload)
            }
            Outbound::StartCompression if waits => {
                trace!(queued = self.deferred.len() + 1, "deferring compression start");
                self.deferred.push_back(Outbound::StartCompression);
                Ok(())
            }
            Outbound::StartCompression => {
                self.start_compression();
                Ok(())
            }
        }
    }

    fn release_deferred(&mut self) -> StrandResult<()> {
        while !self.paused && !self.kex.in_progress() && self.phase == Phase::Running {
            match self.deferred.pop_front() {
                Some(Outbound::Message(payload)) => self.write_packet(&payload)?,
                Some(Outbound::StartCompression) => self.start_compression(),
                None => break,
            }
        }
        Ok(())
    }

    /// Outbound delayed compression applies from the next written packet on,
    /// including under keys installed later. A server also expects
    /// compressed input from here, since the client switches on reading
    /// what precedes this point.
    fn start_compression(&mut self) {
        debug!("outbound compression started");
        self.compressing = true;
        self.encoder.activate_compression();
        if self.role == Role::Server {
            self.start_decompression();
        }
    }

    fn start_decompression(&mut self) {
        if !self.decompressing {
            debug!("inbound compression started");
            self.decompressing = true;
        }
        self.decoder.activate_compression();
    }

    fn write_packet(&mut self, payload: &[u8]) -> StrandResult<()> {
        self.encoder.encode(payload, &mut *self.rng, &mut self.scratch)?;
        let wire = self.scratch.split().freeze();
        self.output.enqueue(wire);
        self.maybe_rekey()
    }

    // ---- key exchange ---------------------------------------------------

    fn start_kex(&mut self) -> StrandResult<()> {
        let payload = self.kex.start(&self.config, &mut *self.rng)?;
        self.reset_rekey_counters();
        self.write_packet(&payload)
    }

    fn reset_rekey_counters(&mut self) {
        self.sent_at_kex = self.encoder.total_bytes();
        self.received_at_kex = self.decoder.total_bytes();
    }

    pub(crate) fn maybe_rekey(&mut self) -> StrandResult<()> {
        if !self.established || self.phase != Phase::Running || self.kex.state() != KexState::Init {
            return Ok(());
        }
        let mut used = self.encoder.total_bytes() - self.sent_at_kex;
        if self.config.rekey_count_received {
            used += self.decoder.total_bytes() - self.received_at_kex;
        }
        if used >= self.config.rekey_bytes_limit {
            info!(bytes = used, limit = self.config.rekey_bytes_limit, "rekey threshold reached");
            self.start_kex()?;
        }
        Ok(())
    }

    /// Starts a new key exchange now.
    ///
    /// Does nothing while one is already running.
    ///
    /// # Errors
    ///
    /// Fails before the first exchange completed or after teardown.
    pub fn rekey(&mut self) -> StrandResult<()> {
        self.ensure_open()?;
        if !self.established {
            return Err(StrandError::malformed("Cannot rekey before the first key exchange"));
        }
        if self.kex.in_progress() {
            return Ok(());
        }
        info!("rekey requested");
        self.start_kex()
    }

    fn apply_kex_step(&mut self, step: KexStep) -> StrandResult<()> {
        for payload in &step.messages {
            self.write_packet(payload)?;
        }
        if let Some(suite) = step.outbound {
            self.encoder.install(suite);
            if self.compressing {
                self.encoder.activate_compression();
            }
            debug!(direction = "outbound", "new keys installed");
        }
        Ok(())
    }

    fn handle_kexinit(&mut self, payload: &[u8]) -> StrandResult<()> {
        let peer_initiated = self.kex.state() == KexState::Init;
        let step = self.kex.handle_kexinit(payload, &self.config, &mut *self.rng)?;
        if peer_initiated {
            debug!(rekey = self.established, "peer started key exchange");
            self.reset_rekey_counters();
        }
        self.apply_kex_step(step)
    }

    fn handle_kex_method(&mut self, payload: &[u8]) -> StrandResult<()> {
        let step = self
            .kex
            .handle_method_message(payload, &mut *self.rng)?;
        self.apply_kex_step(step)
    }

    /// Returns whether this completed the first exchange.
    fn handle_newkeys(&mut self, payload: &[u8]) -> StrandResult<bool> {
        let suite = self.kex.handle_newkeys(payload)?;
        self.decoder.install(suite)?;
        if self.decompressing {
            self.decoder.activate_compression();
        }
        debug!(direction = "inbound", "new keys installed");
        let first = !self.established;
        self.established = true;
        self.release_deferred()?;
        Ok(first)
    }

    // ---- inbound path ---------------------------------------------------

    fn receive(&mut self, data: &[u8]) -> StrandResult<()> {
        match self.phase {
            Phase::Closed => Err(StrandError::Closed),
            Phase::Running => {
                self.decoder.feed(data);
                Ok(())
            }
            Phase::Version => {
                self.inbound.extend_from_slice(data);
                if let Some((version, line)) = self.version_reader.read(&mut self.inbound)? {
                    info!(
                        peer = %version,
                        skipped = self.version_reader.skipped_lines(),
                        "version exchange complete"
                    );
                    self.kex.set_remote_version(line.clone());
                    self.remote_version = Some(line);
                    self.phase = Phase::Running;
                    let rest = self.inbound.split();
                    self.decoder.feed(&rest);
                }
                Ok(())
            }
        }
    }

    /// Next packet to dispatch: held packets first once unpaused, then
    /// freshly decoded ones that pass the kex gate.
    fn next_packet(&mut self) -> StrandResult<Option<Packet>> {
        if self.phase != Phase::Running {
            return Ok(None);
        }
        if !self.paused {
            if let Some(packet) = self.held.pop_front() {
                return Ok(Some(packet));
            }
        }
        while let Some(packet) = self.decoder.decode()? {
            if self.kex.state() == KexState::Ignore {
                self.kex.ignore_packet(packet.message_type());
                continue;
            }
            let byte = packet
                .message_type()
                .ok_or_else(|| StrandError::malformed("Packet with empty payload"))?;
            kex_gate(self.kex.state(), self.kex.peer_kexinit_received(), byte)?;
            if self.paused && byte >= *SERVICE_RANGE.start() {
                trace!(msg = %describe(byte), held = self.held.len() + 1, "holding inbound message while paused");
                self.held.push_back(packet);
                continue;
            }
            return Ok(Some(packet));
        }
        Ok(None)
    }

    // ---- phases ---------------------------------------------------------

    /// Serializes a protocol phase: outbound non-kex messages queue up and
    /// inbound messages of type 50 and above are held.
    pub fn pause(&mut self) {
        if !self.paused {
            debug!("session paused");
            self.paused = true;
        }
    }

    /// Ends a pause. Queued messages go out in order and held ones are
    /// dispatched once the current step returns (or on
    /// [`Connection::process_pending`]).
    pub fn unpause(&mut self) {
        if self.paused {
            debug!(deferred = self.deferred.len(), held = self.held.len(), "session unpaused");
            self.paused = false;
        }
    }

    /// Client side: asks the server for a service (usually `ssh-userauth`).
    ///
    /// # Errors
    ///
    /// Fails on a server or after teardown.
    pub fn request_service(&mut self, name: &str) -> StrandResult<()> {
        self.ensure_open()?;
        if self.role != Role::Client {
            return Err(StrandError::Config("Only clients request services".into()));
        }
        info!(service = name, "requesting service");
        self.requested_service = Some(name.to_string());
        self.send(message::service(MessageType::ServiceRequest, name));
        Ok(())
    }

    fn accept_service(&mut self, name: String) {
        info!(service = %name, "service accepted");
        self.dispatch.bind_range(SERVICE_RANGE, HandlerKind::Service);
        self.service = Some(name);
    }

    /// Marks the user authenticated and binds the connection protocol.
    ///
    /// Delayed compression starts right after the messages sent so far,
    /// in send order: a success reply still waiting on a pause or a key
    /// exchange goes out uncompressed. A client expects compressed input
    /// from now on.
    ///
    /// # Errors
    ///
    /// Fails after teardown, or if flushing the queued messages fails.
    pub fn set_authenticated(&mut self) -> StrandResult<()> {
        self.ensure_open()?;
        if self.authenticated {
            return Ok(());
        }
        self.authenticated = true;
        if self.role == Role::Client {
            self.start_decompression();
        }
        self.outbox.push_back(Outbound::StartCompression);
        self.flush_outbox()?;
        self.dispatch.install_connection();
        info!(role = %self.role, "authenticated, connection protocol enabled");
        Ok(())
    }

    /// Sends SSH_MSG_IGNORE with `data`.
    pub fn send_ignore(&mut self, data: &[u8]) {
        self.send(message::ignore(data));
    }

    /// Sends SSH_MSG_DEBUG.
    pub fn send_debug(&mut self, always_display: bool, text: &str) {
        self.send(
            DebugMessage {
                always_display,
                message: text.to_string(),
            }
            .to_bytes(),
        );
    }

    // ---- global requests ------------------------------------------------

    /// Sends a global request. With `want_reply`, the returned token comes
    /// back through [`Handler::on_request_reply`].
    ///
    /// # Errors
    ///
    /// Fails after teardown.
    pub fn send_global_request(&mut self, request: GlobalRequestType, want_reply: bool) -> StrandResult<RequestToken> {
        self.ensure_open()?;
        let token = self.next_token();
        debug!(request = request.name(), want_reply, token = %token, "sending global request");
        if want_reply {
            self.channels.sent_global().push(token, request.clone());
        }
        self.send(GlobalRequest { want_reply, request }.to_bytes());
        Ok(token)
    }

    /// Answers a deferred global request. Returns `false` if `token` is not
    /// awaiting an answer.
    pub fn complete_global_request(&mut self, token: RequestToken, reply: RequestReply) -> bool {
        let resolution = match reply {
            RequestReply::Defer => return self.channels.received_global().contains(token),
            RequestReply::Success => Resolution::Success(Vec::new()),
            RequestReply::SuccessWith(data) => Resolution::Success(data),
            RequestReply::Failure => Resolution::Failure,
        };
        if !self.channels.received_global().resolve(token, resolution) {
            return false;
        }
        while let Some((_, request, resolution)) = self.channels.received_global().pop_ready() {
            match resolution {
                Resolution::Success(data) => {
                    self.record_forward(&request, &data, true);
                    self.send(request_success(&data));
                }
                Resolution::Failure => self.send(request_failure()),
            }
        }
        true
    }

    /// Tracks forwarding requests that succeeded. `local` forwards are the
    /// ones we listen on for the peer.
    fn record_forward(&mut self, request: &GlobalRequestType, response: &[u8], local: bool) {
        match request {
            GlobalRequestType::TcpipForward { address, port } => {
                let port = if *port == 0 {
                    Reader::new(response).read_u32().unwrap_or(0)
                } else {
                    *port
                };
                let forward = ForwardedPort {
                    address: address.clone(),
                    port,
                };
                debug!(address = %forward.address, port, local, "port forward registered");
                if local {
                    self.channels.add_local_forward(forward);
                } else {
                    self.channels.add_remote_forward(forward);
                }
            }
            GlobalRequestType::CancelTcpipForward { address, port } => {
                if local {
                    self.channels.remove_local_forward(address, *port);
                } else {
                    self.channels.remove_remote_forward(address, *port);
                }
            }
            _ => {}
        }
    }

    // ---- channels -------------------------------------------------------

    /// Opens a channel. The id stays reserved until the peer confirms
    /// ([`Handler::on_open_confirmed`]) or refuses
    /// ([`Handler::on_open_failed`]).
    ///
    /// # Errors
    ///
    /// [`StrandError::ResourceExhausted`] when the channel table is full,
    /// [`StrandError::Closed`] after teardown.
    pub fn open_channel(&mut self, kind: ChannelKind, window: u32, max_packet: u32) -> StrandResult<ChannelId> {
        self.ensure_open()?;
        let id = self.channels.reserve(Reservation::Outbound {
            kind: kind.name().to_string(),
            window,
            max_packet,
        })?;
        debug!(channel = %id, kind = kind.name(), window, max_packet, "opening channel");
        self.send(ChannelOpen::new(kind, id.raw(), window, max_packet).to_bytes());
        Ok(id)
    }

    /// Opens a `session` channel with the configured window.
    pub fn open_session(&mut self) -> StrandResult<ChannelId> {
        let (window, max_packet) = (self.config.channel_window_size, self.config.channel_max_packet);
        self.open_channel(ChannelKind::Session, window, max_packet)
    }

    /// Confirms a deferred inbound open with the configured window.
    ///
    /// # Errors
    ///
    /// Fails unless `id` holds a pending inbound open.
    pub fn accept_channel(&mut self, id: ChannelId) -> StrandResult<()> {
        let (window, max_packet) = (self.config.channel_window_size, self.config.channel_max_packet);
        self.accept_channel_with(id, window, max_packet)
    }

    /// Confirms a deferred inbound open with explicit limits.
    pub fn accept_channel_with(&mut self, id: ChannelId, window: u32, max_packet: u32) -> StrandResult<()> {
        self.ensure_open()?;
        let (kind, remote_id, send_window, send_max_packet) = match self.channels.reservation(id) {
            Some(Reservation::Inbound {
                kind,
                remote_id,
                send_window,
                send_max_packet,
            }) => (kind.clone(), *remote_id, *send_window, *send_max_packet),
            _ => return Err(StrandError::channel(id.raw(), "No pending inbound open")),
        };
        let channel = Channel::new(id.raw(), remote_id, &kind, window, max_packet, send_window, send_max_packet);
        self.channels.activate(id, channel)?;
        info!(channel = %id, kind = %kind, remote = remote_id, window, "channel accepted");
        self.send(
            ChannelOpenConfirmation {
                recipient_channel: remote_id,
                sender_channel: id.raw(),
                initial_window_size: window,
                maximum_packet_size: max_packet,
            }
            .to_bytes(),
        );
        Ok(())
    }

    /// Refuses a deferred inbound open and frees its number.
    pub fn reject_channel(
        &mut self,
        id: ChannelId,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> StrandResult<()> {
        self.ensure_open()?;
        let remote_id = match self.channels.reservation(id) {
            Some(Reservation::Inbound { remote_id, .. }) => *remote_id,
            _ => return Err(StrandError::channel(id.raw(), "No pending inbound open")),
        };
        self.channels.release(id);
        debug!(channel = %id, reason = reason.as_str(), "channel open refused");
        self.send(
            ChannelOpenFailure {
                recipient_channel: remote_id,
                reason,
                description: description.to_string(),
            }
            .to_bytes(),
        );
        Ok(())
    }

    /// Writes whatever the channel has ready: data within the window, owed
    /// replies, a pending EOF and the CLOSE once due.
    fn pump_channel(&mut self, id: ChannelId) {
        let mut out = Vec::new();
        if let Some(ch) = self.channels.get_mut(id) {
            ch.flush(&mut out);
            ch.drain_replies(&mut out);
            ch.maybe_close(&mut out);
        }
        for payload in out {
            self.send(payload);
        }
    }

    fn finish_channel(&mut self, id: ChannelId) {
        if let Some(mut ch) = self.channels.release(id) {
            for token in ch.abort_requests() {
                self.events.push_back(Event::RequestReply {
                    channel: Some(id),
                    token,
                    success: false,
                });
            }
            info!(channel = %id, kind = ch.kind(), "channel closed");
            self.events.push_back(Event::Closed(id));
        }
    }

    /// Queues channel data. It is sent as the peer's window allows.
    ///
    /// # Errors
    ///
    /// Fails for an unknown channel, or after EOF or CLOSE was sent.
    pub fn send_channel_data(&mut self, id: ChannelId, data: impl Into<Bytes>) -> StrandResult<()> {
        self.ensure_open()?;
        self.channel_mut(id)?.queue_data(None, data.into())?;
        self.pump_channel(id);
        Ok(())
    }

    /// Queues extended data (`code` 1 is stderr).
    pub fn send_extended_data(&mut self, id: ChannelId, code: u32, data: impl Into<Bytes>) -> StrandResult<()> {
        self.ensure_open()?;
        self.channel_mut(id)?.queue_data(Some(code), data.into())?;
        self.pump_channel(id);
        Ok(())
    }

    /// Sends a channel request. With `want_reply`, the returned token comes
    /// back through [`Handler::on_request_reply`].
    pub fn request_channel(
        &mut self,
        id: ChannelId,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> StrandResult<RequestToken> {
        self.ensure_open()?;
        let token = self.next_token();
        let payload = self.channel_mut(id)?.request(request, want_reply, token)?;
        self.send(payload);
        Ok(token)
    }

    /// Answers a channel request. Replies leave in the order the requests
    /// arrived, so an answer may wait for earlier ones.
    ///
    /// # Errors
    ///
    /// Fails if the channel is gone or `token` is not pending on it.
    pub fn complete_channel_request(
        &mut self,
        id: ChannelId,
        token: RequestToken,
        reply: RequestReply,
    ) -> StrandResult<()> {
        self.ensure_open()?;
        if reply == RequestReply::Defer {
            return Ok(());
        }
        self.channel_mut(id)?.resolve(token, reply.is_success())?;
        self.pump_channel(id);
        Ok(())
    }

    /// Credits `n` bytes drained by the local consumer; sends a
    /// WINDOW_ADJUST once half the window is consumed.
    pub fn consume(&mut self, id: ChannelId, n: usize) {
        if let Some(adjust) = self.channels.get_mut(id).and_then(|ch| ch.consume(n)) {
            self.send(adjust);
        }
    }

    /// Opens (or grows) the receive window of a channel that was accepted
    /// with a zero window.
    pub fn start_window(&mut self, id: ChannelId, size: u32) -> StrandResult<()> {
        self.ensure_open()?;
        if let Some(adjust) = self.channel_mut(id)?.start_window(size) {
            self.send(adjust);
        }
        Ok(())
    }

    /// Sends EOF after any queued data.
    pub fn send_eof(&mut self, id: ChannelId) -> StrandResult<()> {
        self.ensure_open()?;
        let mut out = Vec::new();
        self.channel_mut(id)?.send_eof(&mut out);
        out.into_iter().for_each(|m| self.send(m));
        self.pump_channel(id);
        Ok(())
    }

    /// Reports EOF from one of the channel's local sources.
    pub fn source_eof(&mut self, id: ChannelId) -> StrandResult<()> {
        self.ensure_open()?;
        let mut out = Vec::new();
        self.channel_mut(id)?.source_eof(&mut out);
        out.into_iter().for_each(|m| self.send(m));
        self.pump_channel(id);
        Ok(())
    }

    /// Sets how many local sources feed the channel.
    pub fn set_sources(&mut self, id: ChannelId, sources: u32) -> StrandResult<()> {
        self.channel_mut(id)?.set_sources(sources);
        Ok(())
    }

    /// Clears or restores automatic CLOSE after EOF went both ways. Clear
    /// it while a trailing status (exit-status) is still expected.
    pub fn set_close_at_eof(&mut self, id: ChannelId, on: bool) -> StrandResult<()> {
        self.channel_mut(id)?.set_flag(ChannelFlags::CLOSE_AT_EOF, on);
        self.pump_channel(id);
        Ok(())
    }

    /// With `close_at_eof`, close after our own EOF without waiting for the
    /// peer's.
    pub fn set_no_wait_for_eof(&mut self, id: ChannelId, on: bool) -> StrandResult<()> {
        self.channel_mut(id)?.set_flag(ChannelFlags::NO_WAIT_FOR_EOF, on);
        self.pump_channel(id);
        Ok(())
    }

    /// Sends CLOSE. The channel is released when the peer's CLOSE arrives.
    pub fn close_channel(&mut self, id: ChannelId) -> StrandResult<()> {
        self.ensure_open()?;
        let mut out = Vec::new();
        self.channel_mut(id)?.close(&mut out);
        out.into_iter().for_each(|m| self.send(m));
        Ok(())
    }

    // ---- teardown -------------------------------------------------------

    /// Sends DISCONNECT (best effort) and tears the connection down.
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if self.phase == Phase::Closed {
            return;
        }
        info!(reason = %reason, description, "sending disconnect");
        self.phase = Phase::Closed;
        let payload = Disconnect::new(reason, description).to_bytes();
        if let Err(e) = self.write_packet(&payload) {
            debug!(error = %e, "could not encode disconnect");
        }
        self.teardown(reason, description.to_string());
    }

    /// Tears down without sending DISCONNECT, for a transport that is
    /// already gone.
    pub fn abort(&mut self, description: &str) {
        if self.phase == Phase::Closed {
            return;
        }
        info!(description, "connection lost");
        self.teardown(DisconnectReason::ConnectionLost, description.to_string());
    }

    /// Releases every channel and request, then closes the output. Each open
    /// channel reports `on_close` once, each pending outbound open reports
    /// `on_open_failed`, and each unanswered request fails.
    fn teardown(&mut self, reason: DisconnectReason, description: String) {
        self.phase = Phase::Closed;
        for id in self.channels.reserved_ids() {
            if let Some(Reservation::Outbound { .. }) = self.channels.reservation(id) {
                self.events.push_back(Event::OpenFailed {
                    id,
                    reason: ChannelOpenFailureReason::ConnectFailed,
                    description: "connection closed".into(),
                });
            }
            self.channels.release(id);
        }
        for id in self.channels.channel_ids() {
            self.finish_channel(id);
        }
        for (token, _) in self.channels.sent_global().abort() {
            self.events.push_back(Event::RequestReply {
                channel: None,
                token,
                success: false,
            });
        }
        self.channels.received_global().clear();
        self.outbox.clear();
        self.deferred.clear();
        self.held.clear();
        self.output.close();
        self.disconnect = Some((reason, description.clone()));
        self.events.push_back(Event::Disconnected { reason, description });
    }
}

/// An SSH connection driven by received bytes.
pub struct Connection<H: Handler> {
    session: Session,
    handler: H,
}

impl<H: Handler> std::fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("session", &self.session).finish()
    }
}

impl<H: Handler> Connection<H> {
    /// Client connection trusting host keys through `verifier`.
    ///
    /// The identification line and KEXINIT are queued at once.
    ///
    /// # Errors
    ///
    /// [`StrandError::Config`] for an invalid configuration.
    pub fn client(config: TransportConfig, verifier: impl HostKeyVerifier + 'static, handler: H) -> StrandResult<Self> {
        Self::client_with_rng(config, verifier, handler, Box::new(StdRng::from_entropy()))
    }

    /// Like [`client`](Self::client), with an injected RNG.
    pub fn client_with_rng(
        config: TransportConfig,
        verifier: impl HostKeyVerifier + 'static,
        handler: H,
        rng: Box<dyn RngCore + Send>,
    ) -> StrandResult<Self> {
        config.validate()?;
        let kex = KeyExchange::client(config.version.to_string(), Box::new(verifier));
        Self::start(Session::new(Role::Client, config, kex, rng), handler)
    }

    /// Server connection signing with `host_key`.
    pub fn server(config: TransportConfig, host_key: Arc<dyn HostKey>, handler: H) -> StrandResult<Self> {
        Self::server_with_rng(config, host_key, handler, Box::new(StdRng::from_entropy()))
    }

    /// Like [`server`](Self::server), with an injected RNG.
    pub fn server_with_rng(
        config: TransportConfig,
        host_key: Arc<dyn HostKey>,
        handler: H,
        rng: Box<dyn RngCore + Send>,
    ) -> StrandResult<Self> {
        config.validate()?;
        let kex = KeyExchange::server(config.version.to_string(), host_key);
        Self::start(Session::new(Role::Server, config, kex, rng), handler)
    }

    fn start(mut session: Session, handler: H) -> StrandResult<Self> {
        session.start()?;
        Ok(Self { session, handler })
    }

    /// The session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The session, mutably. Messages it sends are written on the next
    /// [`feed`](Self::feed) or [`process_pending`](Self::process_pending);
    /// [`with_session`](Self::with_session) does both in one call.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Outbound bytes for the peer.
    pub fn output_mut(&mut self) -> &mut OutputQueue {
        &mut self.session.output
    }

    /// Key exchange state.
    pub fn kex_state(&self) -> KexState {
        self.session.kex_state()
    }

    /// Whether the first key exchange completed.
    pub fn is_established(&self) -> bool {
        self.session.is_established()
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Closed and every queued byte written.
    pub fn is_finished(&self) -> bool {
        self.session.output.is_finished()
    }

    /// Runs `f` with the session and handler, then writes what it sent.
    pub fn with_session<R>(&mut self, f: impl FnOnce(&mut Session, &mut H) -> R) -> StrandResult<R> {
        let value = f(&mut self.session, &mut self.handler);
        self.process_pending()?;
        Ok(value)
    }

    /// Sends DISCONNECT and tears down.
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        self.session.disconnect(reason, description);
        self.deliver_events();
    }

    /// Ends a pause and dispatches what was held.
    pub fn unpause(&mut self) -> StrandResult<()> {
        self.session.unpause();
        self.process_pending()
    }

    /// Processes bytes received from the peer.
    ///
    /// # Errors
    ///
    /// A fatal error has already sent a best-effort DISCONNECT and torn the
    /// connection down when it is returned.
    pub fn feed(&mut self, data: &[u8]) -> StrandResult<()> {
        if self.session.is_closed() {
            return Err(StrandError::Closed);
        }
        let result = match self.session.receive(data) {
            Ok(()) => self.pump(),
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    /// Writes queued messages, dispatches held packets and delivers pending
    /// notifications.
    pub fn process_pending(&mut self) -> StrandResult<()> {
        if self.session.is_closed() {
            self.deliver_events();
            return Ok(());
        }
        let result = self.pump();
        self.settle(result)
    }

    fn settle(&mut self, result: StrandResult<()>) -> StrandResult<()> {
        let result = result.and_then(|()| self.drain());
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(error = %err, "connection failed");
                match err.disconnect_reason() {
                    Some(reason) => self.session.disconnect(reason, &err.to_string()),
                    None => self.session.abort(&err.to_string()),
                }
            } else {
                warn!(error = %err, "non-fatal connection error");
            }
            self.deliver_events();
        }
        result
    }

    fn pump(&mut self) -> StrandResult<()> {
        loop {
            self.drain()?;
            let packet = match self.session.next_packet()? {
                Some(packet) => packet,
                None => return Ok(()),
            };
            self.dispatch(packet)?;
            self.session.maybe_rekey()?;
        }
    }

    fn drain(&mut self) -> StrandResult<()> {
        loop {
            self.session.flush_outbox()?;
            if self.session.events.is_empty() {
                return Ok(());
            }
            self.deliver_events();
        }
    }

    fn deliver_events(&mut self) {
        while let Some(event) = self.session.events.pop_front() {
            let session = &mut self.session;
            match event {
                Event::OpenFailed {
                    id,
                    reason,
                    description,
                } => self.handler.on_open_failed(session, id, reason, &description),
                Event::RequestReply {
                    channel,
                    token,
                    success,
                } => self.handler.on_request_reply(session, channel, token, success),
                Event::Closed(id) => self.handler.on_close(session, id),
                Event::Disconnected {
                    reason,
                    description,
                } => self.handler.on_disconnect(reason, &description),
            }
        }
    }

    fn dispatch(&mut self, packet: Packet) -> StrandResult<()> {
        let payload = packet.payload();
        let byte = payload[0];
        let seq = packet.sequence_number();
        let kind = match self.session.dispatch.lookup(byte) {
            Some(kind) => kind,
            None => {
                debug!(msg = %describe(byte), seq, "no handler bound, replying UNIMPLEMENTED");
                self.session.send(message::unimplemented(seq));
                return Ok(());
            }
        };
        trace!(msg = %describe(byte), seq, len = payload.len(), "dispatch");

        match kind {
            HandlerKind::Disconnect => {
                let msg = Disconnect::from_bytes(payload)?;
                info!(reason = %msg.reason, description = %msg.description, "peer disconnected");
                self.session.teardown(msg.reason, msg.description);
            }
            HandlerKind::Ignore => trace!(len = payload.len(), "ignore message"),
            HandlerKind::Unimplemented => {
                let rejected = parse_unimplemented(payload)?;
                warn!(seq = rejected, "peer reported our packet as unimplemented");
            }
            HandlerKind::Debug => {
                let msg = DebugMessage::from_bytes(payload)?;
                if msg.always_display {
                    info!(message = %msg.message, "peer debug message");
                } else {
                    debug!(message = %msg.message, "peer debug message");
                }
            }
            HandlerKind::ServiceRequest => self.on_service_request(payload)?,
            HandlerKind::ServiceAccept => self.on_service_accept(payload)?,
            HandlerKind::KexInit => self.session.handle_kexinit(payload)?,
            HandlerKind::KexMethod => self.session.handle_kex_method(payload)?,
            HandlerKind::NewKeys => {
                if self.session.handle_newkeys(payload)? {
                    info!(role = %self.session.role, "connection established");
                    self.handler.on_established(&mut self.session);
                }
            }
            HandlerKind::Service => self.handler.on_service_message(&mut self.session, payload)?,
            HandlerKind::GlobalRequest => self.on_global_request(payload)?,
            HandlerKind::GlobalReply => self.on_global_reply(byte, payload)?,
            HandlerKind::ChannelOpen => self.on_channel_open(payload)?,
            HandlerKind::ChannelOpenConfirmation => self.on_open_confirmation(payload)?,
            HandlerKind::ChannelOpenFailure => self.on_open_failure(payload)?,
            HandlerKind::WindowAdjust => self.on_window_adjust(payload)?,
            HandlerKind::Data => self.on_data(payload)?,
            HandlerKind::Eof => self.on_eof(payload)?,
            HandlerKind::Close => self.on_close(payload)?,
            HandlerKind::ChannelRequest => self.on_channel_request(payload)?,
            HandlerKind::ChannelReply => self.on_channel_reply(byte, payload)?,
        }
        Ok(())
    }

    fn on_service_request(&mut self, payload: &[u8]) -> StrandResult<()> {
        let name = parse_service(payload, MessageType::ServiceRequest)?;
        debug!(service = %name, "service requested");
        if !self.handler.on_service_request(&mut self.session, &name) {
            return Err(StrandError::protocol(
                DisconnectReason::ServiceNotAvailable,
                format!("Service {} not available", name),
            ));
        }
        self.session.send(message::service(MessageType::ServiceAccept, &name));
        self.session.accept_service(name);
        Ok(())
    }

    fn on_service_accept(&mut self, payload: &[u8]) -> StrandResult<()> {
        let name = parse_service(payload, MessageType::ServiceAccept)?;
        if self.session.requested_service.as_deref() != Some(name.as_str()) {
            return Err(StrandError::malformed(format!(
                "SERVICE_ACCEPT for {} which was not requested",
                name
            )));
        }
        self.session.accept_service(name.clone());
        self.handler.on_service_accept(&mut self.session, &name);
        Ok(())
    }

    fn on_global_request(&mut self, payload: &[u8]) -> StrandResult<()> {
        let msg = GlobalRequest::from_bytes(payload)?;
        let session = &mut self.session;
        let token = session.next_token();
        debug!(request = msg.request.name(), want_reply = msg.want_reply, token = %token, "global request");
        if msg.want_reply {
            session.channels.received_global().push(token, msg.request.clone());
        }
        let reply = self.handler.on_global_request(session, &msg.request, token);
        if session.is_closed() {
            return Ok(());
        }
        if msg.want_reply {
            session.complete_global_request(token, reply);
        } else if reply.is_success() {
            let data = match &reply {
                RequestReply::SuccessWith(data) => data.as_slice(),
                _ => &[],
            };
            session.record_forward(&msg.request, data, true);
        }
        Ok(())
    }

    fn on_global_reply(&mut self, byte: u8, payload: &[u8]) -> StrandResult<()> {
        let success = byte == MessageType::RequestSuccess as u8;
        let session = &mut self.session;
        let (token, request) = session.channels.sent_global().pop_reply("global")?;
        debug!(request = request.name(), token = %token, success, "global request answered");
        if success {
            session.record_forward(&request, &payload[1..], false);
        }
        self.handler.on_request_reply(session, None, token, success);
        Ok(())
    }

    fn on_channel_open(&mut self, payload: &[u8]) -> StrandResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        let session = &mut self.session;
        let sender = open.sender_channel;
        debug!(
            kind = open.kind.name(),
            sender,
            window = open.initial_window_size,
            max_packet = open.maximum_packet_size,
            "channel open requested"
        );

        if let ChannelKind::ForwardedTcpip {
            connected_address,
            connected_port,
            ..
        } = &open.kind
        {
            if !session.channels.is_remote_forward(connected_address, *connected_port) {
                warn!(address = %connected_address, port = connected_port, "forwarded-tcpip for a port we never forwarded");
                session.send(
                    ChannelOpenFailure::new(sender, ChannelOpenFailureReason::AdministrativelyProhibited)
                        .to_bytes(),
                );
                return Ok(());
            }
        }

        let reservation = Reservation::Inbound {
            kind: open.kind.name().to_string(),
            remote_id: sender,
            send_window: open.initial_window_size,
            send_max_packet: open.maximum_packet_size,
        };
        let id = match session.channels.reserve(reservation) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "refusing channel open");
                session.send(ChannelOpenFailure::new(sender, ChannelOpenFailureReason::ResourceShortage).to_bytes());
                return Ok(());
            }
        };

        let decision = self.handler.on_channel_open(session, id, &open.kind);
        if session.is_closed() {
            return Ok(());
        }
        match decision {
            OpenDecision::Accept => session.accept_channel(id)?,
            OpenDecision::AcceptWith { window, max_packet } => session.accept_channel_with(id, window, max_packet)?,
            OpenDecision::Reject { reason, description } => session.reject_channel(id, reason, &description)?,
            OpenDecision::Defer => debug!(channel = %id, "channel open decision deferred"),
        }
        Ok(())
    }

    fn on_open_confirmation(&mut self, payload: &[u8]) -> StrandResult<()> {
        let msg = ChannelOpenConfirmation::from_bytes(payload)?;
        let session = &mut self.session;
        let id = ChannelId::new(msg.recipient_channel);
        let (kind, window, max_packet) = match session.channels.reservation(id) {
            Some(Reservation::Outbound {
                kind,
                window,
                max_packet,
            }) => (kind.clone(), *window, *max_packet),
            _ => {
                return Err(StrandError::malformed(format!(
                    "Open confirmation for channel {} which is not being opened",
                    msg.recipient_channel
                )))
            }
        };
        let channel = Channel::new(
            id.raw(),
            msg.sender_channel,
            &kind,
            window,
            max_packet,
            msg.initial_window_size,
            msg.maximum_packet_size,
        );
        session.channels.activate(id, channel)?;
        info!(
            channel = %id,
            kind = %kind,
            remote = msg.sender_channel,
            send_window = msg.initial_window_size,
            "channel confirmed"
        );
        self.handler.on_open_confirmed(session, id);
        Ok(())
    }

    fn on_open_failure(&mut self, payload: &[u8]) -> StrandResult<()> {
        let msg = ChannelOpenFailure::from_bytes(payload)?;
        let session = &mut self.session;
        let id = ChannelId::new(msg.recipient_channel);
        if !matches!(session.channels.reservation(id), Some(Reservation::Outbound { .. })) {
            return Err(StrandError::malformed(format!(
                "Open failure for channel {} which is not being opened",
                msg.recipient_channel
            )));
        }
        session.channels.release(id);
        info!(channel = %id, reason = msg.reason.as_str(), description = %msg.description, "channel open refused by peer");
        self.handler.on_open_failed(session, id, msg.reason, &msg.description);
        Ok(())
    }

    fn on_window_adjust(&mut self, payload: &[u8]) -> StrandResult<()> {
        let msg = ChannelWindowAdjust::from_bytes(payload)?;
        let session = &mut self.session;
        let id = session.lookup_channel(msg.recipient_channel)?;
        session.channel_mut(id)?.on_window_adjust(msg.bytes_to_add)?;
        trace!(channel = %id, added = msg.bytes_to_add, "window adjust");
        session.pump_channel(id);
        self.handler.on_window_adjust(session, id);
        Ok(())
    }

    fn on_data(&mut self, payload: &[u8]) -> StrandResult<()> {
        let msg = ChannelData::from_bytes(payload)?;
        let session = &mut self.session;
        let id = session.lookup_channel(msg.recipient_channel)?;
        let deliver = {
            let ch = session.channel_mut(id)?;
            ch.on_data(msg.data.len())?;
            ch.accepts_data()
        };
        if deliver {
            self.handler.on_receive(session, id, &msg.data, msg.data_type);
        } else {
            trace!(channel = %id, len = msg.data.len(), "data after CLOSE dropped");
        }
        Ok(())
    }

    fn on_eof(&mut self, payload: &[u8]) -> StrandResult<()> {
        let raw = recipient_channel(payload)?;
        let session = &mut self.session;
        let id = session.lookup_channel(raw)?;
        session.channel_mut(id)?.on_eof()?;
        debug!(channel = %id, "peer sent EOF");
        self.handler.on_eof(session, id);
        session.pump_channel(id);
        Ok(())
    }

    fn on_close(&mut self, payload: &[u8]) -> StrandResult<()> {
        let raw = recipient_channel(payload)?;
        let session = &mut self.session;
        match session.channels.state(raw) {
            SlotState::Free => {
                debug!(channel = raw, "CLOSE for released channel ignored");
                return Ok(());
            }
            SlotState::Reserved => {
                return Err(StrandError::malformed(format!(
                    "CLOSE for channel {} which is not open",
                    raw
                )))
            }
            SlotState::InUse => {}
        }
        let id = ChannelId::new(raw);
        let mut out = Vec::new();
        let closed = {
            let ch = session.channel_mut(id)?;
            ch.on_close(&mut out);
            ch.is_closed()
        };
        debug!(channel = %id, "peer sent CLOSE");
        out.into_iter().for_each(|m| session.send(m));
        if closed {
            session.finish_channel(id);
        }
        Ok(())
    }

    fn on_channel_request(&mut self, payload: &[u8]) -> StrandResult<()> {
        let msg = ChannelRequest::from_bytes(payload)?;
        let session = &mut self.session;
        let id = session.lookup_channel(msg.recipient_channel)?;
        let token = session.next_token();
        if msg.want_reply {
            session.channel_mut(id)?.push_received(token);
        }
        debug!(
            channel = %id,
            request = msg.request.name(),
            want_reply = msg.want_reply,
            token = %token,
            "channel request"
        );
        let reply = self.handler.on_channel_request(session, id, &msg.request, token);
        if session.is_closed() || session.channels.get(id).is_none() {
            return Ok(());
        }
        if msg.want_reply {
            session.complete_channel_request(id, token, reply)?;
        }
        Ok(())
    }

    fn on_channel_reply(&mut self, byte: u8, payload: &[u8]) -> StrandResult<()> {
        let success = byte == MessageType::ChannelSuccess as u8;
        let raw = recipient_channel(payload)?;
        let session = &mut self.session;
        let id = session.lookup_channel(raw)?;
        let (token, name) = session.channel_mut(id)?.on_reply()?;
        debug!(channel = %id, request = %name, token = %token, success, "channel request answered");
        self.handler.on_request_reply(session, Some(id), token, success);
        session.pump_channel(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey};
    use crate::ssh::packet::MAX_PACKET_SIZE;

    #[derive(Default)]
    struct Quiet;
    impl Handler for Quiet {}

    fn rng(seed: u64) -> Box<dyn RngCore + Send> {
        Box::new(StdRng::seed_from_u64(seed))
    }

    fn config() -> TransportConfig {
        TransportConfig::default().with_kex_algorithms(&["curve25519-sha256"])
    }

    fn pair() -> (Connection<Quiet>, Connection<Quiet>) {
        let key = Arc::new(Ed25519HostKey::generate(&mut StdRng::seed_from_u64(7)));
        let client = Connection::client_with_rng(config(), AcceptAnyHostKey, Quiet, rng(1)).unwrap();
        let server = Connection::server_with_rng(config(), key, Quiet, rng(2)).unwrap();
        (client, server)
    }

    fn take(conn: &mut Connection<Quiet>) -> Vec<u8> {
        let mut out = Vec::new();
        conn.output_mut().drain(&mut out, usize::MAX).unwrap();
        out
    }

    fn settle(client: &mut Connection<Quiet>, server: &mut Connection<Quiet>) {
        for _ in 0..32 {
            let to_server = take(client);
            let to_client = take(server);
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
            if !to_server.is_empty() && !server.is_closed() {
                let _ = server.feed(&to_server);
            }
            if !to_client.is_empty() && !client.is_closed() {
                let _ = client.feed(&to_client);
            }
        }
    }

    #[test]
    fn test_starts_with_version_and_kexinit() {
        let (mut client, _) = pair();
        let out = take(&mut client);
        assert!(out.starts_with(b"SSH-2.0-"));
        assert_eq!(client.kex_state(), KexState::InProgress);
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (mut client, mut server) = pair();
        settle(&mut client, &mut server);
        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(client.session().session_id(), server.session().session_id());
        assert_eq!(client.kex_state(), KexState::Init);
    }

    #[test]
    fn test_sends_deferred_until_kex_done() {
        let (mut client, mut server) = pair();
        client.session_mut().send(GlobalRequest {
            want_reply: false,
            request: GlobalRequestType::Keepalive,
        }
        .to_bytes());
        client.process_pending().unwrap();
        assert_eq!(client.session().deferred_len(), 1);
        settle(&mut client, &mut server);
        assert_eq!(client.session().deferred_len(), 0);
    }

    #[test]
    fn test_pause_defers_outbound() {
        let (mut client, mut server) = pair();
        settle(&mut client, &mut server);
        client.session_mut().pause();
        client.session_mut().send_debug(false, "still here");
        client.session_mut().send(message::service(MessageType::ServiceRequest, "ssh-userauth"));
        client.process_pending().unwrap();
        assert_eq!(client.session().deferred_len(), 1);
        client.unpause().unwrap();
        assert_eq!(client.session().deferred_len(), 0);
    }

    #[test]
    fn test_unbound_message_gets_unimplemented() {
        let (mut client, mut server) = pair();
        settle(&mut client, &mut server);
        // The connection protocol is not bound before authentication.
        client.session_mut().send(GlobalRequest {
            want_reply: true,
            request: GlobalRequestType::Keepalive,
        }
        .to_bytes());
        client.process_pending().unwrap();
        settle(&mut client, &mut server);
        assert!(!server.is_closed());
        assert!(!client.is_closed());
    }

    #[test]
    fn test_oversized_packet_disconnects() {
        let (_, mut server) = pair();
        let mut data = b"SSH-2.0-probe\r\n".to_vec();
        data.extend_from_slice(&((MAX_PACKET_SIZE as u32) + 1).to_be_bytes());
        data.extend_from_slice(&[0u8; 12]);
        let err = server.feed(&data).unwrap_err();
        assert!(matches!(err, StrandError::Protocol { .. }));
        assert!(server.is_closed());
        assert_eq!(
            server.session().disconnect_reason().map(|(r, _)| r),
            Some(DisconnectReason::ProtocolError)
        );
        assert!(matches!(server.feed(b"x"), Err(StrandError::Closed)));
    }

    #[test]
    fn test_disconnect_is_terminal() {
        let (mut client, mut server) = pair();
        settle(&mut client, &mut server);
        client.disconnect(DisconnectReason::ByApplication, "bye");
        assert!(client.is_closed());
        settle(&mut client, &mut server);
        assert!(server.is_closed());
        assert_eq!(
            server.session().disconnect_reason(),
            Some((DisconnectReason::ByApplication, "bye"))
        );
        assert!(client.is_finished());
    }

    #[test]
    fn test_rekey_keeps_session_id() {
        let (mut client, mut server) = pair();
        settle(&mut client, &mut server);
        let id = client.session().session_id().map(|s| s.to_vec());
        client.with_session(|s, _| s.rekey()).unwrap().unwrap();
        settle(&mut client, &mut server);
        assert_eq!(client.session().kex_count(), 2);
        assert_eq!(server.session().kex_count(), 2);
        assert_eq!(client.session().session_id().map(|s| s.to_vec()), id);
    }
}
