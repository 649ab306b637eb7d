//! A single multiplexed channel (RFC 4254 Section 5).
//!
//! [`Channel`] holds the flow-control windows, the EOF/CLOSE handshake flags
//! and the two request FIFOs of one open channel. It never touches the wire
//! itself: operations push ready payloads into an output vector and the
//! session writes them out.
//!
//! # Flow control
//!
//! Outbound data is queued and released in chunks no larger than the peer's
//! window and maximum packet. Inbound data debits our receive window; once
//! the consumer has drained half of the configured window, a
//! WINDOW_ADJUST returns the consumed bytes to the peer.
//!
//! # Close handshake
//!
//! ```text
//! Open ──EOF sent + EOF received (close_at_eof)──▶ CLOSE sent ─┐
//!   │                                                          ├─▶ Closed
//!   └──────────────CLOSE received──▶ CLOSE sent in reply ──────┘
//! ```

use std::collections::VecDeque;

use bitflags::bitflags;
use bytes::Bytes;
use strand_platform::{StrandError, StrandResult};
use tracing::{debug, trace};

use super::message::MessageType;
use super::messages::{
    recipient_only, ChannelData, ChannelRequest, ChannelRequestType, ChannelWindowAdjust,
};
use super::requests::{ReceivedRequests, RequestToken, Resolution, SentRequests};

/// Largest data payload put in one CHANNEL_DATA, whatever the peer allows.
pub const MAX_DATA_CHUNK: u32 = 32768;

bitflags! {
    /// EOF/CLOSE handshake and closing policy bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u8 {
        /// We sent CHANNEL_CLOSE
        const SENT_CLOSE = 1 << 0;
        /// Peer sent CHANNEL_CLOSE
        const RECEIVED_CLOSE = 1 << 1;
        /// We sent CHANNEL_EOF
        const SENT_EOF = 1 << 2;
        /// Peer sent CHANNEL_EOF
        const RECEIVED_EOF = 1 << 3;
        /// Send CLOSE once EOF went both ways
        const CLOSE_AT_EOF = 1 << 4;
        /// With CLOSE_AT_EOF, do not wait for the peer's EOF
        const NO_WAIT_FOR_EOF = 1 << 5;
        /// EOF requested but queued behind outbound data
        const EOF_PENDING = 1 << 6;
    }
}

/// Lifecycle of an allocated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Data may flow both ways
    Open,
    /// One CLOSE is out, or EOF went both ways with `close_at_eof` set
    HalfClosed,
    /// CLOSE sent and received; the slot is about to be freed
    Closed,
}

/// One open channel.
#[derive(Debug)]
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    kind: String,

    rec_window_size: u32,
    rec_max_packet: u32,
    rec_window_target: u32,
    consumed: u32,

    send_window_size: u32,
    send_max_packet: u32,

    flags: ChannelFlags,
    sources: u32,
    sources_at_eof: u32,

    sent_requests: SentRequests<String>,
    received_requests: ReceivedRequests<()>,

    pending: VecDeque<(Option<u32>, Bytes)>,
    pending_bytes: usize,
}

impl Channel {
    /// Creates an open channel.
    ///
    /// `rec_*` are the limits we advertised, `send_*` the peer's.
    pub fn new(
        local_id: u32,
        remote_id: u32,
        kind: &str,
        rec_window_size: u32,
        rec_max_packet: u32,
        send_window_size: u32,
        send_max_packet: u32,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            kind: kind.to_string(),
            rec_window_size,
            rec_max_packet,
            rec_window_target: rec_window_size,
            consumed: 0,
            send_window_size,
            send_max_packet,
            flags: ChannelFlags::CLOSE_AT_EOF,
            sources: 1,
            sources_at_eof: 0,
            sent_requests: SentRequests::default(),
            received_requests: ReceivedRequests::default(),
            pending: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    /// Our channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Channel type name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Bytes the peer may still send us.
    pub fn rec_window_size(&self) -> u32 {
        self.rec_window_size
    }

    /// Largest data payload we accept.
    pub fn rec_max_packet(&self) -> u32 {
        self.rec_max_packet
    }

    /// Bytes we may still send.
    pub fn send_window_size(&self) -> u32 {
        self.send_window_size
    }

    /// Largest data payload the peer accepts.
    pub fn send_max_packet(&self) -> u32 {
        self.send_max_packet
    }

    /// Current flags.
    pub fn flags(&self) -> ChannelFlags {
        self.flags
    }

    /// Sets or clears policy flags (`CLOSE_AT_EOF`, `NO_WAIT_FOR_EOF`).
    pub fn set_flag(&mut self, flag: ChannelFlags, on: bool) {
        self.flags.set(flag, on);
    }

    /// Outbound bytes waiting for window.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Number of local data sources feeding this channel.
    pub fn sources(&self) -> u32 {
        self.sources
    }

    /// Declares how many local sources (e.g. stdout and stderr) feed this
    /// channel. EOF goes out once all of them reported EOF.
    pub fn set_sources(&mut self, sources: u32) {
        self.sources = sources.max(1);
    }

    /// Requests we sent that still await a reply.
    pub fn outstanding_requests(&self) -> usize {
        self.sent_requests.len()
    }

    /// Replies we still owe.
    pub fn owed_replies(&self) -> usize {
        self.received_requests.len()
    }

    /// Lifecycle state derived from the flags.
    pub fn state(&self) -> ChannelState {
        let f = self.flags;
        if f.contains(ChannelFlags::SENT_CLOSE | ChannelFlags::RECEIVED_CLOSE) {
            ChannelState::Closed
        } else if f.intersects(ChannelFlags::SENT_CLOSE | ChannelFlags::RECEIVED_CLOSE)
            || f.contains(
                ChannelFlags::CLOSE_AT_EOF | ChannelFlags::SENT_EOF | ChannelFlags::RECEIVED_EOF,
            )
        {
            ChannelState::HalfClosed
        } else {
            ChannelState::Open
        }
    }

    /// Whether CLOSE went both ways.
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    fn writable(&self) -> bool {
        !self
            .flags
            .intersects(ChannelFlags::SENT_EOF | ChannelFlags::EOF_PENDING | ChannelFlags::SENT_CLOSE)
    }

    /// Queues outbound data; `extended` carries the extended data type code.
    ///
    /// # Errors
    ///
    /// Fails once EOF or CLOSE has been sent.
    pub fn queue_data(&mut self, extended: Option<u32>, data: Bytes) -> StrandResult<()> {
        if !self.writable() {
            return Err(StrandError::channel(self.local_id, "Data after EOF or CLOSE"));
        }
        if !data.is_empty() {
            self.pending_bytes += data.len();
            self.pending.push_back((extended, data));
        }
        Ok(())
    }

    fn chunk_limit(&self) -> usize {
        self.send_window_size
            .min(self.send_max_packet)
            .min(MAX_DATA_CHUNK) as usize
    }

    /// Builds one data message, debiting the send window.
    ///
    /// # Errors
    ///
    /// Refuses, before anything is sent, a payload larger than the remaining
    /// window or the peer's maximum packet.
    pub fn transmit(&mut self, extended: Option<u32>, data: Bytes) -> StrandResult<Vec<u8>> {
        let len = data.len();
        if len > self.send_window_size as usize {
            return Err(StrandError::ResourceExhausted(format!(
                "Channel {}: {} bytes exceed the remaining window of {}",
                self.local_id, len, self.send_window_size
            )));
        }
        if len > self.send_max_packet as usize {
            return Err(StrandError::ResourceExhausted(format!(
                "Channel {}: {} bytes exceed the peer's maximum packet of {}",
                self.local_id, len, self.send_max_packet
            )));
        }
        self.send_window_size -= len as u32;
        Ok(ChannelData {
            recipient_channel: self.remote_id,
            data_type: extended,
            data,
        }
        .to_bytes())
    }

    /// Releases as much queued data as the window allows, then a deferred
    /// EOF if the queue emptied. Returns the data bytes released.
    pub fn flush(&mut self, out: &mut Vec<Vec<u8>>) -> usize {
        let mut sent = 0;
        while let Some((extended, mut data)) = self.pending.pop_front() {
            let limit = self.chunk_limit();
            if limit == 0 {
                self.pending.push_front((extended, data));
                break;
            }
            let rest = if data.len() > limit {
                Some(data.split_off(limit))
            } else {
                None
            };
            let len = data.len();
            match self.transmit(extended, data) {
                Ok(payload) => out.push(payload),
                Err(_) => break,
            }
            sent += len;
            self.pending_bytes -= len;
            if let Some(rest) = rest {
                self.pending.push_front((extended, rest));
            }
        }
        if sent > 0 {
            trace!(
                channel = self.local_id,
                sent,
                window = self.send_window_size,
                queued = self.pending_bytes,
                "channel data released"
            );
        }
        if self.pending.is_empty() && self.flags.contains(ChannelFlags::EOF_PENDING) {
            self.flags.remove(ChannelFlags::EOF_PENDING);
            self.emit_eof(out);
        }
        sent
    }

    /// Credits the send window.
    ///
    /// # Errors
    ///
    /// A window pushed past 2^32 - 1 is a protocol violation.
    pub fn on_window_adjust(&mut self, bytes_to_add: u32) -> StrandResult<()> {
        self.send_window_size = self
            .send_window_size
            .checked_add(bytes_to_add)
            .ok_or_else(|| {
                StrandError::malformed(format!(
                    "Channel {}: window adjust of {} overflows the send window",
                    self.local_id, bytes_to_add
                ))
            })?;
        Ok(())
    }

    /// Accounts for inbound data of `len` bytes.
    ///
    /// # Errors
    ///
    /// Data beyond the advertised window or packet size, or after the peer's
    /// EOF or CLOSE, is a protocol violation.
    pub fn on_data(&mut self, len: usize) -> StrandResult<()> {
        if self
            .flags
            .intersects(ChannelFlags::RECEIVED_EOF | ChannelFlags::RECEIVED_CLOSE)
        {
            return Err(StrandError::malformed(format!(
                "Channel {}: data after EOF",
                self.local_id
            )));
        }
        if len > self.rec_max_packet as usize {
            return Err(StrandError::malformed(format!(
                "Channel {}: {} byte data packet exceeds maximum {}",
                self.local_id, len, self.rec_max_packet
            )));
        }
        if len > self.rec_window_size as usize {
            return Err(StrandError::malformed(format!(
                "Channel {}: {} bytes exceed the receive window of {}",
                self.local_id, len, self.rec_window_size
            )));
        }
        self.rec_window_size -= len as u32;
        Ok(())
    }

    /// Whether inbound data should reach the consumer. After we sent CLOSE
    /// the peer may still have data in flight; it is accounted and dropped.
    pub fn accepts_data(&self) -> bool {
        !self.flags.contains(ChannelFlags::SENT_CLOSE)
    }

    /// Records that the consumer drained `n` received bytes. Returns the
    /// WINDOW_ADJUST to send once half the window has been consumed.
    pub fn consume(&mut self, n: usize) -> Option<Vec<u8>> {
        let outstanding = self
            .rec_window_target
            .saturating_sub(self.rec_window_size)
            .saturating_sub(self.consumed);
        let n = u32::try_from(n).unwrap_or(u32::MAX).min(outstanding);
        self.consumed += n;
        if self.consumed == 0
            || self.consumed < self.rec_window_target / 2
            || self.flags.contains(ChannelFlags::SENT_CLOSE)
        {
            return None;
        }
        let adjust = std::mem::take(&mut self.consumed);
        self.rec_window_size += adjust;
        Some(self.window_adjust(adjust))
    }

    /// Opens a receive window that was advertised as zero (or grows it) once
    /// a consumer exists. Returns the WINDOW_ADJUST to send.
    pub fn start_window(&mut self, size: u32) -> Option<Vec<u8>> {
        self.rec_window_target = self.rec_window_target.max(size);
        let credited = self.rec_window_size.saturating_add(self.consumed);
        let adjust = size.saturating_sub(credited);
        if adjust == 0 || self.flags.contains(ChannelFlags::SENT_CLOSE) {
            return None;
        }
        self.rec_window_size += adjust;
        debug!(channel = self.local_id, window = self.rec_window_size, "receive window started");
        Some(self.window_adjust(adjust))
    }

    fn window_adjust(&self, bytes_to_add: u32) -> Vec<u8> {
        ChannelWindowAdjust {
            recipient_channel: self.remote_id,
            bytes_to_add,
        }
        .to_bytes()
    }

    fn emit_eof(&mut self, out: &mut Vec<Vec<u8>>) {
        self.flags.insert(ChannelFlags::SENT_EOF);
        debug!(channel = self.local_id, "sending EOF");
        out.push(recipient_only(MessageType::ChannelEof, self.remote_id));
    }

    /// Sends EOF, after any queued data.
    pub fn send_eof(&mut self, out: &mut Vec<Vec<u8>>) {
        if !self.writable() {
            return;
        }
        if self.pending.is_empty() {
            self.emit_eof(out);
        } else {
            self.flags.insert(ChannelFlags::EOF_PENDING);
        }
    }

    /// One local source reached EOF. The channel EOF goes out once every
    /// source has.
    pub fn source_eof(&mut self, out: &mut Vec<Vec<u8>>) {
        self.sources_at_eof = (self.sources_at_eof + 1).min(self.sources);
        if self.sources_at_eof == self.sources {
            self.send_eof(out);
        }
    }

    /// Records the peer's EOF.
    ///
    /// # Errors
    ///
    /// A second EOF or one after CLOSE is a protocol violation.
    pub fn on_eof(&mut self) -> StrandResult<()> {
        if self
            .flags
            .intersects(ChannelFlags::RECEIVED_EOF | ChannelFlags::RECEIVED_CLOSE)
        {
            return Err(StrandError::malformed(format!(
                "Channel {}: duplicate EOF",
                self.local_id
            )));
        }
        self.flags.insert(ChannelFlags::RECEIVED_EOF);
        Ok(())
    }

    /// Sends CLOSE once `close_at_eof` conditions hold: EOF both ways (or
    /// only ours with `no_wait_for_eof`) and no request in either FIFO.
    pub fn maybe_close(&mut self, out: &mut Vec<Vec<u8>>) -> bool {
        let f = self.flags;
        let ready = f.contains(ChannelFlags::CLOSE_AT_EOF | ChannelFlags::SENT_EOF)
            && f.intersects(ChannelFlags::RECEIVED_EOF | ChannelFlags::NO_WAIT_FOR_EOF)
            && self.sent_requests.is_empty()
            && self.received_requests.is_empty();
        if ready && !f.contains(ChannelFlags::SENT_CLOSE) {
            self.close(out);
            return true;
        }
        false
    }

    /// Sends CLOSE if not already sent. Queued data is discarded.
    pub fn close(&mut self, out: &mut Vec<Vec<u8>>) {
        if self.flags.contains(ChannelFlags::SENT_CLOSE) {
            return;
        }
        self.pending.clear();
        self.pending_bytes = 0;
        self.flags.remove(ChannelFlags::EOF_PENDING);
        self.flags.insert(ChannelFlags::SENT_CLOSE);
        debug!(channel = self.local_id, "sending CLOSE");
        out.push(recipient_only(MessageType::ChannelClose, self.remote_id));
    }

    /// Records the peer's CLOSE and answers it.
    pub fn on_close(&mut self, out: &mut Vec<Vec<u8>>) {
        self.flags.insert(ChannelFlags::RECEIVED_CLOSE);
        self.close(out);
    }

    /// Builds a CHANNEL_REQUEST. With `want_reply`, `token` joins the FIFO
    /// the peer's replies are matched against.
    ///
    /// # Errors
    ///
    /// Fails once CLOSE has been sent.
    pub fn request(
        &mut self,
        request: ChannelRequestType,
        want_reply: bool,
        token: RequestToken,
    ) -> StrandResult<Vec<u8>> {
        if self.flags.contains(ChannelFlags::SENT_CLOSE) {
            return Err(StrandError::channel(self.local_id, "Request after CLOSE"));
        }
        if want_reply {
            self.sent_requests.push(token, request.name().to_string());
        }
        Ok(ChannelRequest {
            recipient_channel: self.remote_id,
            want_reply,
            request,
        }
        .to_bytes())
    }

    /// Matches CHANNEL_SUCCESS/FAILURE to the oldest request we sent.
    pub fn on_reply(&mut self) -> StrandResult<(RequestToken, String)> {
        self.sent_requests.pop_reply("channel")
    }

    /// Fails every request still awaiting a reply.
    pub fn abort_requests(&mut self) -> Vec<RequestToken> {
        self.sent_requests
            .abort()
            .into_iter()
            .map(|(token, _)| token)
            .collect()
    }

    /// Records a received request that wants a reply.
    pub fn push_received(&mut self, token: RequestToken) {
        self.received_requests.push(token, ());
    }

    /// Answers a received request. Replies are released in receive order
    /// by [`drain_replies`](Self::drain_replies).
    ///
    /// # Errors
    ///
    /// Fails if `token` is not awaiting an answer on this channel.
    pub fn resolve(&mut self, token: RequestToken, success: bool) -> StrandResult<()> {
        let resolution = if success {
            Resolution::Success(Vec::new())
        } else {
            Resolution::Failure
        };
        if self.received_requests.resolve(token, resolution) {
            Ok(())
        } else {
            Err(StrandError::channel(
                self.local_id,
                format!("No pending request {}", token),
            ))
        }
    }

    /// Emits every reply whose turn has come.
    pub fn drain_replies(&mut self, out: &mut Vec<Vec<u8>>) {
        while let Some((token, _, resolution)) = self.received_requests.pop_ready() {
            if self.flags.contains(ChannelFlags::SENT_CLOSE) {
                continue;
            }
            let kind = if resolution.is_success() {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            trace!(channel = self.local_id, token = %token, reply = %kind, "channel reply");
            out.push(recipient_only(kind, self.remote_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(rec_window: u32, send_window: u32, send_max: u32) -> Channel {
        Channel::new(0, 7, "session", rec_window, 32768, send_window, send_max)
    }

    fn total_data(out: &[Vec<u8>]) -> usize {
        out.iter()
            .filter(|m| m[0] == MessageType::ChannelData as u8)
            .map(|m| m.len() - ChannelData::overhead(false))
            .sum()
    }

    #[test]
    fn test_send_blocks_at_window() {
        let mut ch = channel(0, 10000, 16384);
        ch.queue_data(None, Bytes::from(vec![1u8; 15000])).unwrap();
        let mut out = Vec::new();
        assert_eq!(ch.flush(&mut out), 10000);
        assert_eq!(total_data(&out), 10000);
        assert_eq!(ch.send_window_size(), 0);
        assert_eq!(ch.pending_bytes(), 5000);

        ch.on_window_adjust(2000).unwrap();
        out.clear();
        assert_eq!(ch.flush(&mut out), 2000);
        assert_eq!(ch.pending_bytes(), 3000);
    }

    #[test]
    fn test_chunks_respect_max_packet() {
        let mut ch = channel(0, 1 << 20, 1000);
        ch.queue_data(None, Bytes::from(vec![0u8; 2500])).unwrap();
        let mut out = Vec::new();
        ch.flush(&mut out);
        let sizes: Vec<usize> = out.iter().map(|m| m.len() - 9).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[test]
    fn test_transmit_rejects_oversized_payload() {
        let mut ch = channel(0, 100, 1000);
        assert!(matches!(
            ch.transmit(None, Bytes::from(vec![0u8; 101])),
            Err(StrandError::ResourceExhausted(_))
        ));
        assert_eq!(ch.send_window_size(), 100);
        ch.transmit(None, Bytes::from(vec![0u8; 100])).unwrap();
        assert_eq!(ch.send_window_size(), 0);
    }

    #[test]
    fn test_window_adjust_overflow() {
        let mut ch = channel(0, u32::MAX - 1, 1000);
        assert!(ch.on_window_adjust(1).is_ok());
        assert!(ch.on_window_adjust(1).is_err());
    }

    #[test]
    fn test_receive_window_enforced() {
        let mut ch = channel(100, 0, 0);
        ch.on_data(60).unwrap();
        assert_eq!(ch.rec_window_size(), 40);
        assert!(ch.on_data(41).is_err());
    }

    #[test]
    fn test_consume_adjusts_at_half_window() {
        let mut ch = channel(1000, 0, 0);
        ch.on_data(600).unwrap();
        assert!(ch.consume(300).is_none());
        let adjust = ch.consume(300).unwrap();
        let parsed = ChannelWindowAdjust::from_bytes(&adjust).unwrap();
        assert_eq!(parsed.recipient_channel, 7);
        assert_eq!(parsed.bytes_to_add, 600);
        assert_eq!(ch.rec_window_size(), 1000);
        // Consuming more than was received credits nothing extra.
        assert!(ch.consume(5000).is_none());
    }

    #[test]
    fn test_zero_window_until_started() {
        let mut ch = channel(0, 0, 0);
        assert!(ch.on_data(1).is_err());
        let adjust = ch.start_window(4096).unwrap();
        assert_eq!(ChannelWindowAdjust::from_bytes(&adjust).unwrap().bytes_to_add, 4096);
        ch.on_data(4096).unwrap();
        assert!(ch.start_window(4096).is_none());
    }

    #[test]
    fn test_eof_waits_for_queued_data() {
        let mut ch = channel(0, 0, 1000);
        ch.queue_data(None, Bytes::from_static(b"tail")).unwrap();
        let mut out = Vec::new();
        ch.send_eof(&mut out);
        assert!(out.is_empty());
        assert!(ch.queue_data(None, Bytes::from_static(b"more")).is_err());

        ch.on_window_adjust(10).unwrap();
        ch.flush(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1][0], MessageType::ChannelEof as u8);
        assert!(ch.flags().contains(ChannelFlags::SENT_EOF));
    }

    #[test]
    fn test_sources_gate_eof() {
        let mut ch = channel(0, 100, 100);
        ch.set_sources(2);
        let mut out = Vec::new();
        ch.source_eof(&mut out);
        assert!(out.is_empty());
        ch.source_eof(&mut out);
        assert_eq!(out, vec![recipient_only(MessageType::ChannelEof, 7)]);
    }

    #[test]
    fn test_close_at_eof() {
        let mut ch = channel(100, 100, 100);
        let mut out = Vec::new();
        ch.send_eof(&mut out);
        assert!(!ch.maybe_close(&mut out));
        ch.on_eof().unwrap();
        assert_eq!(ch.state(), ChannelState::HalfClosed);
        assert!(ch.maybe_close(&mut out));
        assert!(ch.flags().contains(ChannelFlags::SENT_CLOSE));

        ch.on_close(&mut out);
        assert!(ch.is_closed());
        // CLOSE was already sent; the reply is not duplicated.
        assert_eq!(
            out.iter().filter(|m| m[0] == MessageType::ChannelClose as u8).count(),
            1
        );
    }

    #[test]
    fn test_close_deferred_by_cleared_flag_and_requests() {
        let mut ch = channel(100, 100, 100);
        ch.set_flag(ChannelFlags::CLOSE_AT_EOF, false);
        let mut out = Vec::new();
        ch.send_eof(&mut out);
        ch.on_eof().unwrap();
        assert!(!ch.maybe_close(&mut out));

        ch.set_flag(ChannelFlags::CLOSE_AT_EOF, true);
        ch.push_received(RequestToken::new(1));
        assert!(!ch.maybe_close(&mut out));
        ch.resolve(RequestToken::new(1), true).unwrap();
        ch.drain_replies(&mut out);
        assert!(ch.maybe_close(&mut out));
    }

    #[test]
    fn test_no_wait_for_eof() {
        let mut ch = channel(100, 100, 100);
        ch.set_flag(ChannelFlags::NO_WAIT_FOR_EOF, true);
        let mut out = Vec::new();
        ch.send_eof(&mut out);
        assert!(ch.maybe_close(&mut out));
    }

    #[test]
    fn test_peer_close_is_answered() {
        let mut ch = channel(100, 100, 100);
        let mut out = Vec::new();
        ch.on_close(&mut out);
        assert_eq!(out, vec![recipient_only(MessageType::ChannelClose, 7)]);
        assert!(ch.is_closed());
    }

    #[test]
    fn test_replies_leave_in_receive_order() {
        let mut ch = channel(100, 100, 100);
        let (r1, r2) = (RequestToken::new(1), RequestToken::new(2));
        ch.push_received(r1);
        ch.push_received(r2);
        let mut out = Vec::new();

        ch.resolve(r2, true).unwrap();
        ch.drain_replies(&mut out);
        assert!(out.is_empty());

        ch.resolve(r1, false).unwrap();
        ch.drain_replies(&mut out);
        assert_eq!(
            out,
            vec![
                recipient_only(MessageType::ChannelFailure, 7),
                recipient_only(MessageType::ChannelSuccess, 7),
            ]
        );
    }

    #[test]
    fn test_sent_requests_matched_in_order() {
        let mut ch = channel(100, 100, 100);
        ch.request(ChannelRequestType::Shell, true, RequestToken::new(10)).unwrap();
        ch.request(ChannelRequestType::Eow, false, RequestToken::new(11)).unwrap();
        ch.request(
            ChannelRequestType::Exec {
                command: "ls".into(),
            },
            true,
            RequestToken::new(12),
        )
        .unwrap();
        assert_eq!(ch.outstanding_requests(), 2);
        assert_eq!(ch.on_reply().unwrap(), (RequestToken::new(10), "shell".to_string()));
        assert_eq!(ch.on_reply().unwrap().0, RequestToken::new(12));
        assert!(ch.on_reply().is_err());
    }
}
