//! Local channel number allocation and connection-wide request queues.

use strand_platform::{StrandError, StrandResult};
use tracing::{debug, trace};

use super::channel::Channel;
use super::messages::GlobalRequestType;
use super::requests::{ReceivedRequests, SentRequests};

/// A local channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The number as sent on the wire.
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a reserved slot is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// We sent CHANNEL_OPEN and wait for the confirmation.
    Outbound {
        /// Channel type name
        kind: String,
        /// Window we advertised
        window: u32,
        /// Maximum packet we advertised
        max_packet: u32,
    },
    /// The peer's CHANNEL_OPEN awaits a deferred decision.
    Inbound {
        /// Channel type name
        kind: String,
        /// Peer's channel number
        remote_id: u32,
        /// Peer's initial window
        send_window: u32,
        /// Peer's maximum packet
        send_max_packet: u32,
    },
}

#[derive(Debug)]
enum Slot {
    Free,
    Reserved(Reservation),
    InUse(Box<Channel>),
}

/// Occupancy of one channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never allocated or released
    Free,
    /// Allocated while an open is outstanding
    Reserved,
    /// Open channel
    InUse,
}

/// A forwarded TCP port registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPort {
    /// Bind address as named in the request
    pub address: String,
    /// Port number
    pub port: u32,
}

/// The channel slots of one connection plus the global request FIFOs.
#[derive(Debug)]
pub struct ChannelTable {
    slots: Vec<Slot>,
    cursor: usize,
    used: usize,
    max_channels: usize,
    local_forwards: Vec<ForwardedPort>,
    remote_forwards: Vec<ForwardedPort>,
    sent_global: SentRequests<GlobalRequestType>,
    received_global: ReceivedRequests<GlobalRequestType>,
}

impl ChannelTable {
    /// Creates an empty table holding at most `max_channels` channels.
    pub fn new(max_channels: usize) -> Self {
        Self {
            slots: Vec::new(),
            cursor: 0,
            used: 0,
            max_channels,
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
            sent_global: SentRequests::default(),
            received_global: ReceivedRequests::default(),
        }
    }

    /// Number of reserved or open channels.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether no channel is allocated.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Whether every channel number is taken.
    pub fn is_full(&self) -> bool {
        self.used >= self.max_channels
    }

    /// Allocates the lowest free channel number.
    ///
    /// # Errors
    ///
    /// [`StrandError::ResourceExhausted`] once `max_channels` are allocated.
    pub fn reserve(&mut self, reservation: Reservation) -> StrandResult<ChannelId> {
        if self.is_full() {
            return Err(StrandError::ResourceExhausted(format!(
                "Channel table full ({} channels)",
                self.max_channels
            )));
        }
        let index = match self.slots[self.cursor..]
            .iter()
            .position(|s| matches!(s, Slot::Free))
        {
            Some(offset) => self.cursor + offset,
            None => {
                self.slots.push(Slot::Free);
                self.slots.len() - 1
            }
        };
        let raw = u32::try_from(index)
            .map_err(|_| StrandError::ResourceExhausted("Channel numbers exhausted".into()))?;
        self.slots[index] = Slot::Reserved(reservation);
        self.used += 1;
        self.cursor = index + 1;
        trace!(channel = raw, used = self.used, "channel reserved");
        Ok(ChannelId::new(raw))
    }

    /// Occupancy of the channel number `raw`.
    pub fn state(&self, raw: u32) -> SlotState {
        match self.slots.get(raw as usize) {
            Some(Slot::Reserved(_)) => SlotState::Reserved,
            Some(Slot::InUse(_)) => SlotState::InUse,
            _ => SlotState::Free,
        }
    }

    /// The pending reservation for `id`.
    pub fn reservation(&self, id: ChannelId) -> Option<&Reservation> {
        match self.slots.get(id.index()) {
            Some(Slot::Reserved(r)) => Some(r),
            _ => None,
        }
    }

    /// Turns a reservation into an open channel.
    ///
    /// # Errors
    ///
    /// Fails unless `id` is reserved.
    pub fn activate(&mut self, id: ChannelId, channel: Channel) -> StrandResult<&mut Channel> {
        match self.slots.get_mut(id.index()) {
            Some(slot) if matches!(slot, Slot::Reserved(_)) => {
                *slot = Slot::InUse(Box::new(channel));
                debug!(channel = id.raw(), "channel open");
            }
            _ => {
                return Err(StrandError::channel(id.raw(), "Channel is not reserved"));
            }
        }
        self.get_mut(id)
            .ok_or_else(|| StrandError::channel(id.raw(), "Channel vanished"))
    }

    /// Frees a reserved or open slot, returning the channel if it was open.
    pub fn release(&mut self, id: ChannelId) -> Option<Box<Channel>> {
        let slot = self.slots.get_mut(id.index())?;
        let previous = std::mem::replace(slot, Slot::Free);
        if matches!(previous, Slot::Free) {
            return None;
        }
        self.used -= 1;
        self.cursor = self.cursor.min(id.index());
        while matches!(self.slots.last(), Some(Slot::Free)) {
            self.slots.pop();
        }
        self.cursor = self.cursor.min(self.slots.len());
        trace!(channel = id.raw(), used = self.used, "channel released");
        match previous {
            Slot::InUse(channel) => Some(channel),
            _ => None,
        }
    }

    /// Looks up an open channel by wire number.
    pub fn lookup(&self, raw: u32) -> Option<ChannelId> {
        match self.state(raw) {
            SlotState::InUse => Some(ChannelId::new(raw)),
            _ => None,
        }
    }

    /// The open channel `id`.
    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        match self.slots.get(id.index()) {
            Some(Slot::InUse(ch)) => Some(ch),
            _ => None,
        }
    }

    /// The open channel `id`, mutably.
    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::InUse(ch)) => Some(ch),
            _ => None,
        }
    }

    /// Numbers of all open channels, ascending.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.ids_where(|s| matches!(s, Slot::InUse(_)))
    }

    /// Numbers of all reserved slots, ascending.
    pub fn reserved_ids(&self) -> Vec<ChannelId> {
        self.ids_where(|s| matches!(s, Slot::Reserved(_)))
    }

    fn ids_where(&self, pred: impl Fn(&Slot) -> bool) -> Vec<ChannelId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| pred(s))
            .map(|(i, _)| ChannelId::new(i as u32))
            .collect()
    }

    /// Records a port we listen on for the peer.
    pub fn add_local_forward(&mut self, forward: ForwardedPort) {
        self.local_forwards.push(forward);
    }

    /// Drops a local registration. Returns whether it existed.
    pub fn remove_local_forward(&mut self, address: &str, port: u32) -> bool {
        remove_forward(&mut self.local_forwards, address, port)
    }

    /// Ports we listen on for the peer, in registration order.
    pub fn local_forwards(&self) -> &[ForwardedPort] {
        &self.local_forwards
    }

    /// Records a port the peer listens on for us.
    pub fn add_remote_forward(&mut self, forward: ForwardedPort) {
        self.remote_forwards.push(forward);
    }

    /// Drops a remote registration. Returns whether it existed.
    pub fn remove_remote_forward(&mut self, address: &str, port: u32) -> bool {
        remove_forward(&mut self.remote_forwards, address, port)
    }

    /// Ports the peer listens on for us, in registration order.
    pub fn remote_forwards(&self) -> &[ForwardedPort] {
        &self.remote_forwards
    }

    /// Whether the peer may open `forwarded-tcpip` channels for this port.
    pub fn is_remote_forward(&self, address: &str, port: u32) -> bool {
        self.remote_forwards
            .iter()
            .any(|f| f.port == port && f.address == address)
    }

    /// Global requests we sent that await a reply.
    pub fn sent_global(&mut self) -> &mut SentRequests<GlobalRequestType> {
        &mut self.sent_global
    }

    /// Global requests we owe a reply for, with the request itself.
    pub fn received_global(&mut self) -> &mut ReceivedRequests<GlobalRequestType> {
        &mut self.received_global
    }
}

fn remove_forward(list: &mut Vec<ForwardedPort>, address: &str, port: u32) -> bool {
    match list.iter().position(|f| f.port == port && f.address == address) {
        Some(i) => {
            list.remove(i);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound() -> Reservation {
        Reservation::Outbound {
            kind: "session".into(),
            window: 1024,
            max_packet: 512,
        }
    }

    fn open(table: &mut ChannelTable) -> ChannelId {
        let id = table.reserve(outbound()).unwrap();
        table
            .activate(id, Channel::new(id.raw(), 40 + id.raw(), "session", 1024, 512, 1024, 512))
            .unwrap();
        id
    }

    #[test]
    fn test_allocates_lowest_free() {
        let mut table = ChannelTable::new(8);
        let a = open(&mut table);
        let b = open(&mut table);
        let c = open(&mut table);
        assert_eq!((a.raw(), b.raw(), c.raw()), (0, 1, 2));

        assert!(table.release(b).is_some());
        assert_eq!(table.state(1), SlotState::Free);
        assert_eq!(open(&mut table).raw(), 1);
        assert_eq!(open(&mut table).raw(), 3);
    }

    #[test]
    fn test_reserved_number_not_reused() {
        let mut table = ChannelTable::new(8);
        let id = table.reserve(outbound()).unwrap();
        assert_eq!(table.state(id.raw()), SlotState::Reserved);
        assert!(table.lookup(id.raw()).is_none());
        assert_ne!(table.reserve(outbound()).unwrap(), id);
        assert_eq!(table.reserved_ids().len(), 2);
    }

    #[test]
    fn test_cap_is_resource_exhaustion() {
        let mut table = ChannelTable::new(2);
        open(&mut table);
        let second = table.reserve(outbound()).unwrap();
        assert!(table.is_full());
        assert!(matches!(
            table.reserve(outbound()),
            Err(StrandError::ResourceExhausted(_))
        ));
        assert!(table.release(second).is_none());
        assert!(table.reserve(outbound()).is_ok());
    }

    #[test]
    fn test_activate_requires_reservation() {
        let mut table = ChannelTable::new(4);
        let id = open(&mut table);
        let again = Channel::new(id.raw(), 1, "session", 0, 0, 0, 0);
        assert!(table.activate(id, again).is_err());
        assert_eq!(table.get(id).unwrap().remote_id(), 40);
    }

    #[test]
    fn test_release_twice_is_noop() {
        let mut table = ChannelTable::new(4);
        let id = open(&mut table);
        assert!(table.release(id).is_some());
        assert!(table.release(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_forward_registrations() {
        let mut table = ChannelTable::new(4);
        table.add_remote_forward(ForwardedPort {
            address: "0.0.0.0".into(),
            port: 8080,
        });
        assert!(table.is_remote_forward("0.0.0.0", 8080));
        assert!(!table.is_remote_forward("0.0.0.0", 8081));
        assert!(table.remove_remote_forward("0.0.0.0", 8080));
        assert!(!table.remove_remote_forward("0.0.0.0", 8080));
        assert!(table.remote_forwards().is_empty());
    }
}
