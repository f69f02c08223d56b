//! MQTT Session Management
//!
//! A [`Session`] is the per-client record: subscriptions, QoS in-flight
//! tables, the packet identifier generator and, while a connection owns it,
//! the outbound queue that connection's sender drains. Records for
//! persistent sessions (clean_session=false) outlive their connection and
//! are reattached on resume.

mod queue;
mod registry;

pub use queue::{OutboundQueue, OverflowPolicy, PushOutcome};
pub use registry::{Claim, ClaimOrigin, RegistryError, SessionRegistry};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::{Packet, ProtocolVersion, PubRel, Publish, QoS, Will};
use crate::store::StoredSession;

/// Session shared between its connection and the dispatcher
pub type SharedSession = Arc<Mutex<Session>>;

/// Connection-level protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for CONNECT
    New,
    Connected,
    /// DISCONNECT received, tearing down without the will
    Disconnecting,
    Disconnected,
}

/// Which side originated an in-flight message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Published by this client, held until PUBREL (QoS 2)
    Inbound,
    /// Sent to this client, held until PUBACK/PUBCOMP
    Outbound,
}

/// QoS 2 message state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    WaitingPubRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    WaitingPubComp,
}

/// Inflight message state for QoS 1/2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub direction: Direction,
    pub publish: Publish,
    /// Only set for outbound QoS 2
    pub qos2_state: Option<Qos2State>,
    /// Last time the message (or its PUBREL) was sent
    pub sent_at: Instant,
}

impl InflightMessage {
    fn outbound(publish: Publish) -> Self {
        let qos2_state = (publish.qos == QoS::ExactlyOnce).then_some(Qos2State::WaitingPubRec);
        Self {
            packet_id: publish.packet_id.unwrap_or_default(),
            direction: Direction::Outbound,
            publish,
            qos2_state,
            sent_at: Instant::now(),
        }
    }

    fn inbound(packet_id: u16, publish: Publish) -> Self {
        Self {
            packet_id,
            direction: Direction::Inbound,
            publish,
            qos2_state: None,
            sent_at: Instant::now(),
        }
    }

    /// Frame to resend for an unacknowledged outbound message
    fn resend_packet(&self) -> Packet {
        match self.qos2_state {
            Some(Qos2State::WaitingPubComp) => Packet::PubRel(PubRel::new(self.packet_id)),
            _ => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
        }
    }
}

/// Where a routed message goes after the session has accepted it
#[derive(Debug)]
pub enum Outbound {
    /// Push this publish onto the attached queue
    Send(Arc<OutboundQueue>, Publish),
    /// Held for a persistent session with no connection
    Queued,
    /// Dropped (QoS 0 to a detached session, or a clean session without a connection)
    Discarded,
}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    /// Will published on ungraceful close
    pub will: Option<Will>,
    /// Filter -> granted QoS
    pub subscriptions: HashMap<String, QoS>,
    /// Messages sent to the client awaiting PUBACK/PUBREC/PUBCOMP
    pub inflight_outgoing: HashMap<u16, InflightMessage>,
    /// QoS 2 messages from the client awaiting PUBREL
    pub inflight_incoming: HashMap<u16, InflightMessage>,
    next_packet_id: u16,
    /// Messages routed while no connection was attached
    pending: VecDeque<Publish>,
    max_pending: usize,
    outbound: Option<Arc<OutboundQueue>>,
    /// Connection id of the current owner (0 when detached)
    owner: u64,
}

impl Session {
    pub fn new(
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        clean_session: bool,
        max_pending: usize,
    ) -> Self {
        Self {
            client_id,
            protocol_version,
            clean_session,
            keep_alive: 0,
            username: None,
            will: None,
            subscriptions: HashMap::new(),
            inflight_outgoing: HashMap::new(),
            inflight_incoming: HashMap::new(),
            next_packet_id: 1,
            pending: VecDeque::new(),
            max_pending,
            outbound: None,
            owner: 0,
        }
    }

    /// Rebuild a persistent session from its stored snapshot
    pub fn restore(client_id: Arc<str>, stored: StoredSession, max_pending: usize) -> Self {
        let mut session = Self::new(client_id, stored.protocol_version, false, max_pending);
        session.subscriptions = stored.subscriptions.into_iter().collect();
        session.inflight_outgoing = stored
            .inflight_outgoing
            .into_iter()
            .map(|m| (m.packet_id, m))
            .collect();
        session.inflight_incoming = stored
            .inflight_incoming
            .into_iter()
            .map(|m| (m.packet_id, m))
            .collect();
        session.pending = stored.pending.into();
        session.next_packet_id = session
            .inflight_outgoing
            .keys()
            .max()
            .map_or(1, |id| id.wrapping_add(1).max(1));
        session
    }

    /// Snapshot of the state that survives a disconnect
    pub fn snapshot(&self) -> StoredSession {
        let mut subscriptions: Vec<(String, QoS)> = self
            .subscriptions
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect();
        subscriptions.sort();
        let mut inflight_outgoing: Vec<InflightMessage> =
            self.inflight_outgoing.values().cloned().collect();
        inflight_outgoing.sort_by_key(|m| m.sent_at);
        let mut inflight_incoming: Vec<InflightMessage> =
            self.inflight_incoming.values().cloned().collect();
        inflight_incoming.sort_by_key(|m| m.packet_id);

        StoredSession {
            protocol_version: self.protocol_version,
            subscriptions,
            inflight_outgoing,
            inflight_incoming,
            pending: self.pending.iter().cloned().collect(),
        }
    }

    /// Generate next packet identifier
    pub fn next_packet_id(&mut self) -> u16 {
        // Identifiers still in flight are skipped; 0 is never valid
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.inflight_outgoing.contains_key(&id) {
                return id;
            }
        }
        // Every identifier is in flight: reuse the current one
        self.next_packet_id
    }

    /// Make `owner` the connection holding this session.
    ///
    /// Returns the queue of the previous owner, now detached. The new
    /// owner's queue is attached separately once CONNACK is queued.
    pub fn claim(&mut self, owner: u64) -> Option<Arc<OutboundQueue>> {
        self.owner = owner;
        self.outbound.take()
    }

    /// Attach the owner's outbound queue. Fails if another connection has
    /// claimed the session since.
    pub fn attach(&mut self, owner: u64, queue: Arc<OutboundQueue>) -> bool {
        if self.owner != owner {
            return false;
        }
        self.outbound = Some(queue);
        true
    }

    /// Unbind the session if `owner` still holds it
    pub fn detach(&mut self, owner: u64) -> bool {
        if self.owner != owner {
            return false;
        }
        self.owner = 0;
        self.outbound = None;
        true
    }

    pub fn is_owned_by(&self, owner: u64) -> bool {
        self.owner != 0 && self.owner == owner
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn outbound(&self) -> Option<Arc<OutboundQueue>> {
        self.outbound.clone()
    }

    /// Accept a routed publish for delivery at `qos`.
    ///
    /// QoS 1/2 messages get a packet identifier and an outbound in-flight
    /// record before they are handed back for queueing.
    pub fn prepare_outbound(&mut self, publish: &Publish, qos: QoS) -> Outbound {
        let mut out = publish.clone();
        out.qos = qos;
        out.dup = false;
        out.packet_id = None;

        let Some(queue) = self.outbound.clone() else {
            if !self.clean_session && qos > QoS::AtMostOnce {
                self.queue_pending(out);
                return Outbound::Queued;
            }
            return Outbound::Discarded;
        };

        Outbound::Send(queue, self.track_outbound(out))
    }

    /// Give a QoS 1/2 message its packet identifier and in-flight record
    fn track_outbound(&mut self, mut publish: Publish) -> Publish {
        if publish.qos > QoS::AtMostOnce {
            let packet_id = self.next_packet_id();
            publish.packet_id = Some(packet_id);
            self.inflight_outgoing
                .insert(packet_id, InflightMessage::outbound(publish.clone()));
        }
        publish
    }

    /// Hold a message for a detached session (drops oldest when full)
    pub fn queue_pending(&mut self, publish: Publish) -> bool {
        if self.max_pending == 0 {
            return false;
        }
        let dropped = if self.pending.len() >= self.max_pending {
            self.pending.pop_front();
            true
        } else {
            false
        };
        self.pending.push_back(publish);
        !dropped
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain pending messages
    pub fn drain_pending(&mut self) -> Vec<Publish> {
        self.pending.drain(..).collect()
    }

    /// Drain pending messages as frames ready to send, tracked in flight
    pub fn release_pending(&mut self) -> Vec<Packet> {
        let pending = self.drain_pending();
        pending
            .into_iter()
            .map(|publish| Packet::Publish(self.track_outbound(publish)))
            .collect()
    }

    /// Record an inbound QoS 2 publish. Returns `false` for a duplicate.
    pub fn record_inbound(&mut self, packet_id: u16, publish: Publish) -> bool {
        if self.inflight_incoming.contains_key(&packet_id) {
            return false;
        }
        self.inflight_incoming
            .insert(packet_id, InflightMessage::inbound(packet_id, publish));
        true
    }

    /// Complete an inbound QoS 2 handshake (PUBREL received)
    pub fn release_inbound(&mut self, packet_id: u16) -> Option<Publish> {
        self.inflight_incoming
            .remove(&packet_id)
            .map(|m| m.publish)
    }

    /// PUBACK for a QoS 1 message
    pub fn acknowledge(&mut self, packet_id: u16) -> bool {
        match self.inflight_outgoing.get(&packet_id) {
            Some(m) if m.publish.qos == QoS::AtLeastOnce => {
                self.inflight_outgoing.remove(&packet_id);
                true
            }
            _ => false,
        }
    }

    /// PUBREC for a QoS 2 message: advance to waiting for PUBCOMP
    pub fn receive_pubrec(&mut self, packet_id: u16) -> bool {
        match self.inflight_outgoing.get_mut(&packet_id) {
            Some(m) if m.qos2_state.is_some() => {
                m.qos2_state = Some(Qos2State::WaitingPubComp);
                m.sent_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP for a QoS 2 message
    pub fn complete(&mut self, packet_id: u16) -> bool {
        match self.inflight_outgoing.get(&packet_id) {
            Some(m) if m.qos2_state == Some(Qos2State::WaitingPubComp) => {
                self.inflight_outgoing.remove(&packet_id);
                true
            }
            _ => false,
        }
    }

    /// Frames to resend after a resume, oldest first
    pub fn redelivery(&mut self) -> Vec<Packet> {
        self.resend_where(|_| true)
    }

    /// Frames for records unacknowledged for longer than `interval`
    pub fn expired_inflight(&mut self, interval: Duration) -> Vec<Packet> {
        let now = Instant::now();
        self.resend_where(|m| now.duration_since(m.sent_at) >= interval)
    }

    fn resend_where(&mut self, due: impl Fn(&InflightMessage) -> bool) -> Vec<Packet> {
        let mut due_msgs: Vec<&mut InflightMessage> = self
            .inflight_outgoing
            .values_mut()
            .filter(|m| due(m))
            .collect();
        due_msgs.sort_by_key(|m| (m.sent_at, m.packet_id));

        let now = Instant::now();
        due_msgs
            .into_iter()
            .map(|m| {
                m.sent_at = now;
                m.resend_packet()
            })
            .collect()
    }
}
