//! Session manager state: per-peer connection state machine and reliable, ordered channels.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::info::{DiscoveryInfo, DisplayName};
use crate::protocol::{DataKind, InvitationId, SessionMessage};

/// Per-peer connection state. Numeric values match the platform framework's
/// (`notConnected = 0`, `connecting = 1`, `connected = 2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotConnected => f.write_str("not connected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: DisplayName,
    pub discovery_info: DiscoveryInfo,
    pub state: ConnectionState,
    pub transport_addr: Option<SocketAddr>,
}

/// How this side got into the session; decides which message completes the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We invited; `Accept` completes.
    Inviter { invitation_id: InvitationId },
    /// We accepted; the inviter's `Confirm` completes, before `deadline`.
    Invitee {
        invitation_id: InvitationId,
        deadline: Instant,
    },
}

/// Reliable channel for one session: sequence numbers, retransmission, dedup, reordering.
///
/// Sender side keeps every unacknowledged payload and resends it after the ack timeout.
/// Receiver side delivers each sequence number exactly once and in order, and answers
/// with a cumulative ack.
#[derive(Debug)]
pub struct ReliableChannel {
    next_seq: u64,
    unacked: VecDeque<Unacked>,
    next_expected: u64,
    reorder: BTreeMap<u64, (DataKind, Vec<u8>)>,
}

#[derive(Debug)]
struct Unacked {
    seq: u64,
    kind: DataKind,
    payload: Vec<u8>,
    sent_at: Instant,
    attempts: u32,
}

/// Out-of-order payloads buffered at most this far ahead of the next expected sequence number.
const REORDER_WINDOW: u64 = 1024;

/// Retransmission limit reached; the session is considered broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitExhausted {
    pub seq: u64,
}

impl Default for ReliableChannel {
    fn default() -> Self {
        Self {
            next_seq: 1,
            unacked: VecDeque::new(),
            next_expected: 1,
            reorder: BTreeMap::new(),
        }
    }
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload. Returns its sequence number and the message to put on the link.
    pub fn push(&mut self, kind: DataKind, payload: Vec<u8>, now: Instant) -> (u64, SessionMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = SessionMessage::Data {
            seq,
            kind,
            payload: payload.clone(),
        };
        self.unacked.push_back(Unacked {
            seq,
            kind,
            payload,
            sent_at: now,
            attempts: 1,
        });
        (seq, msg)
    }

    /// Cumulative ack from the peer. Returns newly acknowledged sequence numbers, in order.
    pub fn on_ack(&mut self, seq: u64) -> Vec<u64> {
        let mut acked = Vec::new();
        while let Some(front) = self.unacked.front() {
            if front.seq > seq {
                break;
            }
            acked.push(front.seq);
            self.unacked.pop_front();
        }
        acked
    }

    /// Incoming payload. Returns payloads now deliverable in order, plus the cumulative
    /// ack to send back. Duplicates deliver nothing but are still acked.
    pub fn on_data(
        &mut self,
        seq: u64,
        kind: DataKind,
        payload: Vec<u8>,
    ) -> (Vec<(DataKind, Vec<u8>)>, u64) {
        if seq >= self.next_expected && seq < self.next_expected + REORDER_WINDOW {
            self.reorder.entry(seq).or_insert((kind, payload));
        }
        let mut ready = Vec::new();
        while let Some(item) = self.reorder.remove(&self.next_expected) {
            ready.push(item);
            self.next_expected += 1;
        }
        (ready, self.next_expected - 1)
    }

    /// Messages to resend because their ack is overdue.
    pub fn due_retransmits(
        &mut self,
        now: Instant,
        ack_timeout: Duration,
        max_retransmits: u32,
    ) -> Result<Vec<SessionMessage>, RetransmitExhausted> {
        let mut out = Vec::new();
        for pending in self.unacked.iter_mut() {
            if now.saturating_duration_since(pending.sent_at) < ack_timeout {
                continue;
            }
            if pending.attempts > max_retransmits {
                return Err(RetransmitExhausted { seq: pending.seq });
            }
            pending.attempts += 1;
            pending.sent_at = now;
            out.push(SessionMessage::Data {
                seq: pending.seq,
                kind: pending.kind,
                payload: pending.payload.clone(),
            });
        }
        Ok(out)
    }

    /// Sequence numbers still waiting for an ack; clears them.
    pub fn drain_unacked(&mut self) -> Vec<u64> {
        self.unacked.drain(..).map(|u| u.seq).collect()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }
}

#[derive(Debug)]
pub struct SessionPeer {
    pub record: PeerRecord,
    pub role: Role,
    pub channel: ReliableChannel,
    pub last_heard: Instant,
    pub last_sent: Instant,
}

/// A state transition to report, already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub peer: PeerId,
    pub display_name: DisplayName,
    pub state: ConnectionState,
}

/// A session peer that left the table, with the sends it never got acked.
#[derive(Debug)]
pub struct Departed {
    pub change: StateChange,
    pub unacked: Vec<u64>,
}

/// Connecting and connected peers. A peer not in the table is `NotConnected`.
#[derive(Debug, Default)]
pub struct SessionTable {
    peers: HashMap<PeerId, SessionPeer>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.peers
            .get(peer)
            .map(|p| p.record.state)
            .unwrap_or(ConnectionState::NotConnected)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&SessionPeer> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut SessionPeer> {
        self.peers.get_mut(peer)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().map(|p| &p.record)
    }

    /// `NotConnected -> Connecting`. `None` if the peer is already in a session.
    pub fn begin(&mut self, mut record: PeerRecord, role: Role, now: Instant) -> Option<StateChange> {
        if self.peers.contains_key(&record.id) {
            return None;
        }
        record.state = ConnectionState::Connecting;
        let change = StateChange {
            peer: record.id,
            display_name: record.display_name.clone(),
            state: ConnectionState::Connecting,
        };
        self.peers.insert(
            record.id,
            SessionPeer {
                record,
                role,
                channel: ReliableChannel::new(),
                last_heard: now,
                last_sent: now,
            },
        );
        Some(change)
    }

    /// `Connecting -> Connected`. `None` unless the peer is connecting.
    pub fn connect(&mut self, peer: &PeerId, now: Instant) -> Option<StateChange> {
        let p = self.peers.get_mut(peer)?;
        if p.record.state != ConnectionState::Connecting {
            return None;
        }
        p.record.state = ConnectionState::Connected;
        p.channel = ReliableChannel::new();
        p.last_heard = now;
        Some(StateChange {
            peer: *peer,
            display_name: p.record.display_name.clone(),
            state: ConnectionState::Connected,
        })
    }

    /// `Connecting | Connected -> NotConnected`.
    pub fn remove(&mut self, peer: &PeerId) -> Option<Departed> {
        let mut p = self.peers.remove(peer)?;
        let unacked = p.channel.drain_unacked();
        Some(Departed {
            change: StateChange {
                peer: *peer,
                display_name: p.record.display_name.clone(),
                state: ConnectionState::NotConnected,
            },
            unacked,
        })
    }
}
