//! Host-driven API: NearbyCore receives events from the host, returns actions.
//!
//! The host owns sockets and clocks. It feeds datagrams, link up/down notifications,
//! decoded link messages and periodic ticks (with the current `Instant`) into the core,
//! then performs the returned actions in order. Actions that report to the application
//! (`Emit`, `InviteSettled`, `SendSettled`) are only produced after the state they
//! describe has been updated.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::discovery::{self, Advertiser, DiscoveryTable};
use crate::event::{Event, PeerInfo};
use crate::identity::{LocalIdentity, PeerId, PublicKey};
use crate::info::{DiscoveryInfo, DisplayName, InvitationContext, ServiceType};
use crate::invitation::{IncomingInvitation, Negotiator, ResolveError, MAX_INVITE_TIMEOUT};
use crate::protocol::{
    DataKind, Datagram, DeclineReason, InvitationId, SessionMessage, PROTOCOL_VERSION,
};
use crate::session::{ConnectionState, PeerRecord, Role, SessionTable};
use crate::wire::MAX_PAYLOAD_LEN;

/// Timers and limits. Defaults suit a LAN.
#[derive(Debug, Clone)]
pub struct Timing {
    pub announce_interval: Duration,
    pub peer_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_retransmits: u32,
    pub heartbeat_interval: Duration,
    pub link_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(4),
            peer_timeout: Duration::from_secs(16),
            ack_timeout: Duration::from_secs(2),
            max_retransmits: 5,
            heartbeat_interval: Duration::from_secs(2),
            link_timeout: Duration::from_secs(10),
        }
    }
}

/// Action for the host to perform, in order.
#[derive(Debug)]
pub enum Action {
    /// Send a datagram to the discovery medium.
    Broadcast(Datagram),
    /// Open a session link to a discovered peer; report `on_link_up` / `on_link_down`.
    Connect {
        peer: PeerId,
        addr: SocketAddr,
        public_key: PublicKey,
    },
    /// Write a message on the peer's link.
    Send {
        peer: PeerId,
        message: SessionMessage,
    },
    /// Flush queued messages, then close the peer's link.
    CloseLink { peer: PeerId },
    /// Publish to the application.
    Emit(Event),
    InviteSettled {
        invitation_id: InvitationId,
        result: Result<(), InviteError>,
    },
    SendSettled {
        peer: PeerId,
        seq: u64,
        result: Result<(), SendError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InviteError {
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),
    #[error("already in a session with {0}")]
    AlreadyConnected(PeerId),
    #[error("an invitation with {0} is already pending")]
    AlreadyPending(PeerId),
    #[error("invitation to {0} timed out")]
    InviteTimeout(PeerId),
    #[error("invitation declined: {0}")]
    Declined(DeclineReason),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invitation cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("send failed: {0}")]
    Transport(String),
    #[error("payload is {0} bytes, max {MAX_PAYLOAD_LEN}")]
    TooLarge(usize),
}

struct Link {
    addr: SocketAddr,
    last_heard: Instant,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct NearbyCore {
    identity: LocalIdentity,
    listen_port: u16,
    timing: Timing,
    advertiser: Advertiser,
    discovery: DiscoveryTable,
    invitations: Negotiator,
    sessions: SessionTable,
    links: HashMap<PeerId, Link>,
    /// Connect issued, link not up yet.
    dialing: HashSet<PeerId>,
    /// Messages waiting for a link that is still being dialed.
    outbox: HashMap<PeerId, Vec<SessionMessage>>,
}

impl NearbyCore {
    pub fn new(identity: LocalIdentity, listen_port: u16, timing: Timing) -> Self {
        let peer_timeout = timing.peer_timeout;
        Self {
            identity,
            listen_port,
            timing,
            advertiser: Advertiser::default(),
            discovery: DiscoveryTable::new(peer_timeout),
            invitations: Negotiator::new(),
            sessions: SessionTable::new(),
            links: HashMap::new(),
            dialing: HashSet::new(),
            outbox: HashMap::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    // ---- discovery -------------------------------------------------------

    /// Start (or restart with a new generation) advertising. Announces at once.
    pub fn start_advertising(
        &mut self,
        service_type: ServiceType,
        display_name: DisplayName,
        discovery_info: DiscoveryInfo,
        now: Instant,
    ) -> Vec<Action> {
        self.identity.set_display_name(display_name.clone());
        self.advertiser
            .start(service_type, display_name, discovery_info, now);
        let mut actions = Vec::new();
        self.announce_if_due(now, &mut actions);
        actions
    }

    /// Stop advertising; says goodbye if it was advertising.
    pub fn stop_advertising(&mut self) -> Vec<Action> {
        match self.advertiser.stop() {
            Some(service_type) => vec![Action::Broadcast(Datagram::Goodbye {
                protocol_version: PROTOCOL_VERSION,
                service_type,
                peer_id: self.peer_id(),
            })],
            None => Vec::new(),
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_active()
    }

    /// Start a fresh browsing session and query for advertisers.
    pub fn start_browsing(&mut self, service_type: ServiceType) -> Vec<Action> {
        self.discovery.start(service_type.clone());
        vec![Action::Broadcast(Datagram::Query {
            protocol_version: PROTOCOL_VERSION,
            service_type,
            peer_id: self.peer_id(),
        })]
    }

    /// Stop browsing. The found set is dropped without notifications.
    pub fn stop_browsing(&mut self) -> Vec<Action> {
        self.discovery.stop();
        Vec::new()
    }

    pub fn is_browsing(&self) -> bool {
        self.discovery.is_browsing()
    }

    /// The discovery medium could not be opened for advertising.
    pub fn advertise_failed(&mut self, reason: String) -> Vec<Action> {
        self.advertiser.stop();
        vec![Action::Emit(Event::AdvertiseError { reason })]
    }

    /// The discovery medium could not be opened for browsing.
    pub fn browse_failed(&mut self, reason: String) -> Vec<Action> {
        self.discovery.stop();
        vec![Action::Emit(Event::BrowseError { reason })]
    }

    /// The discovery medium broke while in use: stop whatever was running.
    pub fn discovery_failed(&mut self, reason: String) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.advertiser.stop().is_some() {
            actions.push(Action::Emit(Event::AdvertiseError {
                reason: reason.clone(),
            }));
        }
        if self.discovery.stop() {
            actions.push(Action::Emit(Event::BrowseError { reason }));
        }
        actions
    }

    /// A datagram arrived from `source`.
    pub fn on_datagram(&mut self, datagram: Datagram, source: IpAddr, now: Instant) -> Vec<Action> {
        if !discovery::is_foreign(&datagram, self.peer_id()) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        match datagram {
            Datagram::Announce(announcement) => {
                if let Some(peer) = self.discovery.observe(&announcement, source, now) {
                    actions.push(Action::Emit(Event::PeerFound {
                        peer: PeerInfo {
                            id: peer.peer_id,
                            display_name: peer.display_name,
                        },
                        discovery_info: peer.discovery_info,
                    }));
                }
            }
            Datagram::Goodbye {
                service_type,
                peer_id,
                ..
            } => {
                if let Some(peer) = self.discovery.goodbye(&service_type, peer_id) {
                    actions.push(Action::Emit(Event::PeerLost {
                        peer: PeerInfo {
                            id: peer.peer_id,
                            display_name: peer.display_name,
                        },
                    }));
                }
            }
            Datagram::Query { service_type, .. } => {
                if self.advertiser.service_type() == Some(&service_type) {
                    if let Some(a) = self.announcement() {
                        actions.push(Action::Broadcast(Datagram::Announce(a)));
                    }
                }
            }
        }
        actions
    }

    fn announcement(&self) -> Option<crate::protocol::Announcement> {
        self.advertiser.announcement(
            self.identity.peer_id(),
            self.identity.public_key(),
            self.listen_port,
        )
    }

    fn announce_if_due(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if self.advertiser.announce_due(now, self.timing.announce_interval) {
            if let Some(a) = self.announcement() {
                actions.push(Action::Broadcast(Datagram::Announce(a)));
            }
        }
    }

    // ---- invitations -----------------------------------------------------

    /// Invite a discovered peer. Fails before touching the network if the peer is
    /// unknown, already in a session, or an invitation with it is pending.
    /// Timeouts above `MAX_INVITE_TIMEOUT` are clamped.
    pub fn invite(
        &mut self,
        peer: PeerId,
        timeout: Duration,
        context: Option<InvitationContext>,
        now: Instant,
    ) -> Result<(InvitationId, Vec<Action>), InviteError> {
        let found = self
            .discovery
            .get(&peer)
            .ok_or(InviteError::PeerNotFound(peer))?;
        if self.invitations.involves(peer) {
            return Err(InviteError::AlreadyPending(peer));
        }
        if self.sessions.contains(&peer) {
            return Err(InviteError::AlreadyConnected(peer));
        }
        let addr = found.addr;
        let public_key = found.public_key.clone();
        let record = PeerRecord {
            id: peer,
            display_name: found.display_name.clone(),
            discovery_info: found.discovery_info.clone(),
            state: ConnectionState::NotConnected,
            transport_addr: Some(addr),
        };

        let timeout = timeout.min(MAX_INVITE_TIMEOUT);
        let invitation_id = self.invitations.begin_outgoing(peer, timeout, now);
        let mut actions = Vec::new();
        if let Some(change) = self
            .sessions
            .begin(record, Role::Inviter { invitation_id }, now)
        {
            actions.push(Action::Emit(Event::state_changed(&change)));
        }
        if !self.links.contains_key(&peer) && self.dialing.insert(peer) {
            actions.push(Action::Connect {
                peer,
                addr,
                public_key,
            });
        }
        let invite = SessionMessage::Invite {
            invitation_id,
            display_name: self.identity.display_name().clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            context,
        };
        self.send_or_queue(peer, invite, now, &mut actions);
        Ok((invitation_id, actions))
    }

    /// Application decision on a received invitation.
    pub fn resolve_invitation(
        &mut self,
        invitation_id: InvitationId,
        accept: bool,
        now: Instant,
    ) -> Result<Vec<Action>, ResolveError> {
        let invitation = self.invitations.resolve(invitation_id, accept, now)?;
        let peer = invitation.from;
        let mut actions = Vec::new();
        if !accept {
            self.send_or_queue(
                peer,
                SessionMessage::Decline {
                    invitation_id,
                    reason: DeclineReason::Rejected,
                },
                now,
                &mut actions,
            );
            self.close_if_idle(peer, &mut actions);
            return Ok(actions);
        }

        let discovered = self.discovery.get(&peer);
        let record = PeerRecord {
            id: peer,
            display_name: invitation.display_name.clone(),
            discovery_info: discovered
                .map(|d| d.discovery_info.clone())
                .unwrap_or_default(),
            state: ConnectionState::NotConnected,
            transport_addr: self.links.get(&peer).map(|l| l.addr),
        };
        let role = Role::Invitee {
            invitation_id,
            deadline: now + invitation.timeout,
        };
        match self.sessions.begin(record, role, now) {
            Some(change) => {
                actions.push(Action::Emit(Event::state_changed(&change)));
                self.send_or_queue(peer, SessionMessage::Accept { invitation_id }, now, &mut actions);
            }
            None => {
                // A session with this peer appeared since the invitation arrived.
                self.send_or_queue(
                    peer,
                    SessionMessage::Decline {
                        invitation_id,
                        reason: DeclineReason::Busy,
                    },
                    now,
                    &mut actions,
                );
            }
        }
        Ok(actions)
    }

    fn on_invite(
        &mut self,
        peer: PeerId,
        invitation: (InvitationId, DisplayName, u64, Option<InvitationContext>),
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let (invitation_id, display_name, timeout_ms, context) = invitation;
        if self.invitations.involves(peer) || self.sessions.contains(&peer) {
            self.send_or_queue(
                peer,
                SessionMessage::Decline {
                    invitation_id,
                    reason: DeclineReason::Busy,
                },
                now,
                actions,
            );
            return;
        }
        let timeout = Duration::from_millis(timeout_ms).min(MAX_INVITE_TIMEOUT);
        self.invitations.receive(IncomingInvitation {
            id: invitation_id,
            from: peer,
            display_name: display_name.clone(),
            context: context.clone(),
            deadline: now + timeout,
            timeout,
        });
        actions.push(Action::Emit(Event::InvitationReceived {
            invitation_id,
            peer: PeerInfo {
                id: peer,
                display_name,
            },
            context,
        }));
    }

    // ---- sessions --------------------------------------------------------

    /// Queue a reliable payload to a connected peer. Settles with `SendSettled` once acked.
    pub fn send(
        &mut self,
        peer: PeerId,
        kind: DataKind,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<(u64, Vec<Action>), SendError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SendError::TooLarge(payload.len()));
        }
        if self.sessions.state(&peer) != ConnectionState::Connected {
            return Err(SendError::NotConnected(peer));
        }
        if !self.links.contains_key(&peer) {
            return Err(SendError::Transport("no link to peer".into()));
        }
        let p = self
            .sessions
            .get_mut(&peer)
            .ok_or(SendError::NotConnected(peer))?;
        let (seq, message) = p.channel.push(kind, payload, now);
        p.last_sent = now;
        Ok((seq, vec![Action::Send { peer, message }]))
    }

    /// Tear down every session and pending invitation. Each session peer moves to
    /// `NotConnected` exactly once. Idempotent.
    pub fn disconnect(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let (outgoing, incoming) = self.invitations.drop_all();
        for o in outgoing {
            self.send_or_queue(
                o.peer,
                SessionMessage::InviteCancel {
                    invitation_id: o.id,
                },
                now,
                &mut actions,
            );
            actions.push(Action::InviteSettled {
                invitation_id: o.id,
                result: Err(InviteError::Cancelled),
            });
        }
        for i in incoming {
            self.send_or_queue(
                i.from,
                SessionMessage::Decline {
                    invitation_id: i.id,
                    reason: DeclineReason::Rejected,
                },
                now,
                &mut actions,
            );
        }
        for peer in self.sessions.ids() {
            self.send_or_queue(peer, SessionMessage::Leave, now, &mut actions);
            self.drop_session(peer, "session disconnected", &mut actions);
        }
        let mut peers: Vec<PeerId> = self.links.keys().copied().collect();
        peers.sort();
        for peer in peers {
            actions.push(Action::CloseLink { peer });
        }
        self.links.clear();
        self.dialing.clear();
        self.outbox.clear();
        actions
    }

    /// Remove a session peer, report the transition and fail its unacked sends.
    fn drop_session(&mut self, peer: PeerId, reason: &str, actions: &mut Vec<Action>) {
        let Some(departed) = self.sessions.remove(&peer) else {
            return;
        };
        actions.push(Action::Emit(Event::state_changed(&departed.change)));
        for seq in departed.unacked {
            actions.push(Action::SendSettled {
                peer,
                seq,
                result: Err(SendError::Transport(reason.to_string())),
            });
        }
    }

    /// Snapshot of connected peers.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        self.sessions
            .records()
            .filter(|r| r.state == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    /// Snapshot of the found set, with each peer's current session state.
    pub fn discovered_peers(&self) -> Vec<PeerRecord> {
        self.discovery
            .peers()
            .map(|d| PeerRecord {
                id: d.peer_id,
                display_name: d.display_name.clone(),
                discovery_info: d.discovery_info.clone(),
                state: self.sessions.state(&d.peer_id),
                transport_addr: Some(d.addr),
            })
            .collect()
    }

    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        self.sessions.state(peer)
    }

    // ---- links -----------------------------------------------------------

    /// First link to `peer` is up. `outbound` if this side dialed it.
    pub fn on_link_up(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        outbound: bool,
        now: Instant,
    ) -> Vec<Action> {
        self.dialing.remove(&peer);
        self.links.insert(
            peer,
            Link {
                addr,
                last_heard: now,
            },
        );
        let mut actions = Vec::new();
        let queued = self.outbox.remove(&peer).unwrap_or_default();
        let had_queued = !queued.is_empty();
        for message in queued {
            self.send_or_queue(peer, message, now, &mut actions);
        }
        if outbound && !had_queued {
            // Dialed for an invitation that settled meanwhile.
            self.close_if_idle(peer, &mut actions);
        }
        actions
    }

    /// Last link to `peer` is gone (closed, failed, or could not be dialed).
    pub fn on_link_down(&mut self, peer: PeerId, reason: &str) -> Vec<Action> {
        self.links.remove(&peer);
        self.dialing.remove(&peer);
        self.outbox.remove(&peer);
        let mut actions = Vec::new();
        let (outgoing, _incoming) = self.invitations.drop_peer(peer);
        self.drop_session(peer, reason, &mut actions);
        for o in outgoing {
            actions.push(Action::InviteSettled {
                invitation_id: o.id,
                result: Err(InviteError::Transport(reason.to_string())),
            });
        }
        actions
    }

    /// A decoded message arrived on `peer`'s link.
    pub fn on_message(&mut self, peer: PeerId, message: SessionMessage, now: Instant) -> Vec<Action> {
        if let Some(link) = self.links.get_mut(&peer) {
            link.last_heard = now;
        }
        if let Some(p) = self.sessions.get_mut(&peer) {
            p.last_heard = now;
        }
        let mut actions = Vec::new();
        match message {
            SessionMessage::Invite {
                invitation_id,
                display_name,
                timeout_ms,
                context,
            } => self.on_invite(
                peer,
                (invitation_id, display_name, timeout_ms, context),
                now,
                &mut actions,
            ),
            SessionMessage::Accept { invitation_id } => {
                if self.invitations.take_outgoing(invitation_id, peer).is_some() {
                    if let Some(change) = self.sessions.connect(&peer, now) {
                        actions.push(Action::Emit(Event::state_changed(&change)));
                    }
                    self.send_or_queue(peer, SessionMessage::Confirm { invitation_id }, now, &mut actions);
                    actions.push(Action::InviteSettled {
                        invitation_id,
                        result: Ok(()),
                    });
                } else {
                    // Too late: the invitation already timed out or was cancelled here.
                    self.send_or_queue(
                        peer,
                        SessionMessage::InviteCancel { invitation_id },
                        now,
                        &mut actions,
                    );
                }
            }
            SessionMessage::Decline {
                invitation_id,
                reason,
            } => {
                if self.invitations.take_outgoing(invitation_id, peer).is_some() {
                    self.drop_session(peer, "invitation declined", &mut actions);
                    actions.push(Action::InviteSettled {
                        invitation_id,
                        result: Err(InviteError::Declined(reason)),
                    });
                    self.close_if_idle(peer, &mut actions);
                }
            }
            SessionMessage::InviteCancel { invitation_id } => {
                if self.invitations.cancel_incoming(invitation_id, peer).is_none()
                    && self.awaiting_confirm(peer, invitation_id)
                {
                    self.drop_session(peer, "invitation cancelled", &mut actions);
                }
                self.close_if_idle(peer, &mut actions);
            }
            SessionMessage::Confirm { invitation_id } => {
                if self.awaiting_confirm(peer, invitation_id) {
                    if let Some(change) = self.sessions.connect(&peer, now) {
                        actions.push(Action::Emit(Event::state_changed(&change)));
                    }
                }
            }
            SessionMessage::Data { seq, kind, payload } => {
                self.on_data(peer, seq, kind, payload, now, &mut actions);
            }
            SessionMessage::Ack { seq } => {
                if let Some(p) = self.sessions.get_mut(&peer) {
                    for acked in p.channel.on_ack(seq) {
                        actions.push(Action::SendSettled {
                            peer,
                            seq: acked,
                            result: Ok(()),
                        });
                    }
                }
            }
            SessionMessage::Heartbeat => {}
            SessionMessage::Leave => {
                let (outgoing, _incoming) = self.invitations.drop_peer(peer);
                self.drop_session(peer, "peer left the session", &mut actions);
                for o in outgoing {
                    actions.push(Action::InviteSettled {
                        invitation_id: o.id,
                        result: Err(InviteError::Transport("peer left".into())),
                    });
                }
                self.close_if_idle(peer, &mut actions);
            }
        }
        actions
    }

    fn awaiting_confirm(&self, peer: PeerId, invitation_id: InvitationId) -> bool {
        self.sessions.get(&peer).is_some_and(|p| {
            p.record.state == ConnectionState::Connecting
                && matches!(p.role, Role::Invitee { invitation_id: id, .. } if id == invitation_id)
        })
    }

    fn on_data(
        &mut self,
        peer: PeerId,
        seq: u64,
        kind: DataKind,
        payload: Vec<u8>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let Some(p) = self.sessions.get_mut(&peer) else {
            return;
        };
        if p.record.state != ConnectionState::Connected {
            return;
        }
        let info = PeerInfo {
            id: peer,
            display_name: p.record.display_name.clone(),
        };
        let (ready, ack) = p.channel.on_data(seq, kind, payload);
        for (kind, data) in ready {
            let event = match kind {
                DataKind::Text => match String::from_utf8(data) {
                    Ok(text) => Event::ReceivedText {
                        peer: info.clone(),
                        text,
                    },
                    Err(e) => Event::ReceivedData {
                        peer: info.clone(),
                        data: e.into_bytes(),
                    },
                },
                DataKind::Binary => Event::ReceivedData {
                    peer: info.clone(),
                    data,
                },
            };
            actions.push(Action::Emit(event));
        }
        self.send_or_queue(peer, SessionMessage::Ack { seq: ack }, now, actions);
    }

    // ---- timers ----------------------------------------------------------

    /// Periodic tick: announcements, discovery expiry, invitation and handshake deadlines,
    /// retransmissions, heartbeats and liveness.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        self.announce_if_due(now, &mut actions);

        for lost in self.discovery.expire(now) {
            actions.push(Action::Emit(Event::PeerLost {
                peer: PeerInfo {
                    id: lost.peer_id,
                    display_name: lost.display_name,
                },
            }));
        }

        let (outgoing, incoming) = self.invitations.expire(now);
        for o in outgoing {
            self.drop_session(o.peer, "invitation timed out", &mut actions);
            actions.push(Action::InviteSettled {
                invitation_id: o.id,
                result: Err(InviteError::InviteTimeout(o.peer)),
            });
            self.send_or_queue(
                o.peer,
                SessionMessage::InviteCancel {
                    invitation_id: o.id,
                },
                now,
                &mut actions,
            );
            self.close_if_idle(o.peer, &mut actions);
        }
        for i in incoming {
            self.close_if_idle(i.from, &mut actions);
        }

        for peer in self.sessions.ids() {
            self.tick_session(peer, now, &mut actions);
        }

        let idle: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(peer, link)| {
                !self.sessions.contains(peer)
                    && !self.invitations.involves(**peer)
                    && now.saturating_duration_since(link.last_heard) >= self.timing.link_timeout
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in idle {
            self.close_if_idle(peer, &mut actions);
        }
        actions
    }

    fn tick_session(&mut self, peer: PeerId, now: Instant, actions: &mut Vec<Action>) {
        let timing = self.timing.clone();
        let Some(p) = self.sessions.get_mut(&peer) else {
            return;
        };
        match (p.record.state, p.role) {
            (ConnectionState::Connecting, Role::Invitee { deadline, .. }) if deadline <= now => {
                self.drop_session(peer, "handshake timed out", actions);
                self.close_if_idle(peer, actions);
                return;
            }
            (ConnectionState::Connected, _) => {}
            _ => return,
        }
        if now.saturating_duration_since(p.last_heard) >= timing.link_timeout {
            self.drop_session(peer, "peer stopped responding", actions);
            self.close_if_idle(peer, actions);
            return;
        }
        match p
            .channel
            .due_retransmits(now, timing.ack_timeout, timing.max_retransmits)
        {
            Ok(resend) => {
                let heartbeat_due =
                    now.saturating_duration_since(p.last_sent) >= timing.heartbeat_interval;
                if !resend.is_empty() || heartbeat_due {
                    p.last_sent = now;
                }
                for message in resend {
                    actions.push(Action::Send { peer, message });
                }
                if heartbeat_due {
                    actions.push(Action::Send {
                        peer,
                        message: SessionMessage::Heartbeat,
                    });
                }
            }
            Err(exhausted) => {
                let reason = format!("no acknowledgement for message {}", exhausted.seq);
                self.send_or_queue(peer, SessionMessage::Leave, now, actions);
                self.drop_session(peer, &reason, actions);
                self.close_if_idle(peer, actions);
            }
        }
    }

    // ---- helpers ---------------------------------------------------------

    /// Write to the peer's link, or hold the message until the link being dialed is up.
    fn send_or_queue(
        &mut self,
        peer: PeerId,
        message: SessionMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if self.links.contains_key(&peer) {
            if let Some(p) = self.sessions.get_mut(&peer) {
                p.last_sent = now;
            }
            actions.push(Action::Send { peer, message });
        } else if self.dialing.contains(&peer) {
            self.outbox.entry(peer).or_default().push(message);
        }
    }

    /// Close the link once nothing (session or pending invitation) needs it.
    fn close_if_idle(&mut self, peer: PeerId, actions: &mut Vec<Action>) {
        if self.sessions.contains(&peer) || self.invitations.involves(peer) {
            return;
        }
        self.outbox.remove(&peer);
        if self.links.remove(&peer).is_some() {
            actions.push(Action::CloseLink { peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::create_identity;
    use crate::wire::{decode_datagram, encode_datagram};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Two cores wired back to back: datagrams and link messages are delivered in order.
    struct Pair {
        nodes: [NearbyCore; 2],
        events: [Vec<Event>; 2],
        invites: [Vec<(InvitationId, Result<(), InviteError>)>; 2],
        sends: [Vec<(u64, Result<(), SendError>)>; 2],
        /// Drop link traffic in flight (simulates a silent peer).
        mute: bool,
        now: Instant,
    }

    enum Delivery {
        Datagram(Datagram),
        LinkUp { outbound: bool },
        Message(SessionMessage),
        LinkDown,
    }

    impl Pair {
        fn new(a: &str, b: &str) -> Self {
            let timing = Timing::default();
            let node = |name: &str, port| {
                NearbyCore::new(create_identity(name).unwrap(), port, timing.clone())
            };
            Self {
                nodes: [node(a, 5000), node(b, 5001)],
                events: Default::default(),
                invites: Default::default(),
                sends: Default::default(),
                mute: false,
                now: Instant::now(),
            }
        }

        fn id(&self, i: usize) -> PeerId {
            self.nodes[i].peer_id()
        }

        fn run(&mut self, from: usize, actions: Vec<Action>) {
            let mut queue: VecDeque<(usize, Delivery)> = VecDeque::new();
            self.apply(from, actions, &mut queue);
            while let Some((to, delivery)) = queue.pop_front() {
                let other = 1 - to;
                let peer = self.id(other);
                let now = self.now;
                let actions = match delivery {
                    Delivery::Datagram(d) => self.nodes[to].on_datagram(d, LOCALHOST, now),
                    Delivery::LinkUp { outbound } => {
                        let addr = SocketAddr::new(LOCALHOST, 5000 + other as u16);
                        self.nodes[to].on_link_up(peer, addr, outbound, now)
                    }
                    Delivery::Message(m) => self.nodes[to].on_message(peer, m, now),
                    Delivery::LinkDown => self.nodes[to].on_link_down(peer, "closed by peer"),
                };
                self.apply(to, actions, &mut queue);
            }
        }

        fn apply(&mut self, from: usize, actions: Vec<Action>, queue: &mut VecDeque<(usize, Delivery)>) {
            let to = 1 - from;
            for action in actions {
                match action {
                    Action::Broadcast(d) => {
                        let bytes = encode_datagram(&d).unwrap();
                        let d = decode_datagram(&bytes).unwrap();
                        queue.push_back((to, Delivery::Datagram(d)));
                    }
                    Action::Connect { .. } => {
                        queue.push_back((from, Delivery::LinkUp { outbound: true }));
                        queue.push_back((to, Delivery::LinkUp { outbound: false }));
                    }
                    Action::Send { message, .. } => {
                        if !self.mute {
                            queue.push_back((to, Delivery::Message(message)));
                        }
                    }
                    Action::CloseLink { .. } => {
                        if !self.mute {
                            queue.push_back((to, Delivery::LinkDown));
                        }
                    }
                    Action::Emit(e) => self.events[from].push(e),
                    Action::InviteSettled {
                        invitation_id,
                        result,
                    } => self.invites[from].push((invitation_id, result)),
                    Action::SendSettled { seq, result, .. } => self.sends[from].push((seq, result)),
                }
            }
        }

        fn tick(&mut self, i: usize, advance: Duration) {
            self.now += advance;
            let actions = self.nodes[i].tick(self.now);
            self.run(i, actions);
        }

        fn states(&self, i: usize) -> Vec<ConnectionState> {
            self.events[i]
                .iter()
                .filter_map(|e| match e {
                    Event::PeerStateChanged { state, .. } => Some(*state),
                    _ => None,
                })
                .collect()
        }

        /// Node 0 advertises `{room: 1}`, node 1 browses.
        fn discover(&mut self) {
            let now = self.now;
            let a = self.nodes[0].start_advertising(
                ServiceType::new("chat").unwrap(),
                DisplayName::new("Alice").unwrap(),
                DiscoveryInfo::from_pairs([("room", "1")]).unwrap(),
                now,
            );
            self.run(0, a);
            let b = self.nodes[1].start_browsing(ServiceType::new("chat").unwrap());
            self.run(1, b);
        }

        /// Node 1 invites node 0, node 0 accepts.
        fn connect(&mut self) -> InvitationId {
            self.discover();
            let context = InvitationContext::new(b"{\"msg\":\"hi\"}".to_vec()).unwrap();
            let (id, actions) = self.nodes[1]
                .invite(self.id(0), Duration::from_secs(30), Some(context), self.now)
                .unwrap();
            self.run(1, actions);
            let received = self.events[0]
                .iter()
                .find_map(|e| match e {
                    Event::InvitationReceived { invitation_id, .. } => Some(*invitation_id),
                    _ => None,
                })
                .unwrap();
            let actions = self.nodes[0].resolve_invitation(received, true, self.now).unwrap();
            self.run(0, actions);
            id
        }
    }

    #[test]
    fn browse_finds_advertiser_with_info() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let found: Vec<&Event> = p.events[1]
            .iter()
            .filter(|e| matches!(e, Event::PeerFound { .. }))
            .collect();
        assert_eq!(found.len(), 1);
        let Event::PeerFound {
            peer,
            discovery_info,
        } = found[0]
        else {
            unreachable!()
        };
        assert_eq!(peer.display_name.as_str(), "Alice");
        assert_eq!(discovery_info.get("room"), Some("1"));
    }

    #[test]
    fn largest_advertisement_reaches_browser() {
        let mut p = Pair::new("Alice", "Bob");
        let pairs = (0..133u8).map(|i| {
            let key = format!("{}{}", (b'a' + i / 26) as char, (b'a' + i % 26) as char);
            (key, String::new())
        });
        let info = DiscoveryInfo::from_pairs(pairs).unwrap();
        let name = DisplayName::new("x".repeat(63)).unwrap();
        let b = p.nodes[1].start_browsing(ServiceType::new("chat").unwrap());
        p.run(1, b);
        let now = p.now;
        let a = p.nodes[0].start_advertising(
            ServiceType::new("chat").unwrap(),
            name.clone(),
            info.clone(),
            now,
        );
        p.run(0, a);
        assert!(p.events[0].is_empty());
        assert_eq!(
            p.events[1],
            vec![Event::PeerFound {
                peer: PeerInfo {
                    id: p.id(0),
                    display_name: name,
                },
                discovery_info: info,
            }]
        );
    }

    #[test]
    fn readvertise_reports_found_again() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        // Periodic announcements of the same generation stay quiet.
        p.tick(0, Duration::from_secs(5));
        let now = p.now;
        let again = p.nodes[0].start_advertising(
            ServiceType::new("chat").unwrap(),
            DisplayName::new("Alice").unwrap(),
            DiscoveryInfo::new(),
            now,
        );
        p.run(0, again);
        let found = p.events[1]
            .iter()
            .filter(|e| matches!(e, Event::PeerFound { .. }))
            .count();
        assert_eq!(found, 2);
    }

    #[test]
    fn goodbye_and_timeout_report_lost() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let bye = p.nodes[0].stop_advertising();
        p.run(0, bye);
        assert!(matches!(p.events[1].last(), Some(Event::PeerLost { .. })));
        assert!(p.nodes[0].stop_advertising().is_empty());

        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        p.nodes[0].stop_advertising();
        p.tick(1, Duration::from_secs(17));
        assert!(matches!(p.events[1].last(), Some(Event::PeerLost { .. })));
    }

    #[test]
    fn own_announcements_ignored() {
        let mut core = NearbyCore::new(create_identity("Solo").unwrap(), 1, Timing::default());
        let now = Instant::now();
        core.start_browsing(ServiceType::new("chat").unwrap());
        let actions = core.start_advertising(
            ServiceType::new("chat").unwrap(),
            DisplayName::new("Solo").unwrap(),
            DiscoveryInfo::new(),
            now,
        );
        for action in actions {
            if let Action::Broadcast(d) = action {
                assert!(core.on_datagram(d, LOCALHOST, now).is_empty());
            }
        }
        assert!(core.discovered_peers().is_empty());
    }

    #[test]
    fn invite_unknown_peer_touches_nothing() {
        let mut core = NearbyCore::new(create_identity("Bob").unwrap(), 1, Timing::default());
        let stranger = PeerId::random();
        let err = core
            .invite(stranger, Duration::from_secs(30), None, Instant::now())
            .unwrap_err();
        assert_eq!(err, InviteError::PeerNotFound(stranger));
        assert_eq!(core.connection_state(&stranger), ConnectionState::NotConnected);
        assert!(core.links.is_empty() && core.dialing.is_empty());
    }

    #[test]
    fn invite_accept_both_sides_connecting_then_connected() {
        let mut p = Pair::new("Alice", "Bob");
        let id = p.connect();

        let received = p.events[0]
            .iter()
            .filter_map(|e| match e {
                Event::InvitationReceived { peer, context, .. } => Some((peer, context)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.display_name.as_str(), "Bob");
        assert_eq!(
            received[0].1.as_ref().unwrap().as_bytes(),
            b"{\"msg\":\"hi\"}"
        );

        let expected = vec![ConnectionState::Connecting, ConnectionState::Connected];
        assert_eq!(p.states(0), expected);
        assert_eq!(p.states(1), expected);
        assert_eq!(p.invites[1], vec![(id, Ok(()))]);
        assert_eq!(p.nodes[0].connected_peers().len(), 1);
        assert_eq!(
            p.nodes[1].connected_peers()[0].discovery_info.get("room"),
            Some("1")
        );
    }

    #[test]
    fn reject_settles_declined() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let (id, actions) = p.nodes[1]
            .invite(p.id(0), Duration::from_secs(30), None, p.now)
            .unwrap();
        p.run(1, actions);
        let Some(Event::InvitationReceived { invitation_id, .. }) = p.events[0].last().cloned() else {
            panic!("no invitation");
        };
        let actions = p.nodes[0].resolve_invitation(invitation_id, false, p.now).unwrap();
        p.run(0, actions);

        assert_eq!(
            p.invites[1],
            vec![(id, Err(InviteError::Declined(DeclineReason::Rejected)))]
        );
        assert_eq!(
            p.states(1),
            vec![ConnectionState::Connecting, ConnectionState::NotConnected]
        );
        assert!(p.states(0).is_empty());
        assert!(p.nodes[0].links.is_empty());
        assert!(p.nodes[1].links.is_empty());
    }

    #[test]
    fn invite_timeout_then_late_resolve_expired() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let (id, actions) = p.nodes[1]
            .invite(p.id(0), Duration::from_secs(2), None, p.now)
            .unwrap();
        p.run(1, actions);
        let Some(Event::InvitationReceived { invitation_id, .. }) = p.events[0].last().cloned() else {
            panic!("no invitation");
        };

        p.tick(1, Duration::from_secs(3));
        assert_eq!(
            p.invites[1],
            vec![(id, Err(InviteError::InviteTimeout(p.id(0))))]
        );
        assert_eq!(
            p.states(1),
            vec![ConnectionState::Connecting, ConnectionState::NotConnected]
        );

        let err = p.nodes[0]
            .resolve_invitation(invitation_id, true, p.now)
            .unwrap_err();
        assert_eq!(err, ResolveError::InvitationExpired(invitation_id));
        assert!(p.states(0).is_empty());
        // Second tick must not settle again.
        p.tick(1, Duration::from_secs(1));
        assert_eq!(p.invites[1].len(), 1);
    }

    #[test]
    fn accept_racing_timeout_is_discarded() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let (_, actions) = p.nodes[1]
            .invite(p.id(0), Duration::from_secs(2), None, p.now)
            .unwrap();
        p.run(1, actions);
        let Some(Event::InvitationReceived { invitation_id, .. }) = p.events[0].last().cloned() else {
            panic!("no invitation");
        };
        // Alice accepts in time, but her Accept is still in flight when Bob times out.
        let mut in_flight = Vec::new();
        for action in p.nodes[0].resolve_invitation(invitation_id, true, p.now).unwrap() {
            match action {
                Action::Send { message, .. } => in_flight.push(message),
                Action::Emit(e) => p.events[0].push(e),
                _ => {}
            }
        }
        p.tick(1, Duration::from_secs(3));
        let alice = p.id(0);
        for message in in_flight {
            let now = p.now;
            let actions = p.nodes[1].on_message(alice, message, now);
            p.run(1, actions);
        }

        assert_eq!(p.invites[1].len(), 1);
        assert!(matches!(p.invites[1][0].1, Err(InviteError::InviteTimeout(_))));
        assert_eq!(
            p.states(0),
            vec![ConnectionState::Connecting, ConnectionState::NotConnected]
        );
        assert_eq!(p.nodes[1].connection_state(&alice), ConnectionState::NotConnected);
    }

    #[test]
    fn huge_invite_timeout_is_clamped() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let now = p.now;
        let (id, actions) = p.nodes[1]
            .invite(p.id(0), Duration::MAX, None, now)
            .unwrap();
        p.run(1, actions);
        p.tick(1, MAX_INVITE_TIMEOUT - Duration::from_secs(1));
        assert!(p.invites[1].is_empty());
        p.tick(1, Duration::from_secs(1));
        assert_eq!(
            p.invites[1],
            vec![(id, Err(InviteError::InviteTimeout(p.id(0))))]
        );
    }

    #[test]
    fn duplicate_invite_declined_busy() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let (_, actions) = p.nodes[1]
            .invite(p.id(0), Duration::from_secs(30), None, p.now)
            .unwrap();
        p.run(1, actions);
        assert_eq!(
            p.nodes[1]
                .invite(p.id(0), Duration::from_secs(30), None, p.now)
                .unwrap_err(),
            InviteError::AlreadyPending(p.id(0))
        );

        // A second invite arriving on the wire while one is pending.
        let dup = InvitationId::random();
        let actions = p.nodes[0].on_message(
            p.id(1),
            SessionMessage::Invite {
                invitation_id: dup,
                display_name: DisplayName::new("Bob").unwrap(),
                timeout_ms: 30_000,
                context: None,
            },
            p.now,
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Send {
                message: SessionMessage::Decline {
                    reason: DeclineReason::Busy,
                    ..
                },
                ..
            }
        )));
        let received = p.events[0]
            .iter()
            .filter(|e| matches!(e, Event::InvitationReceived { .. }))
            .count();
        assert_eq!(received, 1);
    }

    #[test]
    fn send_text_delivered_once_in_order_and_acked() {
        let mut p = Pair::new("Alice", "Bob");
        p.connect();
        let alice = p.id(0);
        for text in ["ping", "pong", "hello"] {
            let (_, actions) = p.nodes[1]
                .send(alice, DataKind::Text, text.as_bytes().to_vec(), p.now)
                .unwrap();
            p.run(1, actions);
        }
        let texts: Vec<&str> = p.events[0]
            .iter()
            .filter_map(|e| match e {
                Event::ReceivedText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["ping", "pong", "hello"]);
        assert_eq!(p.sends[1], vec![(1, Ok(())), (2, Ok(())), (3, Ok(()))]);
    }

    #[test]
    fn retransmit_is_deduplicated() {
        let mut p = Pair::new("Alice", "Bob");
        p.connect();
        let alice = p.id(0);
        let (_, actions) = p.nodes[1]
            .send(alice, DataKind::Binary, b"hello".to_vec(), p.now)
            .unwrap();
        // The same Data frame arrives twice, as after a retransmission.
        let data = actions
            .iter()
            .find_map(|a| match a {
                Action::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        let now = p.now;
        let first = p.nodes[0].on_message(p.id(1), data.clone(), now);
        let dup = p.nodes[0].on_message(p.id(1), data, now);
        p.apply_only_events(0, first);
        p.apply_only_events(0, dup);
        let received = p.events[0]
            .iter()
            .filter(|e| matches!(e, Event::ReceivedData { data, .. } if data == b"hello"))
            .count();
        assert_eq!(received, 1);
    }

    impl Pair {
        fn apply_only_events(&mut self, i: usize, actions: Vec<Action>) {
            for action in actions {
                if let Action::Emit(e) = action {
                    self.events[i].push(e);
                }
            }
        }
    }

    #[test]
    fn send_requires_connected() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let alice = p.id(0);
        assert_eq!(
            p.nodes[1]
                .send(alice, DataKind::Text, b"x".to_vec(), p.now)
                .unwrap_err(),
            SendError::NotConnected(alice)
        );
    }

    #[test]
    fn disconnect_reports_each_peer_once() {
        let mut p = Pair::new("Alice", "Bob");
        p.connect();
        let alice = p.id(0);
        // One send stays unacked.
        p.mute = true;
        let (seq, actions) = p.nodes[1]
            .send(alice, DataKind::Binary, vec![1, 2, 3], p.now)
            .unwrap();
        p.run(1, actions);
        p.mute = false;

        let now = p.now;
        let actions = p.nodes[1].disconnect(now);
        p.run(1, actions);
        assert!(p.nodes[1].connected_peers().is_empty());
        assert!(p.nodes[0].connected_peers().is_empty());
        let expected = vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::NotConnected,
        ];
        assert_eq!(p.states(1), expected);
        assert_eq!(p.states(0), expected);
        assert!(matches!(
            p.sends[1].last(),
            Some((s, Err(SendError::Transport(_)))) if *s == seq
        ));

        let again = p.nodes[1].disconnect(now);
        assert!(again.is_empty());
    }

    #[test]
    fn silent_peer_times_out() {
        let mut p = Pair::new("Alice", "Bob");
        p.connect();
        p.mute = true;
        for _ in 0..6 {
            p.tick(1, Duration::from_secs(2));
        }
        assert_eq!(p.states(1).last(), Some(&ConnectionState::NotConnected));
        assert_eq!(
            p.nodes[1].connection_state(&p.id(0)),
            ConnectionState::NotConnected
        );
    }

    #[test]
    fn heartbeats_keep_session_alive() {
        let mut p = Pair::new("Alice", "Bob");
        p.connect();
        for _ in 0..10 {
            p.tick(0, Duration::from_secs(1));
            p.tick(1, Duration::ZERO);
        }
        assert_eq!(
            p.nodes[1].connection_state(&p.id(0)),
            ConnectionState::Connected
        );
        assert_eq!(
            p.nodes[0].connection_state(&p.id(1)),
            ConnectionState::Connected
        );
    }

    #[test]
    fn link_loss_fails_pending_invite() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        let (id, actions) = p.nodes[1]
            .invite(p.id(0), Duration::from_secs(30), None, p.now)
            .unwrap();
        p.run(1, actions);
        let actions = p.nodes[1].on_link_down(p.id(0), "connection reset");
        p.run(1, actions);
        assert_eq!(
            p.invites[1],
            vec![(id, Err(InviteError::Transport("connection reset".into())))]
        );
        assert_eq!(
            p.states(1),
            vec![ConnectionState::Connecting, ConnectionState::NotConnected]
        );
    }

    #[test]
    fn stop_browsing_forgets_found_peers() {
        let mut p = Pair::new("Alice", "Bob");
        p.discover();
        assert_eq!(p.nodes[1].discovered_peers().len(), 1);
        p.nodes[1].stop_browsing();
        assert!(p.nodes[1].discovered_peers().is_empty());
        assert_eq!(
            p.nodes[1]
                .invite(p.id(0), Duration::from_secs(30), None, p.now)
                .unwrap_err(),
            InviteError::PeerNotFound(p.id(0))
        );
    }

    #[test]
    fn discovery_failure_stops_and_reports() {
        let mut core = NearbyCore::new(create_identity("A").unwrap(), 1, Timing::default());
        let now = Instant::now();
        core.start_advertising(
            ServiceType::new("chat").unwrap(),
            DisplayName::new("A").unwrap(),
            DiscoveryInfo::new(),
            now,
        );
        core.start_browsing(ServiceType::new("chat").unwrap());
        let actions = core.discovery_failed("socket closed".into());
        assert_eq!(actions.len(), 2);
        assert!(!core.is_advertising());
        assert!(!core.is_browsing());
        assert!(core.discovery_failed("again".into()).is_empty());
    }
}
