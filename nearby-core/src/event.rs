//! Application-facing notifications, in the order the core produced them.

use crate::identity::PeerId;
use crate::info::{DiscoveryInfo, DisplayName, InvitationContext};
use crate::protocol::InvitationId;
use crate::session::{ConnectionState, StateChange};

/// The application's view of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: DisplayName,
}

impl From<&StateChange> for PeerInfo {
    fn from(change: &StateChange) -> Self {
        PeerInfo {
            id: change.peer,
            display_name: change.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The peer is reachable now. Repeats after the peer re-advertises.
    PeerFound {
        peer: PeerInfo,
        discovery_info: DiscoveryInfo,
    },
    /// The peer's announcements timed out or it said goodbye.
    PeerLost { peer: PeerInfo },
    PeerStateChanged {
        peer: PeerInfo,
        state: ConnectionState,
    },
    /// Resolve with `resolve_invitation(invitation_id, accept)` exactly once.
    InvitationReceived {
        invitation_id: InvitationId,
        peer: PeerInfo,
        context: Option<InvitationContext>,
    },
    ReceivedData { peer: PeerInfo, data: Vec<u8> },
    ReceivedText { peer: PeerInfo, text: String },
    /// Advertising could not start or broke; it is stopped and may be retried.
    AdvertiseError { reason: String },
    /// Browsing could not start or broke; it is stopped and may be retried.
    BrowseError { reason: String },
}

impl Event {
    pub(crate) fn state_changed(change: &StateChange) -> Self {
        Event::PeerStateChanged {
            peer: PeerInfo::from(change),
            state: change.state,
        }
    }

    /// Peer the event is about, if any.
    pub fn peer(&self) -> Option<&PeerInfo> {
        match self {
            Event::PeerFound { peer, .. }
            | Event::PeerLost { peer }
            | Event::PeerStateChanged { peer, .. }
            | Event::InvitationReceived { peer, .. }
            | Event::ReceivedData { peer, .. }
            | Event::ReceivedText { peer, .. } => Some(peer),
            Event::AdvertiseError { .. } | Event::BrowseError { .. } => None,
        }
    }
}
