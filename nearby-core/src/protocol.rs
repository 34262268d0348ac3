//! Nearby wire protocol: discovery datagrams, session link messages, version.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{PeerId, PublicKey};
use crate::info::{DiscoveryInfo, DisplayName, InvitationContext, ServiceType};

/// Current protocol version. Carried in every datagram and in the link hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Invitation ID: fresh random token per invite. Transport-internal correlation only;
/// never placed inside the application context.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct InvitationId(Uuid);

impl InvitationId {
    pub fn random() -> Self {
        InvitationId(Uuid::new_v4())
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Presence announcement, multicast periodically by an advertising peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub protocol_version: u8,
    pub service_type: ServiceType,
    pub peer_id: PeerId,
    pub display_name: DisplayName,
    pub discovery_info: DiscoveryInfo,
    pub public_key: PublicKey,
    /// TCP port accepting session links; the host is the datagram's source address.
    pub listen_port: u16,
    /// Bumped every time advertising (re)starts, so browsers report the peer again.
    pub generation: u32,
}

/// Discovery datagrams. Encoding is bincode behind a magic header (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datagram {
    Announce(Announcement),
    /// Advertising stopped; browsers drop the peer at once instead of waiting for timeout.
    Goodbye {
        protocol_version: u8,
        service_type: ServiceType,
        peer_id: PeerId,
    },
    /// A browser just started; advertisers of the service answer with an announcement.
    Query {
        protocol_version: u8,
        service_type: ServiceType,
        peer_id: PeerId,
    },
}

impl Datagram {
    pub fn protocol_version(&self) -> u8 {
        match self {
            Datagram::Announce(a) => a.protocol_version,
            Datagram::Goodbye {
                protocol_version, ..
            }
            | Datagram::Query {
                protocol_version, ..
            } => *protocol_version,
        }
    }

    pub fn sender(&self) -> PeerId {
        match self {
            Datagram::Announce(a) => a.peer_id,
            Datagram::Goodbye { peer_id, .. } | Datagram::Query { peer_id, .. } => *peer_id,
        }
    }
}

/// Why an invitation was declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclineReason {
    /// The application resolved the invitation with `accept = false`.
    Rejected,
    /// The invitee already has a pending invitation or session with the inviter.
    Busy,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::Rejected => f.write_str("rejected"),
            DeclineReason::Busy => f.write_str("busy"),
        }
    }
}

/// Payload flavour, so text sent with `send_text` arrives as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Binary,
    Text,
}

/// Messages exchanged over an established (encrypted) session link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Request a session. The envelope carries correlation data; `context` is the
    /// application's bytes, untouched.
    Invite {
        invitation_id: InvitationId,
        display_name: DisplayName,
        timeout_ms: u64,
        context: Option<InvitationContext>,
    },
    Accept {
        invitation_id: InvitationId,
    },
    Decline {
        invitation_id: InvitationId,
        reason: DeclineReason,
    },
    /// Inviter gave up (timeout), or answered an accept it no longer waits for.
    InviteCancel {
        invitation_id: InvitationId,
    },
    /// Inviter saw the accept and is connected; invitee may now go connected too.
    Confirm {
        invitation_id: InvitationId,
    },
    /// Reliable payload with a per-session sequence number (first is 1).
    Data {
        seq: u64,
        kind: DataKind,
        payload: Vec<u8>,
    },
    /// Cumulative acknowledgement: every sequence number up to and including `seq` arrived.
    Ack {
        seq: u64,
    },
    Heartbeat,
    /// Graceful session teardown.
    Leave,
}
