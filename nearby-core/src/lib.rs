//! Nearby protocol reference implementation: discovery, invitations and sessions.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod info;
pub mod protocol;
pub mod wire;

pub use identity::{create_identity, Keypair, LocalIdentity, PeerId, PublicKey};
pub use info::{DiscoveryInfo, DisplayName, InvitationContext, ServiceType, ValidationError};
pub use protocol::{DataKind, Datagram, DeclineReason, InvitationId, SessionMessage, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use core::{Action, InviteError, NearbyCore, SendError, Timing};
pub use event::{Event, PeerInfo};
pub use invitation::{ResolveError, DEFAULT_INVITE_TIMEOUT};
pub use session::{ConnectionState, PeerRecord};

pub mod core;
pub mod discovery;
pub mod event;
pub mod invitation;
pub mod session;
