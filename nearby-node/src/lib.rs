//! Nearby node: runs the nearby protocol over LAN multicast discovery and TCP session links.
//!
//! Start a [`Node`], subscribe to its events, advertise and/or browse, then invite found
//! peers and exchange data once they are connected.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
mod transport;

pub use bus::EventStream;
pub use config::{Config, ConfigError};
pub use discovery::{MemoryHub, Medium};
pub use error::{Error, Result};
pub use node::{InviteOptions, Node, PendingInvite};

pub use nearby_core::{
    ConnectionState, DeclineReason, DiscoveryInfo, Event, InvitationContext, InvitationId,
    InviteError, PeerId, PeerInfo, PeerRecord, ResolveError, SendError, ValidationError,
};
