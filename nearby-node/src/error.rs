//! Node-level error: everything an application call can fail with.

use nearby_core::{InviteError, ResolveError, SendError, ValidationError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Invite(#[from] InviteError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The node's actor has stopped.
    #[error("node is shut down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
