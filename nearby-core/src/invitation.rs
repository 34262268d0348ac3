//! Invitation negotiator: pending outgoing and incoming invitations, deadlines, resolution.
//!
//! Every invitation settles exactly once. Outgoing invitations settle on the remote's
//! answer or on timeout, whichever the host reports first; the later one finds nothing
//! pending and is discarded. Incoming invitations settle when the application resolves
//! them or when they expire; a short history of settled ids lets late resolves be
//! reported precisely.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::info::{DisplayName, InvitationContext};
use crate::protocol::InvitationId;

/// Default invite timeout when the caller does not pass one.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on any invite timeout, ours or one a remote inviter asks for.
pub const MAX_INVITE_TIMEOUT: Duration = Duration::from_secs(300);
/// How many settled invitation ids are remembered for late resolves.
const SETTLED_HISTORY: usize = 128;

/// How a settled invitation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Accepted,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invitation {0} expired")]
    InvitationExpired(InvitationId),
    #[error("invitation {0} was already resolved")]
    AlreadyResolved(InvitationId),
    #[error("unknown invitation {0}")]
    UnknownInvitation(InvitationId),
}

#[derive(Debug, Clone)]
pub struct OutgoingInvitation {
    pub id: InvitationId,
    pub peer: PeerId,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct IncomingInvitation {
    pub id: InvitationId,
    pub from: PeerId,
    pub display_name: DisplayName,
    pub context: Option<InvitationContext>,
    pub deadline: Instant,
    /// Inviter's timeout, reused as the deadline for its confirm after we accept.
    pub timeout: Duration,
}

#[derive(Debug, Default)]
pub struct Negotiator {
    outgoing: HashMap<InvitationId, OutgoingInvitation>,
    incoming: HashMap<InvitationId, IncomingInvitation>,
    settled: HashMap<InvitationId, Resolution>,
    settled_order: VecDeque<InvitationId>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_outgoing_to(&self, peer: PeerId) -> bool {
        self.outgoing.values().any(|o| o.peer == peer)
    }

    pub fn has_incoming_from(&self, peer: PeerId) -> bool {
        self.incoming.values().any(|i| i.from == peer)
    }

    /// Whether any pending invitation involves `peer`.
    pub fn involves(&self, peer: PeerId) -> bool {
        self.has_outgoing_to(peer) || self.has_incoming_from(peer)
    }

    /// Register a new outgoing invitation.
    pub fn begin_outgoing(&mut self, peer: PeerId, timeout: Duration, now: Instant) -> InvitationId {
        let id = InvitationId::random();
        self.outgoing.insert(
            id,
            OutgoingInvitation {
                id,
                peer,
                deadline: now + timeout,
            },
        );
        id
    }

    /// Take the outgoing invitation answered by `from`. `None` if it already settled.
    pub fn take_outgoing(&mut self, id: InvitationId, from: PeerId) -> Option<OutgoingInvitation> {
        match self.outgoing.get(&id) {
            Some(o) if o.peer == from => self.outgoing.remove(&id),
            _ => None,
        }
    }

    /// Register an invitation received from a peer. Duplicate checks are the caller's policy.
    pub fn receive(&mut self, invitation: IncomingInvitation) {
        self.incoming.insert(invitation.id, invitation);
    }

    #[cfg(test)]
    fn settled_as(&self, id: InvitationId) -> Option<Resolution> {
        self.settled.get(&id).copied()
    }

    /// Application decision on an incoming invitation. Succeeds at most once per id.
    pub fn resolve(
        &mut self,
        id: InvitationId,
        accept: bool,
        now: Instant,
    ) -> Result<IncomingInvitation, ResolveError> {
        let Some(invitation) = self.incoming.get(&id) else {
            return Err(match self.settled.get(&id) {
                Some(Resolution::Expired) => ResolveError::InvitationExpired(id),
                Some(_) => ResolveError::AlreadyResolved(id),
                None => ResolveError::UnknownInvitation(id),
            });
        };
        if invitation.deadline <= now {
            self.incoming.remove(&id);
            self.settle(id, Resolution::Expired);
            return Err(ResolveError::InvitationExpired(id));
        }
        let invitation = self.incoming.remove(&id).ok_or(ResolveError::UnknownInvitation(id))?;
        self.settle(
            id,
            if accept {
                Resolution::Accepted
            } else {
                Resolution::Rejected
            },
        );
        Ok(invitation)
    }

    /// The inviter cancelled. Returns the invitation if it was still pending.
    pub fn cancel_incoming(&mut self, id: InvitationId, from: PeerId) -> Option<IncomingInvitation> {
        match self.incoming.get(&id) {
            Some(i) if i.from == from => {
                let invitation = self.incoming.remove(&id);
                self.settle(id, Resolution::Expired);
                invitation
            }
            _ => None,
        }
    }

    /// Settle everything past its deadline.
    pub fn expire(&mut self, now: Instant) -> (Vec<OutgoingInvitation>, Vec<IncomingInvitation>) {
        let out_ids: Vec<InvitationId> = self
            .outgoing
            .values()
            .filter(|o| o.deadline <= now)
            .map(|o| o.id)
            .collect();
        let in_ids: Vec<InvitationId> = self
            .incoming
            .values()
            .filter(|i| i.deadline <= now)
            .map(|i| i.id)
            .collect();
        self.settle_all(out_ids, in_ids)
    }

    /// Settle everything involving `peer` (link lost, peer left).
    pub fn drop_peer(&mut self, peer: PeerId) -> (Vec<OutgoingInvitation>, Vec<IncomingInvitation>) {
        let out_ids: Vec<InvitationId> = self
            .outgoing
            .values()
            .filter(|o| o.peer == peer)
            .map(|o| o.id)
            .collect();
        let in_ids: Vec<InvitationId> = self
            .incoming
            .values()
            .filter(|i| i.from == peer)
            .map(|i| i.id)
            .collect();
        self.settle_all(out_ids, in_ids)
    }

    /// Settle every pending invitation (local disconnect).
    pub fn drop_all(&mut self) -> (Vec<OutgoingInvitation>, Vec<IncomingInvitation>) {
        let out_ids: Vec<InvitationId> = self.outgoing.keys().copied().collect();
        let in_ids: Vec<InvitationId> = self.incoming.keys().copied().collect();
        self.settle_all(out_ids, in_ids)
    }

    fn settle_all(
        &mut self,
        out_ids: Vec<InvitationId>,
        in_ids: Vec<InvitationId>,
    ) -> (Vec<OutgoingInvitation>, Vec<IncomingInvitation>) {
        let outgoing: Vec<OutgoingInvitation> = out_ids
            .into_iter()
            .filter_map(|id| self.outgoing.remove(&id))
            .collect();
        let incoming: Vec<IncomingInvitation> = in_ids
            .into_iter()
            .filter_map(|id| self.incoming.remove(&id))
            .collect();
        for invitation in &incoming {
            self.settle(invitation.id, Resolution::Expired);
        }
        (outgoing, incoming)
    }

    fn settle(&mut self, id: InvitationId, resolution: Resolution) {
        if self.settled.insert(id, resolution).is_none() {
            self.settled_order.push_back(id);
        }
        while self.settled_order.len() > SETTLED_HISTORY {
            if let Some(old) = self.settled_order.pop_front() {
                self.settled.remove(&old);
            }
        }
    }
}
