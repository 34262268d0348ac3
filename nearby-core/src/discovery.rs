//! Discovery engine state: the local advertisement and the found-peer set of a browsing session.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::identity::{PeerId, PublicKey};
use crate::info::{DiscoveryInfo, DisplayName, ServiceType};
use crate::protocol::{Announcement, Datagram, PROTOCOL_VERSION};

/// A peer seen through its announcements during the current browsing session.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub display_name: DisplayName,
    pub discovery_info: DiscoveryInfo,
    pub public_key: PublicKey,
    /// Where the peer accepts session links.
    pub addr: SocketAddr,
    pub generation: u32,
    pub last_seen: Instant,
}

/// What the local node is advertising, if anything.
#[derive(Debug, Default)]
pub struct Advertiser {
    active: Option<Advertisement>,
    generation: u32,
    next_announce: Option<Instant>,
}

#[derive(Debug, Clone)]
struct Advertisement {
    service_type: ServiceType,
    display_name: DisplayName,
    discovery_info: DiscoveryInfo,
}

impl Advertiser {
    /// (Re)start advertising. Every start gets a new generation.
    pub fn start(
        &mut self,
        service_type: ServiceType,
        display_name: DisplayName,
        discovery_info: DiscoveryInfo,
        now: Instant,
    ) {
        self.generation = self.generation.wrapping_add(1);
        self.active = Some(Advertisement {
            service_type,
            display_name,
            discovery_info,
        });
        self.next_announce = Some(now);
    }

    /// Stop advertising. Returns the service type that was advertised, if any.
    pub fn stop(&mut self) -> Option<ServiceType> {
        self.next_announce = None;
        self.active.take().map(|a| a.service_type)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn service_type(&self) -> Option<&ServiceType> {
        self.active.as_ref().map(|a| &a.service_type)
    }

    /// Build the current announcement, if advertising.
    pub fn announcement(
        &self,
        peer_id: PeerId,
        public_key: &PublicKey,
        listen_port: u16,
    ) -> Option<Announcement> {
        let ad = self.active.as_ref()?;
        Some(Announcement {
            protocol_version: PROTOCOL_VERSION,
            service_type: ad.service_type.clone(),
            peer_id,
            display_name: ad.display_name.clone(),
            discovery_info: ad.discovery_info.clone(),
            public_key: public_key.clone(),
            listen_port,
            generation: self.generation,
        })
    }

    /// True when the periodic announcement is due; schedules the next one.
    pub fn announce_due(&mut self, now: Instant, interval: Duration) -> bool {
        match self.next_announce {
            Some(at) if at <= now => {
                self.next_announce = Some(now + interval);
                true
            }
            _ => false,
        }
    }
}

/// Found-peer set for one browsing session.
///
/// Reports a peer as found once per browsing session and advertisement generation:
/// repeated announcements only refresh `last_seen`; a new generation (the peer
/// re-advertised) is reported again.
#[derive(Debug)]
pub struct DiscoveryTable {
    browsing: Option<ServiceType>,
    peers: HashMap<PeerId, DiscoveredPeer>,
    peer_timeout: Duration,
}

impl DiscoveryTable {
    pub fn new(peer_timeout: Duration) -> Self {
        Self {
            browsing: None,
            peers: HashMap::new(),
            peer_timeout,
        }
    }

    /// Start a fresh browsing session.
    pub fn start(&mut self, service_type: ServiceType) {
        self.peers.clear();
        self.browsing = Some(service_type);
    }

    /// Stop browsing and forget every found peer.
    pub fn stop(&mut self) -> bool {
        self.peers.clear();
        self.browsing.take().is_some()
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing.is_some()
    }

    pub fn service_type(&self) -> Option<&ServiceType> {
        self.browsing.as_ref()
    }

    /// Record an announcement received from `source`. Returns the peer when a found
    /// notification is due.
    pub fn observe(
        &mut self,
        announcement: &Announcement,
        source: IpAddr,
        now: Instant,
    ) -> Option<DiscoveredPeer> {
        if self.browsing.as_ref() != Some(&announcement.service_type) {
            return None;
        }
        let peer = DiscoveredPeer {
            peer_id: announcement.peer_id,
            display_name: announcement.display_name.clone(),
            discovery_info: announcement.discovery_info.clone(),
            public_key: announcement.public_key.clone(),
            addr: SocketAddr::new(source, announcement.listen_port),
            generation: announcement.generation,
            last_seen: now,
        };
        let report = match self.peers.get(&announcement.peer_id) {
            Some(known) => known.generation != announcement.generation,
            None => true,
        };
        self.peers.insert(announcement.peer_id, peer.clone());
        report.then_some(peer)
    }

    /// Handle an explicit goodbye. Returns the peer if it was found.
    pub fn goodbye(&mut self, service_type: &ServiceType, peer_id: PeerId) -> Option<DiscoveredPeer> {
        if self.browsing.as_ref() != Some(service_type) {
            return None;
        }
        self.peers.remove(&peer_id)
    }

    /// Drop peers whose announcements timed out. Returns them in no particular order.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveredPeer> {
        let timeout = self.peer_timeout;
        let gone: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) >= timeout)
            .map(|p| p.peer_id)
            .collect();
        gone.iter().filter_map(|id| self.peers.remove(id)).collect()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &DiscoveredPeer> {
        self.peers.values()
    }
}

/// Whether a datagram belongs to this protocol version and was not sent by `local`.
pub fn is_foreign(datagram: &Datagram, local: PeerId) -> bool {
    datagram.protocol_version() == PROTOCOL_VERSION && datagram.sender() != local
}
