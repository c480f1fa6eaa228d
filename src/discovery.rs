//! # Peer Discovery
//!
//! Tracks peers known through signaling announcements. A peer already known is
//! refreshed silently and never reported as new twice. Entries not seen within
//! `stale_peer_max_age` are pruned unless a link to them is still open.
//!
//! The decision hooks ([`PeerDiscovery::may_accept_more`],
//! [`PeerDiscovery::should_evict_for`]) are plain calls into the
//! connection and eviction managers; their answers are used immediately and
//! never stored.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::MeshConfig;
use crate::connection::{ConnectionManager, should_initiate};
use crate::eviction::EvictionManager;
use crate::identity::PeerId;
use crate::proximity::closest_of;

/// Bound on tracked discovered peers.
pub const MAX_DISCOVERED_PEERS: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub discovered_at: Instant,
    pub last_seen_at: Instant,
}

/// Discovered peer enriched for the public API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeerInfo {
    pub peer_id: PeerId,
    pub is_connected: bool,
    pub age: Duration,
    pub last_seen: Duration,
}

#[derive(Debug)]
pub struct PeerDiscovery {
    local: PeerId,
    peers: HashMap<PeerId, DiscoveredPeer>,
    /// Monotonic insertion counter so discovery order survives the map.
    order: HashMap<PeerId, u64>,
    next_order: u64,
}

impl PeerDiscovery {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            order: HashMap::new(),
            next_order: 0,
        }
    }

    /// Returns `true` only the first time a peer is seen.
    pub fn add_discovered_peer(&mut self, peer: PeerId, now: Instant) -> bool {
        if peer == self.local {
            return false;
        }
        if let Some(known) = self.peers.get_mut(&peer) {
            known.last_seen_at = now;
            trace!(peer = %peer.short(), "refreshed known peer");
            return false;
        }
        if self.peers.len() >= MAX_DISCOVERED_PEERS {
            self.drop_least_recent();
        }
        self.peers.insert(
            peer,
            DiscoveredPeer {
                peer_id: peer,
                discovered_at: now,
                last_seen_at: now,
            },
        );
        self.order.insert(peer, self.next_order);
        self.next_order += 1;
        debug!(peer = %peer.short(), known = self.peers.len(), "discovered peer");
        true
    }

    fn drop_least_recent(&mut self) {
        if let Some(oldest) = self
            .peers
            .values()
            .min_by_key(|p| p.last_seen_at)
            .map(|p| p.peer_id)
        {
            self.remove_discovered_peer(&oldest);
        }
    }

    pub fn remove_discovered_peer(&mut self, peer: &PeerId) -> bool {
        self.order.remove(peer);
        self.peers.remove(peer).is_some()
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Discovered peers in discovery order.
    pub fn list_discovered(&self) -> Vec<DiscoveredPeer> {
        let mut list: Vec<DiscoveredPeer> = self.peers.values().copied().collect();
        list.sort_by_key(|p| self.order.get(&p.peer_id).copied().unwrap_or(u64::MAX));
        list
    }

    /// Forget peers not seen within `max_age`, keeping any with an open link.
    pub fn prune_stale(
        &mut self,
        max_age: Duration,
        now: Instant,
        keep: impl Fn(&PeerId) -> bool,
    ) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen_at) > max_age && !keep(&p.peer_id))
            .map(|p| p.peer_id)
            .collect();
        for peer in &stale {
            self.remove_discovered_peer(peer);
        }
        if !stale.is_empty() {
            debug!(pruned = stale.len(), remaining = self.peers.len(), "pruned stale discovered peers");
        }
        stale
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.order.clear();
    }

    // ========================================================================
    // Decision hooks
    // ========================================================================

    pub fn may_accept_more(&self, connections: &ConnectionManager, config: &MeshConfig) -> bool {
        connections.can_dial_more(config)
    }

    pub fn should_evict_for(
        &self,
        candidate: &PeerId,
        connections: &ConnectionManager,
        eviction: &EvictionManager,
        config: &MeshConfig,
    ) -> Option<PeerId> {
        eviction.should_evict_for_peer(candidate, &connections.connected_peers(), config)
    }

    /// Whether a newly announced `peer` should be dialled right away.
    ///
    /// We dial when we are the rightful initiator or when we have nothing
    /// connected. At capacity we only dial a peer that eviction would admit.
    pub fn should_dial_announced(
        &self,
        peer: &PeerId,
        connections: &ConnectionManager,
        eviction: &EvictionManager,
        config: &MeshConfig,
    ) -> bool {
        if !config.auto_discovery || connections.has_link(peer) || connections.is_attempting(peer) {
            return false;
        }
        let isolated = connections.connected_count() == 0;
        if !isolated && !should_initiate(&self.local, peer) {
            return false;
        }
        if self.may_accept_more(connections, config) {
            return true;
        }
        self.should_evict_for(peer, connections, eviction, config).is_some()
    }

    /// Discovered peers with no link and no attempt in flight, ordered by
    /// proximity when `xor_routing` is on, else by discovery order.
    pub fn dial_candidates(&self, connections: &ConnectionManager, config: &MeshConfig) -> Vec<PeerId> {
        let available = self
            .list_discovered()
            .into_iter()
            .map(|p| p.peer_id)
            .filter(|p| !connections.has_link(p) && !connections.is_attempting(p));
        if config.xor_routing {
            closest_of(&self.local, available)
        } else {
            available.collect()
        }
    }

    pub fn infos(&self, connections: &ConnectionManager, now: Instant) -> Vec<DiscoveredPeerInfo> {
        self.list_discovered()
            .into_iter()
            .map(|p| DiscoveredPeerInfo {
                peer_id: p.peer_id,
                is_connected: connections.is_connected(&p.peer_id),
                age: now.saturating_duration_since(p.discovered_at),
                last_seen: now.saturating_duration_since(p.last_seen_at),
            })
            .collect()
    }
}
