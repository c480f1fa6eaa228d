//! # Eviction
//!
//! Keeps the mesh within `max_peers` while letting it drift toward the
//! topologically closest neighbours. A connected peer is only ever dropped to
//! admit a strictly closer candidate, or to honour a lowered `max_peers`, in
//! which case the farthest peers go first.

use tracing::{debug, info};

use crate::config::MeshConfig;
use crate::connection::ConnectionManager;
use crate::identity::PeerId;
use crate::proximity::{farthest_of, is_closer};

pub const REASON_CLOSER_PEER: &str = "evicted for closer peer";
pub const REASON_EXCESS: &str = "max peers lowered";

#[derive(Debug)]
pub struct EvictionManager {
    local: PeerId,
    evicted_total: u64,
}

impl EvictionManager {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            evicted_total: 0,
        }
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    /// The farthest connected peer, if it is strictly farther than `candidate`.
    ///
    /// Returns `None` when eviction is disabled, when nothing is connected, or
    /// when the candidate would be the farthest peer itself.
    pub fn should_evict_for_peer(
        &self,
        candidate: &PeerId,
        connected: &[PeerId],
        config: &MeshConfig,
    ) -> Option<PeerId> {
        if !config.eviction_strategy || *candidate == self.local || connected.contains(candidate) {
            return None;
        }
        let farthest = farthest_of(&self.local, connected.iter().copied())?;
        if is_closer(&self.local, candidate, &farthest) {
            Some(farthest)
        } else {
            None
        }
    }

    pub async fn evict_peer(
        &mut self,
        connections: &mut ConnectionManager,
        peer: PeerId,
        reason: &str,
    ) -> bool {
        let removed = connections.disconnect(peer, reason).await;
        if removed {
            self.evicted_total += 1;
            info!(peer = %peer.short(), reason, "evicted peer");
        }
        removed
    }

    /// Evict farthest-first until `connected_count <= max_peers`.
    pub async fn disconnect_excess_peers(
        &mut self,
        connections: &mut ConnectionManager,
        config: &MeshConfig,
    ) -> Vec<PeerId> {
        let mut evicted = Vec::new();
        while connections.connected_count() > config.max_peers {
            let Some(farthest) = farthest_of(&self.local, connections.connected_peers()) else {
                break;
            };
            if !self.evict_peer(connections, farthest, REASON_EXCESS).await {
                break;
            }
            evicted.push(farthest);
        }
        if !evicted.is_empty() {
            debug!(
                evicted = evicted.len(),
                max_peers = config.max_peers,
                "disconnected excess peers"
            );
        }
        evicted
    }
}
