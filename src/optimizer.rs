//! # Mesh Optimizer
//!
//! Chooses dial targets that move the node toward its target degree.
//!
//! - Regular pass: runs when connected count is below `min_peers` with
//!   auto-discovery on; dials closest-first until the pending + connected
//!   total would reach `min_peers`, never beyond `max_peers`.
//! - Isolation fast path: with nothing connected, the single closest
//!   available peer is dialled at once.
//! - Forced pass: dials every available candidate within capacity.
//!
//! The optimizer only selects. The mesh actor performs the dials.

use tracing::debug;

use crate::config::MeshConfig;
use crate::connection::ConnectionManager;
use crate::identity::PeerId;

#[derive(Debug, Default)]
pub struct MeshOptimizer {
    runs: u64,
    dials_requested: u64,
}

impl MeshOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn dials_requested(&self) -> u64 {
        self.dials_requested
    }

    /// Whether a regular optimisation pass should run now.
    pub fn needs_peers(&self, connections: &ConnectionManager, config: &MeshConfig) -> bool {
        config.auto_discovery && connections.connected_count() < config.min_peers
    }

    fn free_slots(connections: &ConnectionManager, config: &MeshConfig) -> usize {
        config
            .max_peers
            .saturating_sub(connections.connected_count() + connections.pending_count())
    }

    /// Dial targets for a regular pass. `candidates` must already be ordered
    /// and exclude linked or mid-dial peers.
    pub fn optimize_connections(
        &mut self,
        candidates: &[PeerId],
        connections: &ConnectionManager,
        config: &MeshConfig,
    ) -> Vec<PeerId> {
        self.runs += 1;
        let in_flight = connections.connected_count() + connections.pending_count();
        let wanted = config.min_peers.max(1).saturating_sub(in_flight);
        let budget = wanted.min(Self::free_slots(connections, config));
        let targets: Vec<PeerId> = candidates
            .iter()
            .filter(|p| !connections.has_link(p) && !connections.is_attempting(p))
            .take(budget)
            .copied()
            .collect();
        if !targets.is_empty() {
            debug!(
                targets = targets.len(),
                connected = connections.connected_count(),
                min_peers = config.min_peers,
                "optimizer selected dial targets"
            );
        }
        self.dials_requested += targets.len() as u64;
        targets
    }

    /// With nothing connected, the closest available peer not in `exclude`.
    pub fn isolation_target(
        &mut self,
        candidates: &[PeerId],
        exclude: &[PeerId],
        connections: &ConnectionManager,
        config: &MeshConfig,
    ) -> Option<PeerId> {
        if connections.connected_count() > 0 || Self::free_slots(connections, config) == 0 {
            return None;
        }
        let target = candidates
            .iter()
            .find(|p| !exclude.contains(p) && !connections.has_link(p) && !connections.is_attempting(p))
            .copied();
        if let Some(peer) = target {
            self.dials_requested += 1;
            debug!(peer = %peer.short(), "isolated, dialing closest available peer");
        }
        target
    }

    pub fn force_connect_to_all(
        &mut self,
        candidates: &[PeerId],
        connections: &ConnectionManager,
        config: &MeshConfig,
    ) -> Vec<PeerId> {
        self.runs += 1;
        let targets: Vec<PeerId> = candidates
            .iter()
            .filter(|p| !connections.has_link(p) && !connections.is_attempting(p))
            .take(Self::free_slots(connections, config))
            .copied()
            .collect();
        self.dials_requested += targets.len() as u64;
        targets
    }
}
