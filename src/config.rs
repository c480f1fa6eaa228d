//! Mesh degree configuration.
//!
//! [`MeshConfig`] is owned by the mesh actor and passed by reference to each
//! component call, so no component holds a copy across commands. Setters clamp
//! to the supported ranges; the actor routes each change to the components that
//! must react (for example lowering `max_peers` disconnects excess peers).

use serde::{Deserialize, Serialize};

/// Default lower bound on connected peers.
pub const DEFAULT_MIN_PEERS: usize = 2;

/// Default upper bound on connected peers.
pub const DEFAULT_MAX_PEERS: usize = 3;

/// Largest accepted `max_peers`.
pub const MAX_PEERS_LIMIT: usize = 50;

/// Smallest accepted `max_peers`.
pub const MIN_MAX_PEERS: usize = 1;

/// Largest accepted `min_peers`.
pub const MIN_PEERS_LIMIT: usize = 49;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub min_peers: usize,
    pub max_peers: usize,
    /// Dial newly announced peers and refill the mesh when below `min_peers`.
    pub auto_discovery: bool,
    /// Allow dropping a farther connected peer to admit a closer one.
    pub eviction_strategy: bool,
    /// Order dial candidates by XOR proximity instead of discovery order.
    #[serde(alias = "xorRoutingEnabled")]
    pub xor_routing: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            min_peers: DEFAULT_MIN_PEERS,
            max_peers: DEFAULT_MAX_PEERS,
            auto_discovery: true,
            eviction_strategy: true,
            xor_routing: true,
        }
    }
}

impl MeshConfig {
    /// Clamp to `1..=50`, returning the applied value.
    pub fn set_max_peers(&mut self, max_peers: usize) -> usize {
        self.max_peers = max_peers.clamp(MIN_MAX_PEERS, MAX_PEERS_LIMIT);
        self.max_peers
    }

    /// Clamp to `0..=49`, returning the applied value.
    pub fn set_min_peers(&mut self, min_peers: usize) -> usize {
        self.min_peers = min_peers.min(MIN_PEERS_LIMIT);
        self.min_peers
    }

    /// Bring externally supplied values (persisted settings, builder input)
    /// back into range.
    pub fn normalized(mut self) -> Self {
        self.set_max_peers(self.max_peers);
        self.set_min_peers(self.min_peers);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MeshConfig::default();
        assert_eq!(config.min_peers, 2);
        assert_eq!(config.max_peers, 3);
        assert!(config.auto_discovery);
        assert!(config.eviction_strategy);
        assert!(config.xor_routing);
    }

    #[test]
    fn setters_clamp() {
        let mut config = MeshConfig::default();
        assert_eq!(config.set_max_peers(0), 1);
        assert_eq!(config.set_max_peers(500), 50);
        assert_eq!(config.set_max_peers(7), 7);
        assert_eq!(config.set_min_peers(100), 49);
        assert_eq!(config.set_min_peers(0), 0);
    }

    #[test]
    fn persisted_form_is_camel_case() {
        let json = serde_json::to_string(&MeshConfig::default()).unwrap();
        assert!(json.contains("\"maxPeers\":3"));
        assert!(json.contains("\"xorRouting\":true"));

        let legacy = r#"{"minPeers":1,"maxPeers":99,"autoDiscovery":false,"evictionStrategy":true,"xorRoutingEnabled":false}"#;
        let parsed: MeshConfig = serde_json::from_str(legacy).unwrap();
        let parsed = parsed.normalized();
        assert_eq!(parsed.max_peers, 50);
        assert!(!parsed.xor_routing);
        assert!(!parsed.auto_discovery);
    }
}
