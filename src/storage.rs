//! Persistence of the local peer id and mesh settings.
//!
//! The host supplies a [`SettingsStore`]; values are plain strings (the peer id
//! as hex, the settings as JSON). A missing store means nothing is persisted.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::config::MeshConfig;
use crate::identity::PeerId;

pub const PEER_ID_KEY: &str = "peermesh-peer-id";
pub const SETTINGS_KEY: &str = "peermesh-settings";

/// Synchronous string key/value store provided by the host.
pub trait SettingsStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| anyhow!("settings store poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| anyhow!("settings store poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| anyhow!("settings store poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

/// Pick the local peer id.
///
/// A valid `provided` id wins. An invalid one is logged and replaced. Without
/// one, a valid persisted id is reused, else a fresh id is generated. The id in
/// use is written back to the store.
pub fn load_or_generate_peer_id(store: Option<&dyn SettingsStore>, provided: Option<&str>) -> PeerId {
    let chosen = match provided {
        Some(raw) => match PeerId::from_hex(raw) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "ignoring invalid peer id, generating a new one");
                None
            }
        },
        None => store.and_then(|s| match s.get(PEER_ID_KEY) {
            Ok(Some(saved)) => match PeerId::from_hex(&saved) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "persisted peer id is invalid, generating a new one");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read persisted peer id");
                None
            }
        }),
    };
    let id = chosen.unwrap_or_else(PeerId::random);
    if let Some(store) = store
        && let Err(e) = store.set(PEER_ID_KEY, &id.to_hex())
    {
        warn!(error = %e, "failed to persist peer id");
    }
    id
}

/// Saved settings, if any could be read and parsed.
pub fn load_settings(store: &dyn SettingsStore) -> Option<MeshConfig> {
    let raw = match store.get(SETTINGS_KEY) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!(error = %e, "failed to read saved settings");
            return None;
        }
    };
    match serde_json::from_str::<MeshConfig>(&raw) {
        Ok(config) => {
            debug!("loaded saved mesh settings");
            Some(config.normalized())
        }
        Err(e) => {
            warn!(error = %e, "ignoring unreadable saved settings");
            None
        }
    }
}

pub fn save_settings(store: &dyn SettingsStore, config: &MeshConfig) -> Result<()> {
    let json = serde_json::to_string(config)?;
    store.set(SETTINGS_KEY, &json)
}

/// Forget everything this crate persisted.
pub fn clear_saved_state(store: &dyn SettingsStore) -> Result<()> {
    store.remove(PEER_ID_KEY)?;
    store.remove(SETTINGS_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provided_id_is_used_and_persisted() {
        let store = MemorySettingsStore::new();
        let hex = "ab".repeat(20);
        let id = load_or_generate_peer_id(Some(&store), Some(&hex));
        assert_eq!(id.to_hex(), hex);
        assert_eq!(store.get(PEER_ID_KEY).unwrap(), Some(hex));
    }

    #[test]
    fn invalid_provided_id_is_replaced() {
        let id = load_or_generate_peer_id(None, Some("not-a-peer-id"));
        assert_eq!(id.to_hex().len(), 40);
    }

    #[test]
    fn persisted_id_is_reused() {
        let store = MemorySettingsStore::new();
        let first = load_or_generate_peer_id(Some(&store), None);
        let second = load_or_generate_peer_id(Some(&store), None);
        assert_eq!(first, second);

        clear_saved_state(&store).unwrap();
        assert_eq!(store.get(PEER_ID_KEY).unwrap(), None);
    }

    #[test]
    fn settings_roundtrip_is_normalized() {
        let store = MemorySettingsStore::new();
        assert!(load_settings(&store).is_none());

        store
            .set(SETTINGS_KEY, r#"{"minPeers":1,"maxPeers":500,"autoDiscovery":false,"evictionStrategy":true,"xorRoutingEnabled":false}"#)
            .unwrap();
        let config = load_settings(&store).unwrap();
        assert_eq!(config.max_peers, crate::config::MAX_PEERS_LIMIT);
        assert!(!config.auto_discovery);
        assert!(!config.xor_routing);

        save_settings(&store, &MeshConfig::default()).unwrap();
        assert_eq!(load_settings(&store).unwrap(), MeshConfig::default());
    }

    #[test]
    fn garbage_settings_are_ignored() {
        let store = MemorySettingsStore::new();
        store.set(SETTINGS_KEY, "{not json").unwrap();
        assert!(load_settings(&store).is_none());
    }
}
