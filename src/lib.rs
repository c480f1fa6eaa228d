//! # peermesh - Self-Organizing Peer Mesh
//!
//! peermesh keeps a bounded-degree mesh of direct peer channels and layers
//! messaging and storage on top of it:
//!
//! - **Identity**: 160-bit peer ids, the larger id of a pair always initiates
//! - **Topology**: XOR proximity drives discovery, eviction and optimisation
//! - **Gossip**: hop-bounded broadcast and routed direct messages, deduplicated by id
//! - **DHT**: versioned key/value replicas on the closest connected peers, with subscriptions
//!
//! ## Architecture
//!
//! The crate never opens sockets. The host supplies a [`SignalingTransport`]
//! for bootstrap messages and a [`ChannelProvider`] that turns offer/answer
//! pairs into channels. A [`Mesh`] handle talks to a single actor that owns
//! every component and processes API calls, signaling envelopes and channel
//! events in arrival order.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `mesh` | Public handle, builder, events and the owning actor |
//! | `signaling` | Inbound signaling dispatch |
//! | `connection` | Link table, initiator rule, admission and cleanup |
//! | `link` | Per-peer negotiation state machine |
//! | `proximity` | XOR distance and ordering |
//! | `discovery` | Known peers and dial decisions |
//! | `eviction` | Farthest-peer eviction and the `max_peers` bound |
//! | `optimizer` | Dial target selection below `min_peers` |
//! | `gossip` | Broadcast and direct messaging |
//! | `dht` | Replicated key/value store |
//! | `messages` | Signaling envelope and link frame wire types |
//! | `protocols` | Collaborator traits |
//! | `storage` | Persisted peer id and settings |
//! | `maintenance` | Periodic task schedule |
//! | `memory` | In-process network for tests and simulation |

pub mod config;
pub mod connection;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod eviction;
pub mod gossip;
pub mod identity;
pub mod link;
pub mod maintenance;
pub mod memory;
pub mod mesh;
pub mod messages;
pub mod optimizer;
pub mod protocols;
pub mod proximity;
mod signaling;
pub mod storage;

#[cfg(test)]
mod testing;

pub use config::MeshConfig;
pub use dht::{DhtConfig, DhtStats, GetOptions, PutOptions, UpdateOptions};
pub use discovery::DiscoveredPeerInfo;
pub use error::MeshError;
pub use gossip::{GossipConfig, ReceivedMessage};
pub use identity::{PeerId, is_valid_peer_id};
pub use link::{LinkInfo, LinkState};
pub use maintenance::MaintenanceConfig;
pub use memory::MemoryNetwork;
pub use mesh::{Mesh, MeshBuilder, MeshEvent, MeshStatus, StatusEvent, StatusLevel, wait_for_status};
pub use messages::{MessageId, Signal, SignalingEnvelope};
pub use protocols::{ChannelEvent, ChannelProvider, SignalingTransport};
pub use storage::{MemorySettingsStore, SettingsStore};
