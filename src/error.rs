//! Error taxonomy shared by every mesh component.
//!
//! | Class | Variants | Surfaced as |
//! |-------|----------|-------------|
//! | Validation | `InvalidPeerId`, `InvalidSessionDescription`, `MalformedSignal`, `MessageTooLarge`, `SelfConnection` | status event, no state change |
//! | Capacity | `CapacityReached` | `connection-rejected` to the remote peer |
//! | State conflict | `StateConflict`, `UnknownLink` | informational, swallowed |
//! | Transport | `Transport` | link failed and removed, status event |
//! | Fatal | `MissingCapability` | returned from `MeshBuilder::build` |
//! | Lifecycle | `NotConnected`, `DhtDisabled`, `ActorClosed` | returned from the `Mesh` call |

use thiserror::Error;

use crate::identity::PeerId;
use crate::link::LinkState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("invalid peer id {0:?}: expected exactly 40 hex characters")]
    InvalidPeerId(String),

    #[error("invalid session description from {peer}: {reason}")]
    InvalidSessionDescription { peer: PeerId, reason: &'static str },

    #[error("malformed signaling message: {0}")]
    MalformedSignal(String),

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("cannot connect to own peer id")]
    SelfConnection,

    #[error("mesh at capacity ({current}/{max} peers)")]
    CapacityReached { current: usize, max: usize },

    #[error("cannot {operation} link to {peer} in state {state}")]
    StateConflict {
        peer: PeerId,
        state: LinkState,
        operation: &'static str,
    },

    #[error("no link to {peer}")]
    UnknownLink { peer: PeerId },

    #[error("transport failure with {peer}: {message}")]
    Transport { peer: PeerId, message: String },

    #[error("required capability missing: {0}")]
    MissingCapability(&'static str),

    #[error("mesh is not connected")]
    NotConnected,

    #[error("DHT is disabled on this node")]
    DhtDisabled,

    #[error("mesh actor closed")]
    ActorClosed,
}

impl MeshError {
    pub(crate) fn transport(peer: PeerId, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            peer,
            message: err.to_string(),
        }
    }

    /// State conflicts are the expected outcome of a resolved race.
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. } | Self::UnknownLink { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPeerId(_)
                | Self::InvalidSessionDescription { .. }
                | Self::MalformedSignal(_)
                | Self::MessageTooLarge { .. }
                | Self::SelfConnection
        )
    }
}
