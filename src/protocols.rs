//! Collaborator traits the mesh depends on.
//!
//! The mesh never opens sockets itself. It negotiates channels through a
//! [`ChannelProvider`] and exchanges bootstrap messages through a
//! [`SignalingTransport`]. Both are supplied by the host at build time.
//!
//! | Capability | Trait | Inbound path |
//! |------------|-------|--------------|
//! | Signaling relay | [`SignalingTransport`] | `Mesh::handle_signaling` |
//! | Peer channels | [`ChannelProvider`] | `Mesh::handle_channel_event` |
//!
//! Implementations must return promptly: a call may do local work such as
//! generating SDP or enqueueing bytes, but must never wait on the remote peer.
//! Negotiation outcomes are reported later as [`ChannelEvent`]s.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::PeerId;
use crate::messages::{IceCandidate, SessionDescription, SignalingEnvelope};

/// Outbound half of the signaling relay. Per-sender ordering is the
/// implementation's responsibility.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Relay an envelope. A missing `targetPeerId` means every peer.
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()>;
}

/// Channel negotiation and framing for one local peer.
#[async_trait]
pub trait ChannelProvider: Send + Sync + 'static {
    /// Start an outbound channel and return the local offer.
    async fn create_offer(&self, peer: &PeerId) -> Result<SessionDescription>;

    /// Apply a remote offer and return the local answer.
    async fn create_answer(&self, peer: &PeerId, offer: &SessionDescription) -> Result<SessionDescription>;

    /// Apply the remote answer to an outbound channel.
    async fn apply_answer(&self, peer: &PeerId, answer: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, peer: &PeerId, candidate: &IceCandidate) -> Result<()>;

    /// Produce a fresh offer for an established channel with new ICE credentials.
    async fn restart_ice(&self, peer: &PeerId) -> Result<SessionDescription>;

    /// Send one frame over an established channel.
    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<()>;

    /// Tear down the channel, connected or not. Closing an unknown peer is a no-op.
    async fn close(&self, peer: &PeerId) -> Result<()>;
}

/// Asynchronous outcome reported by a [`ChannelProvider`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel to `peer` is open and usable.
    Connected(PeerId),
    /// Negotiation or the open channel failed.
    Failed { peer: PeerId, reason: String },
    /// The remote side closed the channel.
    Closed(PeerId),
    /// Connectivity dropped but the channel may recover with an ICE restart.
    Interrupted(PeerId),
    /// A local ICE candidate to forward to `peer` over signaling.
    LocalCandidate { peer: PeerId, candidate: IceCandidate },
    /// A frame received from `peer`.
    Data { peer: PeerId, frame: Vec<u8> },
}

impl ChannelEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            ChannelEvent::Connected(peer)
            | ChannelEvent::Closed(peer)
            | ChannelEvent::Interrupted(peer) => *peer,
            ChannelEvent::Failed { peer, .. }
            | ChannelEvent::LocalCandidate { peer, .. }
            | ChannelEvent::Data { peer, .. } => *peer,
        }
    }
}
