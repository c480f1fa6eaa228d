//! # Wire Formats
//!
//! Two formats cross the process boundary:
//!
//! | Channel | Type | Encoding |
//! |---------|------|----------|
//! | Signaling relay | [`SignalingEnvelope`] carrying a [`Signal`] | JSON |
//! | Established peer link | [`LinkFrame`] | bincode, size bounded |
//!
//! ## Signaling
//!
//! The envelope is `{type, data, fromPeerId, targetPeerId?, timestamp}`. The
//! `type`/`data` pair is parsed into the closed [`Signal`] union; unknown types
//! and payloads missing required fields are rejected at this boundary, before
//! any mesh state is touched.
//!
//! ## Link frames
//!
//! Gossip, DHT and keepalive traffic share one frame enum. Decoding always goes
//! through [`decode_frame`], which enforces [`MAX_FRAME_SIZE`].

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshError;
use crate::identity::{PeerId, now_ms};

// ============================================================================
// Signaling envelope
// ============================================================================

/// Session descriptions shorter than this cannot be real SDP.
pub const MIN_SDP_LEN: usize = 10;

/// JSON envelope exchanged through the signaling collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub from_peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
}

impl SignalingEnvelope {
    pub fn new(from: PeerId, target: Option<PeerId>, signal: &Signal) -> Self {
        Self {
            kind: signal.type_name().to_string(),
            data: signal.to_data(),
            from_peer_id: from.to_hex(),
            target_peer_id: target.map(PeerId::to_hex),
            timestamp: now_ms(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        serde_json::from_str(json).map_err(|e| MeshError::MalformedSignal(e.to_string()))
    }

    /// Validate addressing and parse the payload.
    pub fn decode(&self) -> Result<InboundSignal, MeshError> {
        let from = PeerId::from_hex(&self.from_peer_id)?;
        let target = match self.target_peer_id.as_deref() {
            None | Some("") => None,
            Some(t) => Some(PeerId::from_hex(t)?),
        };
        let signal = Signal::from_parts(&self.kind, &self.data)?;
        Ok(InboundSignal {
            from,
            target,
            signal,
            timestamp: self.timestamp,
        })
    }
}

/// A decoded envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundSignal {
    pub from: PeerId,
    pub target: Option<PeerId>,
    pub signal: Signal,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Shape check performed before any link state changes.
    pub fn validate(&self, expected: SdpType, peer: PeerId) -> Result<(), MeshError> {
        if self.kind != expected {
            return Err(MeshError::InvalidSessionDescription {
                peer,
                reason: match expected {
                    SdpType::Offer => "expected type \"offer\"",
                    SdpType::Answer => "expected type \"answer\"",
                },
            });
        }
        if self.sdp.trim().len() < MIN_SDP_LEN {
            return Err(MeshError::InvalidSessionDescription {
                peer,
                reason: "sdp body missing or too short",
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Empty string signals end of candidates.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Reason string sent when an offer is refused for capacity.
pub const REJECT_MAX_PEERS: &str = "max_peers_reached";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionNotice {
    pub reason: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub current_count: usize,
    #[serde(default)]
    pub max_peers: usize,
}

impl RejectionNotice {
    pub fn capacity(current_count: usize, max_peers: usize) -> Self {
        Self {
            reason: REJECT_MAX_PEERS.to_string(),
            details: format!(
                "mesh full ({current_count}/{max_peers}) and no connected peer is farther than you"
            ),
            current_count,
            max_peers,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerDiscoveredData {
    peer_id: String,
}

#[derive(Serialize, Deserialize)]
struct RestartOfferData {
    offer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct RestartAnswerData {
    answer: SessionDescription,
}

/// Closed set of signaling messages, one variant per envelope `type`.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Announce,
    PeerDiscovered { peer_id: PeerId },
    Goodbye,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    IceRestartOffer(SessionDescription),
    IceRestartAnswer(SessionDescription),
    ConnectionRejected(RejectionNotice),
    Ping,
    Pong,
    Cleanup,
    CleanupAll,
}

fn parse_data<T: serde::de::DeserializeOwned>(kind: &str, data: &Value) -> Result<T, MeshError> {
    serde_json::from_value(data.clone())
        .map_err(|e| MeshError::MalformedSignal(format!("{kind}: {e}")))
}

fn to_value<T: Serialize>(data: T) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}

impl Signal {
    pub fn type_name(&self) -> &'static str {
        match self {
            Signal::Announce => "announce",
            Signal::PeerDiscovered { .. } => "peer-discovered",
            Signal::Goodbye => "goodbye",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
            Signal::IceRestartOffer(_) => "ice-restart-offer",
            Signal::IceRestartAnswer(_) => "ice-restart-answer",
            Signal::ConnectionRejected(_) => "connection-rejected",
            Signal::Ping => "ping",
            Signal::Pong => "pong",
            Signal::Cleanup => "cleanup",
            Signal::CleanupAll => "cleanup-all",
        }
    }

    pub fn from_parts(kind: &str, data: &Value) -> Result<Self, MeshError> {
        let signal = match kind {
            "announce" => Signal::Announce,
            "peer-discovered" => {
                let d: PeerDiscoveredData = parse_data(kind, data)?;
                Signal::PeerDiscovered {
                    peer_id: PeerId::from_hex(&d.peer_id)?,
                }
            }
            "goodbye" => Signal::Goodbye,
            "offer" => Signal::Offer(parse_data(kind, data)?),
            "answer" => Signal::Answer(parse_data(kind, data)?),
            "ice-candidate" => Signal::IceCandidate(parse_data(kind, data)?),
            "ice-restart-offer" => {
                let d: RestartOfferData = parse_data(kind, data)?;
                Signal::IceRestartOffer(d.offer)
            }
            "ice-restart-answer" => {
                let d: RestartAnswerData = parse_data(kind, data)?;
                Signal::IceRestartAnswer(d.answer)
            }
            "connection-rejected" => Signal::ConnectionRejected(parse_data(kind, data)?),
            "ping" => Signal::Ping,
            "pong" => Signal::Pong,
            "cleanup" => Signal::Cleanup,
            "cleanup-all" => Signal::CleanupAll,
            other => {
                return Err(MeshError::MalformedSignal(format!(
                    "unknown message type {other:?}"
                )));
            }
        };
        Ok(signal)
    }

    pub fn to_data(&self) -> Value {
        match self {
            Signal::Announce
            | Signal::Goodbye
            | Signal::Ping
            | Signal::Pong
            | Signal::Cleanup
            | Signal::CleanupAll => Value::Null,
            Signal::PeerDiscovered { peer_id } => to_value(PeerDiscoveredData {
                peer_id: peer_id.to_hex(),
            }),
            Signal::Offer(desc) | Signal::Answer(desc) => to_value(desc),
            Signal::IceCandidate(candidate) => to_value(candidate),
            Signal::IceRestartOffer(offer) => to_value(RestartOfferData {
                offer: offer.clone(),
            }),
            Signal::IceRestartAnswer(answer) => to_value(RestartAnswerData {
                answer: answer.clone(),
            }),
            Signal::ConnectionRejected(notice) => to_value(notice),
        }
    }

    /// Messages the signaling relay handles itself.
    pub fn is_transport_control(&self) -> bool {
        matches!(
            self,
            Signal::Ping | Signal::Pong | Signal::Cleanup | Signal::CleanupAll
        )
    }
}

// ============================================================================
// Link frames
// ============================================================================

/// Upper bound on a single decoded link frame.
pub const MAX_FRAME_SIZE: u64 = 256 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &LinkFrame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<LinkFrame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipKind {
    Broadcast,
    Direct,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: MessageId,
    pub kind: GossipKind,
    /// Application label, "chat" for plain broadcasts.
    pub label: String,
    pub origin: PeerId,
    pub target: Option<PeerId>,
    pub content: Vec<u8>,
    /// Remaining hops including the receiving one.
    pub hop_count: u8,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRecord {
    pub value: Vec<u8>,
    pub version: u64,
    pub issuer: PeerId,
    /// Remaining lifetime when the record was sent.
    pub ttl_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtFrame {
    Store {
        key: String,
        record: DhtRecord,
    },
    FindValue {
        request_id: u64,
        key: String,
    },
    Value {
        request_id: u64,
        key: String,
        record: Option<DhtRecord>,
    },
    Subscribe {
        key: String,
    },
    Unsubscribe {
        key: String,
    },
    ValueChanged {
        key: String,
        record: DhtRecord,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    Gossip(GossipMessage),
    Dht(DhtFrame),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}
