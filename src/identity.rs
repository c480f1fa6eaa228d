//! # Peer Identity
//!
//! A [`PeerId`] is a 160-bit identifier written as exactly 40 hexadecimal
//! characters. It names a mesh participant and doubles as its coordinate in the
//! XOR metric space used by discovery, eviction and the DHT.
//!
//! Ordering of `PeerId` is the numeric ordering of the 160-bit value, which is
//! also the lexicographic ordering of its lowercase hex form. The connection
//! initiator rule relies on this total order.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Width of a peer identifier in bytes.
pub const PEER_ID_BYTES: usize = 20;

/// Width of a peer identifier in hex characters.
pub const PEER_ID_HEX_LEN: usize = PEER_ID_BYTES * 2;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// Draw a fresh identifier from the operating system RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive an identifier in the peer id space from arbitrary bytes.
    ///
    /// Used to place DHT keys: `blake3(data)` truncated to 160 bits.
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..PEER_ID_BYTES]);
        Self(bytes)
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; PEER_ID_BYTES] {
        let mut out = [0u8; PEER_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse a 40-character hex string. Either case is accepted.
    pub fn from_hex(s: &str) -> Result<Self, MeshError> {
        if !is_valid_peer_id(s) {
            return Err(MeshError::InvalidPeerId(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| MeshError::InvalidPeerId(s.to_string()))?;
        let mut arr = [0u8; PEER_ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Exactly 40 hex characters, nothing else.
pub fn is_valid_peer_id(s: &str) -> bool {
    s.len() == PEER_ID_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FromStr for PeerId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; PEER_ID_BYTES]> for PeerId {
    fn from(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }
}

/// Milliseconds since the Unix epoch, used for envelope timestamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), PEER_ID_HEX_LEN);
    }

    #[test]
    fn hex_round_trip_normalizes_case() {
        let upper = "ABCDEF0123456789ABCDEF0123456789ABCDEF01";
        let id = PeerId::from_hex(upper).unwrap();
        assert_eq!(id.to_hex(), upper.to_lowercase());
        assert_eq!(id, upper.to_lowercase().parse::<PeerId>().unwrap());
    }

    #[test]
    fn validator_rejects_wrong_shapes() {
        assert!(!is_valid_peer_id(""));
        assert!(!is_valid_peer_id(&"a".repeat(39)));
        assert!(!is_valid_peer_id(&"a".repeat(41)));
        assert!(!is_valid_peer_id(&format!("{}g", "a".repeat(39))));
        assert!(!is_valid_peer_id(&format!("0x{}", "a".repeat(38))));
        assert!(is_valid_peer_id(&"0".repeat(40)));

        let err = PeerId::from_hex("not-a-peer").unwrap_err();
        assert!(matches!(err, MeshError::InvalidPeerId(_)));
    }

    #[test]
    fn ordering_matches_hex_ordering() {
        let a = PeerId::from_hex(&format!("0f{}", "f".repeat(38))).unwrap();
        let b = PeerId::from_hex(&format!("10{}", "0".repeat(38))).unwrap();
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = PeerId::from_bytes([0xFF; PEER_ID_BYTES]);
        let b = PeerId::from_bytes([0x0F; PEER_ID_BYTES]);
        assert_eq!(a.xor_distance(&a), [0u8; PEER_ID_BYTES]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xF0; PEER_ID_BYTES]);
    }

    #[test]
    fn hash_of_is_stable() {
        assert_eq!(PeerId::hash_of(b"room:lobby"), PeerId::hash_of(b"room:lobby"));
        assert_ne!(PeerId::hash_of(b"room:lobby"), PeerId::hash_of(b"room:other"));
    }
}
