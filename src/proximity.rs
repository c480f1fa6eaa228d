//! # Proximity Index
//!
//! Pure XOR-metric helpers shared by discovery (who to dial), eviction (who to
//! drop) and the DHT (who holds a key).
//!
//! `distance(a, b)` is the bitwise XOR of both identifiers read as a 160-bit
//! big-endian unsigned integer. [`Distance`] stores those bytes and derives its
//! ordering from them, which equals numeric ordering.

use std::cmp::Ordering;
use std::fmt;

use crate::identity::{PEER_ID_BYTES, PeerId};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; PEER_ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; PEER_ID_BYTES]);

    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// Number of leading zero bits, i.e. the length of the shared prefix.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[inline]
pub fn distance(a: &PeerId, b: &PeerId) -> Distance {
    Distance(a.xor_distance(b))
}

/// Order `a` and `b` by distance to `target`, ties broken by id.
#[inline]
pub fn cmp_by_distance(target: &PeerId, a: &PeerId, b: &PeerId) -> Ordering {
    distance(target, a)
        .cmp(&distance(target, b))
        .then_with(|| a.cmp(b))
}

/// Candidates sorted ascending by distance to `target`. Duplicates are kept.
pub fn closest_of<I>(target: &PeerId, candidates: I) -> Vec<PeerId>
where
    I: IntoIterator<Item = PeerId>,
{
    let mut sorted: Vec<PeerId> = candidates.into_iter().collect();
    sorted.sort_by(|a, b| cmp_by_distance(target, a, b));
    sorted
}

pub fn farthest_of<I>(target: &PeerId, candidates: I) -> Option<PeerId>
where
    I: IntoIterator<Item = PeerId>,
{
    candidates
        .into_iter()
        .max_by(|a, b| cmp_by_distance(target, a, b))
}

/// True when `candidate` is strictly closer to `target` than `incumbent`.
#[inline]
pub fn is_closer(target: &PeerId, candidate: &PeerId, incumbent: &PeerId) -> bool {
    distance(target, candidate) < distance(target, incumbent)
}
