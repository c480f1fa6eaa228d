//! # Gossip
//!
//! Flood-fill messaging over the current links, de-duplicated by message id and
//! bounded by a hop count.
//!
//! ## Message Flow
//!
//! | Kind | Origin sends to | Relay behaviour | Delivered at |
//! |------|-----------------|-----------------|--------------|
//! | Broadcast | every connected link | forward to all links except sender | every node reached |
//! | Direct | the target if linked, else every link | forward unless we are the target | target only |
//!
//! `hop_count` starts at `max_hops`. A node that receives a message with
//! `hop_count = h` forwards it with `h - 1`, and only when `h - 1 > 0`, so a
//! broadcast reaches every node within `max_hops` hops.
//!
//! ## De-duplication
//!
//! Every id that passes through is remembered in an LRU cache bounded by
//! `seen_cache_size` entries and `seen_cache_ttl` age. A message is delivered to
//! the application at most once per node; messages whose origin is this node
//! are never delivered back to it.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use blake3::Hasher;
use lru::LruCache;
use tracing::trace;

use crate::error::MeshError;
use crate::identity::{PeerId, now_ms};
use crate::messages::{GossipKind, GossipMessage, MessageId};

pub const DEFAULT_MAX_HOPS: u8 = 10;
pub const DEFAULT_SEEN_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_SEEN_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Label used by plain `send_message` broadcasts.
pub const CHAT_LABEL: &str = "chat";

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub max_hops: u8,
    pub seen_cache_size: usize,
    pub seen_cache_ttl: Duration,
    pub max_message_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
            seen_cache_ttl: DEFAULT_SEEN_CACHE_TTL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A message delivered to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub origin: PeerId,
    /// Neighbour that handed us the message.
    pub from: PeerId,
    pub label: String,
    pub content: Vec<u8>,
    pub direct: bool,
    /// Hops taken from the origin, including the last one.
    pub hops: u8,
}

/// A message and the links it must be written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub message: GossipMessage,
    pub targets: Vec<PeerId>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Inbound {
    pub deliver: Option<ReceivedMessage>,
    pub forward: Option<Dispatch>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub originated: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub duplicates: u64,
}

pub struct GossipManager {
    local: PeerId,
    config: GossipConfig,
    seqno: u64,
    seen: LruCache<MessageId, Instant>,
    stats: GossipStats,
}

impl GossipManager {
    pub fn new(local: PeerId, config: GossipConfig) -> Self {
        let cap = NonZeroUsize::new(config.seen_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            local,
            config,
            seqno: 0,
            seen: LruCache::new(cap),
            stats: GossipStats::default(),
        }
    }

    pub fn stats(&self) -> GossipStats {
        self.stats
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    fn next_id(&mut self, content: &[u8], timestamp_ms: u64) -> MessageId {
        self.seqno = self.seqno.wrapping_add(1);
        let mut hasher = Hasher::new();
        hasher.update(self.local.as_bytes());
        hasher.update(&self.seqno.to_le_bytes());
        hasher.update(&timestamp_ms.to_le_bytes());
        hasher.update(content);
        MessageId::from_bytes(*hasher.finalize().as_bytes())
    }

    fn check_size(&self, content: &[u8]) -> Result<(), MeshError> {
        if content.len() > self.config.max_message_size {
            return Err(MeshError::MessageTooLarge {
                size: content.len(),
                limit: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn originate(&mut self, kind: GossipKind, label: &str, target: Option<PeerId>, content: Vec<u8>, now: Instant) -> GossipMessage {
        let timestamp_ms = now_ms();
        let id = self.next_id(&content, timestamp_ms);
        self.seen.put(id, now);
        self.stats.originated += 1;
        GossipMessage {
            id,
            kind,
            label: label.to_string(),
            origin: self.local,
            target,
            content,
            hop_count: self.config.max_hops.max(1),
            timestamp_ms,
        }
    }

    /// Originate a broadcast to every connected link.
    pub fn broadcast(
        &mut self,
        content: Vec<u8>,
        label: &str,
        connected: &[PeerId],
        now: Instant,
    ) -> Result<Dispatch, MeshError> {
        self.check_size(&content)?;
        let message = self.originate(GossipKind::Broadcast, label, None, content, now);
        trace!(msg_id = %hex::encode(&message.id.as_bytes()[..8]), peers = connected.len(), "originating broadcast");
        Ok(Dispatch {
            message,
            targets: connected.to_vec(),
        })
    }

    /// Originate a direct message. `None` when there is nowhere to send it.
    pub fn send_direct(
        &mut self,
        target: PeerId,
        content: Vec<u8>,
        label: &str,
        connected: &[PeerId],
        now: Instant,
    ) -> Result<Option<Dispatch>, MeshError> {
        self.check_size(&content)?;
        if target == self.local || connected.is_empty() {
            return Ok(None);
        }
        let message = self.originate(GossipKind::Direct, label, Some(target), content, now);
        let targets = if connected.contains(&target) {
            vec![target]
        } else {
            connected.to_vec()
        };
        Ok(Some(Dispatch { message, targets }))
    }

    /// Decide what to do with a message received from neighbour `from`.
    pub fn handle_incoming(
        &mut self,
        from: PeerId,
        message: GossipMessage,
        connected: &[PeerId],
        now: Instant,
    ) -> Inbound {
        let short_id = hex::encode(&message.id.as_bytes()[..8]);
        if message.origin == self.local {
            self.seen.put(message.id, now);
            trace!(msg_id = %short_id, "dropping own message echoed back");
            return Inbound::default();
        }
        if self.seen.contains(&message.id) {
            self.stats.duplicates += 1;
            trace!(msg_id = %short_id, from = %from.short(), "dropping duplicate gossip");
            return Inbound::default();
        }
        self.seen.put(message.id, now);

        if message.hop_count == 0 || message.content.len() > self.config.max_message_size {
            trace!(msg_id = %short_id, hop_count = message.hop_count, "dropping invalid gossip");
            return Inbound::default();
        }

        let hops = self.config.max_hops.saturating_sub(message.hop_count).saturating_add(1);
        let for_us = match message.kind {
            GossipKind::Broadcast => true,
            GossipKind::Direct => match message.target {
                Some(target) => target == self.local,
                None => {
                    trace!(msg_id = %short_id, "dropping direct message without target");
                    return Inbound::default();
                }
            },
        };

        let deliver = for_us.then(|| ReceivedMessage {
            id: message.id,
            origin: message.origin,
            from,
            label: message.label.clone(),
            content: message.content.clone(),
            direct: message.kind == GossipKind::Direct,
            hops,
        });
        if deliver.is_some() {
            self.stats.delivered += 1;
        }

        // the target of a direct message consumes it
        let relay = match message.kind {
            GossipKind::Broadcast => true,
            GossipKind::Direct => !for_us,
        };
        let forward = if relay && message.hop_count > 1 {
            let direct_target = message
                .target
                .filter(|t| message.kind == GossipKind::Direct && connected.contains(t));
            let targets: Vec<PeerId> = match direct_target {
                Some(t) => vec![t],
                None => connected
                    .iter()
                    .filter(|p| **p != from && **p != message.origin)
                    .copied()
                    .collect(),
            };
            if targets.is_empty() {
                None
            } else {
                self.stats.forwarded += 1;
                let mut relayed = message;
                relayed.hop_count -= 1;
                Some(Dispatch {
                    message: relayed,
                    targets,
                })
            }
        } else {
            None
        };

        Inbound { deliver, forward }
    }

    /// Drop seen ids older than the cache TTL.
    pub fn trim(&mut self, now: Instant) -> usize {
        let ttl = self.config.seen_cache_ttl;
        let expired: Vec<MessageId> = self
            .seen
            .iter()
            .filter(|(_, seen_at)| now.saturating_duration_since(**seen_at) > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.seen.pop(id);
        }
        if !expired.is_empty() {
            trace!(evicted = expired.len(), cache_size = self.seen.len(), "trimmed gossip seen-cache");
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
