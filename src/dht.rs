//! # WebDHT
//!
//! Versioned key/value store placed on the mesh by XOR proximity.
//!
//! ## Placement
//!
//! A key is hashed into the 160-bit id space ([`key_id`]). Its replica set is the
//! `replication_factor` closest ids among the connected peers and the local
//! node. A write always keeps a local replica and sends `Store` to the other
//! members of the replica set; a read that misses locally asks the closest
//! connected peers with `FindValue` and keeps the highest record returned.
//!
//! ## Conflicts
//!
//! Records are ordered by `(version, issuer)`. A record only replaces one that
//! is strictly lower, so concurrent writers converge on the same winner at every
//! replica and a version never goes backwards.
//!
//! ## Subscriptions
//!
//! | Side | State | Effect |
//! |------|-------|--------|
//! | Local | `subscriptions` | applied changes raise a [`ValueChange`] |
//! | Remote | `watchers` | applied changes are pushed as `ValueChanged` frames |
//!
//! ## TTL
//!
//! Expiry is authoritative. Reads check it lazily and [`WebDht::sweep`] removes
//! expired entries, so an expired value is never served again.
//!
//! The store does no I/O. Every operation returns a [`DhtOutput`] listing the
//! frames the caller must send and the local changes it must announce.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::identity::PeerId;
use crate::messages::{DhtFrame, DhtRecord};
use crate::proximity::closest_of;

pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub replication_factor: usize,
    pub default_ttl: Duration,
    pub lookup_timeout: Duration,
    pub max_value_size: usize,
    pub max_entries: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            default_ttl: DEFAULT_TTL,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Position of `key` in the peer id space.
pub fn key_id(key: &str) -> PeerId {
    PeerId::hash_of(key.as_bytes())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub issuer: PeerId,
    pub expires_at: Instant,
    pub updated_at: Instant,
}

impl DhtEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn rank(&self) -> (u64, PeerId) {
        (self.version, self.issuer)
    }

    fn to_record(&self, now: Instant) -> DhtRecord {
        DhtRecord {
            value: self.value.clone(),
            version: self.version,
            issuer: self.issuer,
            ttl_ms: self.expires_at.saturating_duration_since(now).as_millis() as u64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    /// The incoming record did not beat the stored one.
    Stale,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, ApplyOutcome::Stale)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Falls back to `DhtConfig::default_ttl`.
    pub ttl: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub subscribe: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub ttl: Option<Duration>,
    /// Explicit version for the new record; must exceed the current one.
    pub version: Option<u64>,
}

/// A change applied to a key this node subscribes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueChange {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
    pub issuer: PeerId,
}

#[derive(Debug, Default)]
pub struct DhtOutput {
    pub frames: Vec<(PeerId, DhtFrame)>,
    pub changes: Vec<ValueChange>,
}

impl DhtOutput {
    fn send(&mut self, peer: PeerId, frame: DhtFrame) {
        self.frames.push((peer, frame));
    }

    fn absorb(&mut self, other: DhtOutput) {
        self.frames.extend(other.frames);
        self.changes.extend(other.changes);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub enabled: bool,
    pub stored_keys: usize,
    pub subscriptions: usize,
    pub watched_keys: usize,
    pub pending_lookups: usize,
    pub replication_factor: usize,
}

enum LookupPurpose {
    Get {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Update {
        value: Vec<u8>,
        options: UpdateOptions,
        reply: oneshot::Sender<bool>,
    },
}

struct PendingLookup {
    key: String,
    purpose: LookupPurpose,
    awaiting: HashSet<PeerId>,
    best: Option<DhtRecord>,
    deadline: Instant,
}

fn record_rank(record: &DhtRecord) -> (u64, PeerId) {
    (record.version, record.issuer)
}

pub struct WebDht {
    local: PeerId,
    config: DhtConfig,
    entries: LruCache<String, DhtEntry>,
    subscriptions: HashSet<String>,
    watchers: HashMap<String, HashSet<PeerId>>,
    pending: HashMap<u64, PendingLookup>,
    next_request_id: u64,
}

impl WebDht {
    pub fn new(local: PeerId, config: DhtConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            local,
            config,
            entries: LruCache::new(cap),
            subscriptions: HashSet::new(),
            watchers: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
        }
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn stats(&self) -> DhtStats {
        DhtStats {
            enabled: true,
            stored_keys: self.entries.len(),
            subscriptions: self.subscriptions.len(),
            watched_keys: self.watchers.len(),
            pending_lookups: self.pending.len(),
            replication_factor: self.config.replication_factor,
        }
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.subscriptions.contains(key)
    }

    /// Live local entry for `key`. Expired entries are dropped on the way.
    pub fn local_entry(&mut self, key: &str, now: Instant) -> Option<&DhtEntry> {
        if self.entries.peek(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.pop(key);
            trace!(key, "dropped expired entry on read");
            return None;
        }
        self.entries.get(key)
    }

    /// The `replication_factor` closest ids to `key` among `connected` and us.
    pub fn replica_set(&self, key: &str, connected: &[PeerId]) -> Vec<PeerId> {
        let candidates = connected.iter().copied().chain(std::iter::once(self.local));
        let mut set = closest_of(&key_id(key), candidates);
        set.truncate(self.config.replication_factor.max(1));
        set
    }

    /// Replica set members other than us.
    fn holders(&self, key: &str, connected: &[PeerId]) -> Vec<PeerId> {
        self.replica_set(key, connected)
            .into_iter()
            .filter(|p| *p != self.local)
            .collect()
    }

    /// Closest connected peers to ask for `key`.
    fn lookup_targets(&self, key: &str, connected: &[PeerId]) -> Vec<PeerId> {
        let mut targets = closest_of(&key_id(key), connected.iter().copied());
        targets.truncate(self.config.replication_factor.max(1));
        targets
    }

    fn check_size(&self, value: &[u8]) -> Result<(), MeshError> {
        if value.len() > self.config.max_value_size {
            return Err(MeshError::MessageTooLarge {
                size: value.len(),
                limit: self.config.max_value_size,
            });
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    // ========================================================================
    // Local store
    // ========================================================================

    fn apply(&mut self, key: &str, record: &DhtRecord, now: Instant) -> ApplyOutcome {
        if record.ttl_ms == 0 {
            return ApplyOutcome::Stale;
        }
        let incoming = (record.version, record.issuer);
        let outcome = match self.local_entry(key, now) {
            Some(current) if current.rank() >= incoming => return ApplyOutcome::Stale,
            Some(_) => ApplyOutcome::Replaced,
            None => ApplyOutcome::Inserted,
        };
        let entry = DhtEntry {
            value: record.value.clone(),
            version: record.version,
            issuer: record.issuer,
            expires_at: now + Duration::from_millis(record.ttl_ms),
            updated_at: now,
        };
        if let Some((evicted, _)) = self.entries.push(key.to_string(), entry)
            && evicted != key
        {
            debug!(evicted = %evicted, "DHT store full, evicted least recently used key");
        }
        outcome
    }

    /// Announce an applied change: locally if subscribed, remotely to watchers.
    fn announce(&self, key: &str, record: &DhtRecord, skip: &[PeerId], out: &mut DhtOutput) {
        if self.subscriptions.contains(key) {
            out.changes.push(ValueChange {
                key: key.to_string(),
                value: record.value.clone(),
                version: record.version,
                issuer: record.issuer,
            });
        }
        if let Some(watchers) = self.watchers.get(key) {
            for watcher in watchers.iter().filter(|w| !skip.contains(w)) {
                out.send(
                    *watcher,
                    DhtFrame::ValueChanged {
                        key: key.to_string(),
                        record: record.clone(),
                    },
                );
            }
        }
    }

    fn write(
        &mut self,
        key: &str,
        value: Vec<u8>,
        version: u64,
        ttl: Option<Duration>,
        connected: &[PeerId],
        now: Instant,
    ) -> Option<DhtOutput> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let record = DhtRecord {
            value,
            version,
            issuer: self.local,
            ttl_ms: (ttl.as_millis() as u64).max(1),
        };
        if !self.apply(key, &record, now).changed() {
            debug!(key, version, "local write lost to a newer record");
            return None;
        }

        let mut out = DhtOutput::default();
        let holders = self.holders(key, connected);
        for holder in &holders {
            out.send(
                *holder,
                DhtFrame::Store {
                    key: key.to_string(),
                    record: record.clone(),
                },
            );
        }
        self.announce(key, &record, &holders, &mut out);
        debug!(key, version, replicas = holders.len() + 1, "stored DHT value");
        Some(out)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Store `value` under the next version of `key`. With peers connected
    /// the current version is first fetched from the replicas, so a node
    /// that never held the key cannot write underneath them.
    pub fn put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
        connected: &[PeerId],
        now: Instant,
        reply: oneshot::Sender<bool>,
    ) -> Result<DhtOutput, MeshError> {
        let options = UpdateOptions {
            ttl: options.ttl,
            version: None,
        };
        self.update(key, value, options, connected, now, reply)
    }

    /// Resolve `key`, answering on `reply` now or once the lookup completes.
    pub fn get(
        &mut self,
        key: &str,
        options: GetOptions,
        connected: &[PeerId],
        now: Instant,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    ) -> DhtOutput {
        let mut out = DhtOutput::default();
        if options.subscribe {
            out.absorb(self.subscribe_local(key, connected));
        }
        if let Some(entry) = self.local_entry(key, now) {
            let _ = reply.send(Some(entry.value.clone()));
            return out;
        }
        out.absorb(self.start_lookup(key, LookupPurpose::Get { reply }, connected, now));
        out
    }

    /// Write a new version of `key` on top of the newest one the replicas
    /// know. Answers on `reply` once the write is placed or refused.
    pub fn update(
        &mut self,
        key: &str,
        value: Vec<u8>,
        options: UpdateOptions,
        connected: &[PeerId],
        now: Instant,
        reply: oneshot::Sender<bool>,
    ) -> Result<DhtOutput, MeshError> {
        self.check_size(&value)?;
        if connected.is_empty() {
            let current = self.local_entry(key, now).map(|e| e.version);
            let (accepted, out) = self.finish_update(key, value, options, current, connected, now);
            let _ = reply.send(accepted);
            return Ok(out);
        }
        let purpose = LookupPurpose::Update {
            value,
            options,
            reply,
        };
        Ok(self.start_lookup(key, purpose, connected, now))
    }

    fn finish_update(
        &mut self,
        key: &str,
        value: Vec<u8>,
        options: UpdateOptions,
        current: Option<u64>,
        connected: &[PeerId],
        now: Instant,
    ) -> (bool, DhtOutput) {
        let current = current.unwrap_or(0);
        let version = match options.version {
            Some(requested) if requested <= current => {
                debug!(key, requested, current, "rejected DHT update with stale version");
                return (false, DhtOutput::default());
            }
            Some(requested) => requested,
            None => current.saturating_add(1),
        };
        match self.write(key, value, version, options.ttl, connected, now) {
            Some(out) => (true, out),
            None => (false, DhtOutput::default()),
        }
    }

    fn subscribe_local(&mut self, key: &str, connected: &[PeerId]) -> DhtOutput {
        let mut out = DhtOutput::default();
        self.subscriptions.insert(key.to_string());
        for holder in self.holders(key, connected) {
            out.send(holder, DhtFrame::Subscribe { key: key.to_string() });
        }
        out
    }

    pub fn unsubscribe(&mut self, key: &str, connected: &[PeerId]) -> DhtOutput {
        let mut out = DhtOutput::default();
        if self.subscriptions.remove(key) {
            for peer in connected {
                out.send(*peer, DhtFrame::Unsubscribe { key: key.to_string() });
            }
        }
        out
    }

    // ========================================================================
    // Remote lookups
    // ========================================================================

    fn start_lookup(
        &mut self,
        key: &str,
        purpose: LookupPurpose,
        connected: &[PeerId],
        now: Instant,
    ) -> DhtOutput {
        let targets = self.lookup_targets(key, connected);
        let request_id = self.next_request_id();
        let mut lookup = PendingLookup {
            key: key.to_string(),
            purpose,
            awaiting: targets.iter().copied().collect(),
            best: None,
            deadline: now + self.config.lookup_timeout,
        };
        if targets.is_empty() {
            lookup.awaiting.clear();
            return self.complete(lookup, connected, now);
        }
        let mut out = DhtOutput::default();
        for target in &targets {
            out.send(
                *target,
                DhtFrame::FindValue {
                    request_id,
                    key: key.to_string(),
                },
            );
        }
        trace!(key, request_id, peers = targets.len(), "started DHT lookup");
        self.pending.insert(request_id, lookup);
        out
    }

    fn complete(&mut self, lookup: PendingLookup, connected: &[PeerId], now: Instant) -> DhtOutput {
        let PendingLookup { key, purpose, best, .. } = lookup;
        // keep what we learned so later reads and updates see it
        if let Some(record) = &best {
            self.apply(&key, record, now);
        }
        let best_value = best
            .filter(|r| r.ttl_ms > 0)
            .map(|r| (r.version, r.value));
        match purpose {
            LookupPurpose::Get { reply } => {
                let _ = reply.send(best_value.map(|(_, value)| value));
                DhtOutput::default()
            }
            LookupPurpose::Update { value, options, reply } => {
                let current = self.local_entry(&key, now).map(|e| e.version).or(best_value.map(|(v, _)| v));
                let (accepted, out) = self.finish_update(&key, value, options, current, connected, now);
                let _ = reply.send(accepted);
                out
            }
        }
    }

    fn on_value(
        &mut self,
        from: PeerId,
        request_id: u64,
        record: Option<DhtRecord>,
        connected: &[PeerId],
        now: Instant,
    ) -> DhtOutput {
        let Some(lookup) = self.pending.get_mut(&request_id) else {
            trace!(request_id, from = %from.short(), "ignoring DHT response for unknown lookup");
            return DhtOutput::default();
        };
        if !lookup.awaiting.remove(&from) {
            return DhtOutput::default();
        }
        if let Some(record) = record
            && lookup.best.as_ref().is_none_or(|b| record_rank(&record) > record_rank(b))
        {
            lookup.best = Some(record);
        }
        if !lookup.awaiting.is_empty() {
            return DhtOutput::default();
        }
        match self.pending.remove(&request_id) {
            Some(lookup) => self.complete(lookup, connected, now),
            None => DhtOutput::default(),
        }
    }

    /// Finish lookups whose deadline passed with whatever was collected.
    pub fn expire_lookups(&mut self, connected: &[PeerId], now: Instant) -> DhtOutput {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, l)| now >= l.deadline)
            .map(|(id, _)| *id)
            .collect();
        let mut out = DhtOutput::default();
        for request_id in expired {
            if let Some(lookup) = self.pending.remove(&request_id) {
                debug!(key = %lookup.key, request_id, unanswered = lookup.awaiting.len(), "DHT lookup timed out");
                out.absorb(self.complete(lookup, connected, now));
            }
        }
        out
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    pub fn handle_frame(&mut self, from: PeerId, frame: DhtFrame, connected: &[PeerId], now: Instant) -> DhtOutput {
        let mut out = DhtOutput::default();
        match frame {
            DhtFrame::Store { key, record } | DhtFrame::ValueChanged { key, record } => {
                if record.value.len() > self.config.max_value_size {
                    debug!(key, from = %from.short(), size = record.value.len(), "ignoring oversized DHT record");
                    return out;
                }
                if self.apply(&key, &record, now).changed() {
                    trace!(key, version = record.version, from = %from.short(), "applied remote DHT record");
                    self.announce(&key, &record, &[from], &mut out);
                }
            }
            DhtFrame::FindValue { request_id, key } => {
                let record = self.local_entry(&key, now).map(|e| e.to_record(now));
                out.send(from, DhtFrame::Value { request_id, key, record });
            }
            DhtFrame::Value { request_id, record, .. } => {
                out.absorb(self.on_value(from, request_id, record, connected, now));
            }
            DhtFrame::Subscribe { key } => {
                self.watchers.entry(key).or_default().insert(from);
            }
            DhtFrame::Unsubscribe { key } => {
                if let Some(watchers) = self.watchers.get_mut(&key) {
                    watchers.remove(&from);
                    if watchers.is_empty() {
                        self.watchers.remove(&key);
                    }
                }
            }
        }
        out
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), remaining = self.entries.len(), "swept expired DHT entries");
        }
        expired.len()
    }

    /// A link went away: drop its watches and stop waiting on it.
    pub fn forget_peer(&mut self, peer: &PeerId, connected: &[PeerId], now: Instant) -> DhtOutput {
        self.watchers.retain(|_, watchers| {
            watchers.remove(peer);
            !watchers.is_empty()
        });
        let finished: Vec<u64> = self
            .pending
            .iter_mut()
            .filter_map(|(id, lookup)| {
                (lookup.awaiting.remove(peer) && lookup.awaiting.is_empty()).then_some(*id)
            })
            .collect();
        let mut out = DhtOutput::default();
        for request_id in finished {
            if let Some(lookup) = self.pending.remove(&request_id) {
                out.absorb(self.complete(lookup, connected, now));
            }
        }
        out
    }

    /// Abandon remote state when leaving the mesh. Stored values survive.
    pub fn reset_remote_state(&mut self) {
        for (_, lookup) in self.pending.drain() {
            match lookup.purpose {
                LookupPurpose::Get { reply } => {
                    let _ = reply.send(None);
                }
                LookupPurpose::Update { reply, .. } => {
                    let _ = reply.send(false);
                }
            }
        }
        self.watchers.clear();
    }
}
