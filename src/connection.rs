//! # Connection Manager
//!
//! Owns every [`PeerLink`] and in-flight [`ConnectionAttempt`]. Responsible for:
//!
//! - **Initiator rule**: the larger `PeerId` of a pair sends the offer
//! - **Race resolution**: yield our outbound attempt when the rightful initiator
//!   offers first, ignore offers from the peer we should be dialling
//! - **Admission**: accept below `max_peers`, else evict a farther peer, else
//!   purge stale links, else reject with `connection-rejected`
//! - **Cleanup**: attempt timeouts, stale links, failed and closed channels
//!
//! Every removed link is recorded as a [`Departure`] that the mesh actor drains
//! after each operation to emit events and clean dependent state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::eviction::{EvictionManager, REASON_CLOSER_PEER};
use crate::identity::PeerId;
use crate::link::{LinkInfo, LinkState, PeerLink};
use crate::messages::{IceCandidate, RejectionNotice, SdpType, SessionDescription};
use crate::protocols::ChannelProvider;

pub const REASON_ATTEMPT_TIMEOUT: &str = "connection attempt timed out";
pub const REASON_STALE: &str = "stale link";
pub const REASON_YIELDED: &str = "yielded to inbound offer";

/// The initiator of a pair is the larger id. Pure function of the pair.
#[inline]
pub fn initiator_of(a: PeerId, b: PeerId) -> PeerId {
    a.max(b)
}

#[inline]
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub peer_id: PeerId,
    pub started_at: Instant,
}

/// A link that left the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Departure {
    pub peer_id: PeerId,
    pub was_connected: bool,
    pub state: LinkState,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered {
        answer: SessionDescription,
        /// Connected peer dropped to make room.
        evicted: Option<PeerId>,
        /// Our own outbound attempt was abandoned in favour of this offer.
        yielded: bool,
    },
    Rejected(RejectionNotice),
}

pub struct ConnectionManager {
    local: PeerId,
    channels: Arc<dyn ChannelProvider>,
    links: HashMap<PeerId, PeerLink>,
    attempts: HashMap<PeerId, ConnectionAttempt>,
    departures: Vec<Departure>,
    attempt_timeout: Duration,
    stale_link_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        local: PeerId,
        channels: Arc<dyn ChannelProvider>,
        attempt_timeout: Duration,
        stale_link_timeout: Duration,
    ) -> Self {
        Self {
            local,
            channels,
            links: HashMap::new(),
            attempts: HashMap::new(),
            departures: Vec::new(),
            attempt_timeout,
            stale_link_timeout,
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn connected_count(&self) -> usize {
        self.links.values().filter(|l| l.is_connected()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.links.values().filter(|l| l.state().is_pending()).count()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Connected peers in id order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .values()
            .filter(|l| l.is_connected())
            .map(PeerLink::peer_id)
            .collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.links.get(peer).is_some_and(PeerLink::is_connected)
    }

    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn is_attempting(&self, peer: &PeerId) -> bool {
        self.attempts.contains_key(peer)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn link(&self, peer: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    pub fn link_infos(&self, now: Instant) -> Vec<LinkInfo> {
        let mut infos: Vec<LinkInfo> = self.links.values().map(|l| l.info(now)).collect();
        infos.sort_by_key(|i| i.peer_id);
        infos
    }

    /// Inbound admission: connected peers below `max_peers`.
    pub fn can_accept_more(&self, config: &MeshConfig) -> bool {
        self.connected_count() < config.max_peers
    }

    /// Outbound admission also counts links still negotiating.
    pub fn can_dial_more(&self, config: &MeshConfig) -> bool {
        self.connected_count() + self.pending_count() < config.max_peers
    }

    pub fn stale_count(&self, now: Instant) -> usize {
        self.links
            .values()
            .filter(|l| l.is_stale(now, self.attempt_timeout, self.stale_link_timeout))
            .count()
    }

    pub fn drain_departures(&mut self) -> Vec<Departure> {
        std::mem::take(&mut self.departures)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Open an outbound link and return the offer to signal to `peer`.
    pub async fn dial(
        &mut self,
        peer: PeerId,
        config: &MeshConfig,
        now: Instant,
    ) -> Result<SessionDescription, MeshError> {
        if peer == self.local {
            return Err(MeshError::SelfConnection);
        }
        if let Some(link) = self.links.get(&peer) {
            return Err(MeshError::StateConflict {
                peer,
                state: link.state(),
                operation: "dial",
            });
        }
        if self.attempts.contains_key(&peer) {
            return Err(MeshError::StateConflict {
                peer,
                state: LinkState::New,
                operation: "dial",
            });
        }
        if !self.can_dial_more(config) {
            return Err(MeshError::CapacityReached {
                current: self.connected_count() + self.pending_count(),
                max: config.max_peers,
            });
        }

        self.attempts.insert(
            peer,
            ConnectionAttempt {
                peer_id: peer,
                started_at: now,
            },
        );
        let mut link = PeerLink::new(peer, true, now);

        let offer = match self.channels.create_offer(&peer).await {
            Ok(offer) => offer,
            Err(e) => {
                self.attempts.remove(&peer);
                self.close_channel(peer).await;
                return Err(MeshError::transport(peer, e));
            }
        };
        link.begin_connecting(offer.clone(), now)?;
        self.links.insert(peer, link);

        debug!(peer = %peer.short(), "dialing peer");
        Ok(offer)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle an offer end to end: validation, race resolution, admission and
    /// answer creation. Ignored offers come back as state conflicts.
    pub async fn accept_offer(
        &mut self,
        peer: PeerId,
        offer: &SessionDescription,
        config: &MeshConfig,
        eviction: &mut EvictionManager,
        now: Instant,
    ) -> Result<OfferOutcome, MeshError> {
        offer.validate(SdpType::Offer, peer)?;
        if peer == self.local {
            return Err(MeshError::SelfConnection);
        }

        let mut yielded = false;
        if let Some(link) = self.links.get(&peer) {
            let conflict = MeshError::StateConflict {
                peer,
                state: link.state(),
                operation: "accept offer on",
            };
            if link.is_connected() || !link.is_initiator() {
                // duplicate offer or an inbound negotiation already running
                return Err(conflict);
            }
            if should_initiate(&self.local, &peer) {
                trace!(peer = %peer.short(), "ignoring offer from peer we are dialling");
                return Err(conflict);
            }
            debug!(peer = %peer.short(), "yielding outbound attempt to rightful initiator");
            self.disconnect(peer, REASON_YIELDED).await;
            yielded = true;
        }
        self.attempts.remove(&peer);

        let mut victim = None;
        if !self.can_accept_more(config) {
            let connected = self.connected_peers();
            victim = eviction.should_evict_for_peer(&peer, &connected, config);
            if victim.is_none() {
                let purged = self.cleanup_stale_peers(now).await;
                if !purged.is_empty() {
                    debug!(purged = purged.len(), "purged stale links to admit offer");
                }
                if !self.can_accept_more(config) {
                    debug!(
                        peer = %peer.short(),
                        connected = self.connected_count(),
                        max = config.max_peers,
                        "rejecting offer at capacity"
                    );
                    return Ok(OfferOutcome::Rejected(RejectionNotice::capacity(
                        self.connected_count(),
                        config.max_peers,
                    )));
                }
            }
        }

        let mut link = PeerLink::new(peer, false, now);
        link.set_remote_description(offer.clone(), now)?;
        let answer = match self.channels.create_answer(&peer, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.close_channel(peer).await;
                return Err(MeshError::transport(peer, e));
            }
        };
        link.begin_connecting(answer.clone(), now)?;

        // only give up the farther link once the closer one has an answer
        if let Some(victim) = victim {
            eviction.evict_peer(self, victim, REASON_CLOSER_PEER).await;
        }
        self.links.insert(peer, link);

        Ok(OfferOutcome::Answered {
            answer,
            evicted: victim,
            yielded,
        })
    }

    /// Complete our outbound handshake.
    pub async fn accept_answer(
        &mut self,
        peer: PeerId,
        answer: &SessionDescription,
        now: Instant,
    ) -> Result<(), MeshError> {
        answer.validate(SdpType::Answer, peer)?;
        let link = self.links.get(&peer).ok_or(MeshError::UnknownLink { peer })?;
        if !link.is_initiator() || link.state() != LinkState::Connecting || link.remote_description().is_some() {
            return Err(MeshError::StateConflict {
                peer,
                state: link.state(),
                operation: "accept answer on",
            });
        }

        if let Err(e) = self.channels.apply_answer(&peer, answer).await {
            self.fail(peer, &format!("applying answer failed: {e}")).await;
            return Err(MeshError::transport(peer, e));
        }

        let queued = match self.links.get_mut(&peer) {
            Some(link) => link.set_remote_description(answer.clone(), now)?,
            None => return Err(MeshError::UnknownLink { peer }),
        };
        self.flush_candidates(peer, queued).await;
        Ok(())
    }

    pub async fn handle_ice_candidate(&mut self, peer: PeerId, candidate: IceCandidate) -> Result<(), MeshError> {
        let link = self.links.get_mut(&peer).ok_or(MeshError::UnknownLink { peer })?;
        if let Some(candidate) = link.queue_or_release(candidate)? {
            self.channels
                .add_ice_candidate(&peer, &candidate)
                .await
                .map_err(|e| MeshError::transport(peer, e))?;
        }
        Ok(())
    }

    async fn flush_candidates(&self, peer: PeerId, queued: Vec<IceCandidate>) {
        for candidate in queued {
            if let Err(e) = self.channels.add_ice_candidate(&peer, &candidate).await {
                debug!(peer = %peer.short(), error = %e, "queued ICE candidate rejected");
            }
        }
    }

    // ========================================================================
    // ICE restart
    // ========================================================================

    pub async fn restart_ice(&mut self, peer: PeerId, now: Instant) -> Result<SessionDescription, MeshError> {
        let link = self.links.get(&peer).ok_or(MeshError::UnknownLink { peer })?;
        if !link.is_connected() || !link.is_initiator() {
            return Err(MeshError::StateConflict {
                peer,
                state: link.state(),
                operation: "restart ICE on",
            });
        }
        let offer = self
            .channels
            .restart_ice(&peer)
            .await
            .map_err(|e| MeshError::transport(peer, e))?;
        if let Some(link) = self.links.get_mut(&peer) {
            link.begin_ice_restart(offer.clone(), now)?;
        }
        Ok(offer)
    }

    pub async fn accept_ice_restart_offer(
        &mut self,
        peer: PeerId,
        offer: &SessionDescription,
        now: Instant,
    ) -> Result<SessionDescription, MeshError> {
        offer.validate(SdpType::Offer, peer)?;
        let link = self.links.get(&peer).ok_or(MeshError::UnknownLink { peer })?;
        if !link.is_connected() {
            return Err(MeshError::StateConflict {
                peer,
                state: link.state(),
                operation: "accept ICE restart on",
            });
        }
        let answer = self
            .channels
            .create_answer(&peer, offer)
            .await
            .map_err(|e| MeshError::transport(peer, e))?;
        if let Some(link) = self.links.get_mut(&peer) {
            link.accept_ice_restart(offer.clone(), answer.clone(), now)?;
        }
        Ok(answer)
    }

    pub async fn accept_ice_restart_answer(
        &mut self,
        peer: PeerId,
        answer: &SessionDescription,
        now: Instant,
    ) -> Result<(), MeshError> {
        answer.validate(SdpType::Answer, peer)?;
        let link = self.links.get(&peer).ok_or(MeshError::UnknownLink { peer })?;
        if !link.is_connected() || !link.restart_pending() {
            return Err(MeshError::StateConflict {
                peer,
                state: link.state(),
                operation: "complete ICE restart on",
            });
        }
        self.channels
            .apply_answer(&peer, answer)
            .await
            .map_err(|e| MeshError::transport(peer, e))?;
        match self.links.get_mut(&peer) {
            Some(link) => link.complete_ice_restart(answer.clone(), now),
            None => Err(MeshError::UnknownLink { peer }),
        }
    }

    // ========================================================================
    // Channel outcomes
    // ========================================================================

    /// Returns whether we initiated the now-connected link.
    pub fn on_channel_connected(&mut self, peer: PeerId, now: Instant) -> Result<bool, MeshError> {
        let link = self.links.get_mut(&peer).ok_or(MeshError::UnknownLink { peer })?;
        link.mark_connected(now)?;
        self.attempts.remove(&peer);
        Ok(link.is_initiator())
    }

    /// Transport failure: the link goes to `Failed` and is removed. No retry here.
    pub async fn fail(&mut self, peer: PeerId, reason: &str) -> bool {
        self.attempts.remove(&peer);
        let Some(mut link) = self.links.remove(&peer) else {
            return false;
        };
        let was_connected = link.is_connected();
        link.mark_failed();
        self.close_channel(peer).await;
        warn!(peer = %peer.short(), reason, "link failed");
        self.departures.push(Departure {
            peer_id: peer,
            was_connected,
            state: link.state(),
            reason: reason.to_string(),
        });
        true
    }

    /// The remote side closed the channel.
    pub fn on_channel_closed(&mut self, peer: PeerId) -> bool {
        self.attempts.remove(&peer);
        let Some(mut link) = self.links.remove(&peer) else {
            return false;
        };
        let was_connected = link.is_connected();
        link.close();
        self.departures.push(Departure {
            peer_id: peer,
            was_connected,
            state: link.state(),
            reason: "closed by peer".to_string(),
        });
        true
    }

    pub fn record_activity(&mut self, peer: &PeerId, now: Instant) -> bool {
        match self.links.get_mut(peer) {
            Some(link) if link.is_connected() => {
                link.record_activity(now);
                true
            }
            _ => false,
        }
    }

    /// Tear down a provider channel that has no link, e.g. one that opened
    /// after we already dropped the negotiation.
    pub async fn close_orphan_channel(&self, peer: PeerId) {
        if self.links.contains_key(&peer) {
            return;
        }
        self.close_channel(peer).await;
    }

    async fn close_channel(&self, peer: PeerId) {
        if let Err(e) = self.channels.close(&peer).await {
            debug!(peer = %peer.short(), error = %e, "channel close failed");
        }
    }

    pub async fn send_frame(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), MeshError> {
        if !self.is_connected(peer) {
            return Err(MeshError::UnknownLink { peer: *peer });
        }
        self.channels
            .send(peer, frame)
            .await
            .map_err(|e| MeshError::transport(*peer, e))
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close and remove the link and any attempt. Returns whether a link existed.
    pub async fn disconnect(&mut self, peer: PeerId, reason: &str) -> bool {
        let had_attempt = self.attempts.remove(&peer).is_some();
        let Some(mut link) = self.links.remove(&peer) else {
            return had_attempt;
        };
        let was_connected = link.is_connected();
        link.close();
        self.close_channel(peer).await;
        debug!(peer = %peer.short(), reason, was_connected, "disconnected peer");
        self.departures.push(Departure {
            peer_id: peer,
            was_connected,
            state: link.state(),
            reason: reason.to_string(),
        });
        true
    }

    pub async fn disconnect_all(&mut self, reason: &str) -> usize {
        let peers: Vec<PeerId> = self.links.keys().copied().collect();
        self.attempts.clear();
        let mut closed = 0;
        for peer in peers {
            if self.disconnect(peer, reason).await {
                closed += 1;
            }
        }
        closed
    }

    /// Drop the attempt and any still-negotiating link toward `peer`.
    pub async fn abort_attempt(&mut self, peer: PeerId, reason: &str) -> bool {
        self.attempts.remove(&peer);
        match self.links.get(&peer) {
            Some(link) if !link.is_connected() => self.disconnect(peer, reason).await,
            _ => false,
        }
    }

    /// Abandon attempts older than the attempt timeout. Never touches connected links.
    pub async fn expire_attempts(&mut self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .attempts
            .values()
            .filter(|a| now.saturating_duration_since(a.started_at) > self.attempt_timeout)
            .map(|a| a.peer_id)
            .collect();
        for peer in &expired {
            self.abort_attempt(*peer, REASON_ATTEMPT_TIMEOUT).await;
        }
        expired
    }

    /// Remove negotiating links past the attempt timeout and connected links
    /// that have been silent past the stale-link timeout.
    pub async fn cleanup_stale_peers(&mut self, now: Instant) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .links
            .values()
            .filter(|l| l.is_stale(now, self.attempt_timeout, self.stale_link_timeout))
            .map(PeerLink::peer_id)
            .collect();
        for peer in &stale {
            self.disconnect(*peer, REASON_STALE).await;
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubChannels;

    fn id(first: u8) -> PeerId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        PeerId::from_bytes(bytes)
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\ns=stub-offer")
    }

    fn answer() -> SessionDescription {
        SessionDescription::answer("v=0\r\ns=stub-answer")
    }

    fn manager(local: PeerId) -> (ConnectionManager, Arc<StubChannels>) {
        let channels = Arc::new(StubChannels::default());
        let manager = ConnectionManager::new(
            local,
            channels.clone(),
            Duration::from_secs(30),
            Duration::from_secs(90),
        );
        (manager, channels)
    }

    /// Bring up an inbound link from `peer` to connected.
    async fn connect_inbound(cm: &mut ConnectionManager, peer: PeerId, config: &MeshConfig) {
        let mut eviction = EvictionManager::new(cm.local());
        let outcome = cm
            .accept_offer(peer, &offer(), config, &mut eviction, Instant::now())
            .await
            .unwrap();
        assert!(matches!(outcome, OfferOutcome::Answered { .. }));
        cm.on_channel_connected(peer, Instant::now()).unwrap();
    }

    #[test]
    fn initiator_is_pure_and_total() {
        for _ in 0..64 {
            let a = PeerId::random();
            let b = PeerId::random();
            let first = initiator_of(a, b);
            assert_eq!(first, initiator_of(a, b));
            assert_eq!(first, initiator_of(b, a));
            assert_ne!(should_initiate(&a, &b), should_initiate(&b, &a));
        }
    }

    #[tokio::test]
    async fn dial_creates_initiator_link_and_attempt() {
        let (mut cm, channels) = manager(id(0x80));
        let config = MeshConfig::default();
        let sdp = cm.dial(id(0x10), &config, Instant::now()).await.unwrap();

        assert_eq!(sdp.kind, SdpType::Offer);
        assert!(cm.is_attempting(&id(0x10)));
        let link = cm.link(&id(0x10)).unwrap();
        assert!(link.is_initiator());
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(channels.offers_created(), 1);

        let err = cm.dial(id(0x10), &config, Instant::now()).await.unwrap_err();
        assert!(err.is_state_conflict());
        assert!(matches!(
            cm.dial(id(0x80), &config, Instant::now()).await,
            Err(MeshError::SelfConnection)
        ));
    }

    #[tokio::test]
    async fn failed_offer_leaves_no_state() {
        let (mut cm, channels) = manager(id(0x80));
        channels.fail_offers(true);
        let err = cm.dial(id(0x10), &MeshConfig::default(), Instant::now()).await.unwrap_err();
        assert!(matches!(err, MeshError::Transport { .. }));
        assert!(!cm.has_link(&id(0x10)));
        assert!(!cm.is_attempting(&id(0x10)));
    }

    #[tokio::test]
    async fn outbound_dials_respect_capacity() {
        let (mut cm, _) = manager(id(0x80));
        let config = MeshConfig {
            max_peers: 2,
            ..MeshConfig::default()
        };
        cm.dial(id(0x01), &config, Instant::now()).await.unwrap();
        cm.dial(id(0x02), &config, Instant::now()).await.unwrap();
        let err = cm.dial(id(0x03), &config, Instant::now()).await.unwrap_err();
        assert!(matches!(err, MeshError::CapacityReached { current: 2, max: 2 }));
    }

    #[tokio::test]
    async fn smaller_peer_yields_to_larger_offer() {
        // local 0x10 dialled 0x80, but 0x80 is the rightful initiator
        let (mut cm, channels) = manager(id(0x10));
        let config = MeshConfig::default();
        let mut eviction = EvictionManager::new(id(0x10));
        cm.dial(id(0x80), &config, Instant::now()).await.unwrap();

        let outcome = cm
            .accept_offer(id(0x80), &offer(), &config, &mut eviction, Instant::now())
            .await
            .unwrap();
        assert!(matches!(outcome, OfferOutcome::Answered { yielded: true, .. }));
        assert!(!cm.link(&id(0x80)).unwrap().is_initiator());
        assert!(!cm.is_attempting(&id(0x80)));
        assert_eq!(channels.closed(), vec![id(0x80)]);
        assert_eq!(cm.link_count(), 1);
    }

    #[tokio::test]
    async fn larger_peer_ignores_stale_offer() {
        let (mut cm, _) = manager(id(0x80));
        let config = MeshConfig::default();
        let mut eviction = EvictionManager::new(id(0x80));
        cm.dial(id(0x10), &config, Instant::now()).await.unwrap();

        let err = cm
            .accept_offer(id(0x10), &offer(), &config, &mut eviction, Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_state_conflict());
        assert!(cm.link(&id(0x10)).unwrap().is_initiator());
        assert!(cm.is_attempting(&id(0x10)));
    }

    #[tokio::test]
    async fn duplicate_offer_on_connected_link_is_ignored() {
        let (mut cm, _) = manager(id(0x10));
        let config = MeshConfig::default();
        connect_inbound(&mut cm, id(0x80), &config).await;

        let mut eviction = EvictionManager::new(id(0x10));
        let err = cm
            .accept_offer(id(0x80), &offer(), &config, &mut eviction, Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_state_conflict());
        assert!(cm.is_connected(&id(0x80)));
    }

    #[tokio::test]
    async fn malformed_offer_mutates_nothing() {
        let (mut cm, channels) = manager(id(0x10));
        let mut eviction = EvictionManager::new(id(0x10));
        let bad = SessionDescription::offer("");
        let err = cm
            .accept_offer(id(0x80), &bad, &MeshConfig::default(), &mut eviction, Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(cm.link_count(), 0);
        assert_eq!(channels.answers_created(), 0);
    }

    #[tokio::test]
    async fn full_mesh_evicts_farther_peer_for_closer_offer() {
        let local = id(0x10);
        let (mut cm, _) = manager(local);
        let config = MeshConfig {
            max_peers: 1,
            ..MeshConfig::default()
        };
        connect_inbound(&mut cm, id(0x40), &config).await;
        cm.drain_departures();

        let mut eviction = EvictionManager::new(local);
        let outcome = cm
            .accept_offer(id(0x50), &offer(), &config, &mut eviction, Instant::now())
            .await
            .unwrap();
        assert!(matches!(outcome, OfferOutcome::Answered { evicted: Some(p), .. } if p == id(0x40)));
        assert!(!cm.has_link(&id(0x40)));
        assert_eq!(eviction.evicted_total(), 1);

        let departures = cm.drain_departures();
        assert_eq!(departures.len(), 1);
        assert!(departures[0].was_connected);
        assert_eq!(departures[0].reason, REASON_CLOSER_PEER);
    }

    #[tokio::test]
    async fn full_mesh_rejects_farther_offer() {
        let local = id(0x10);
        let (mut cm, _) = manager(local);
        let config = MeshConfig {
            max_peers: 1,
            ..MeshConfig::default()
        };
        connect_inbound(&mut cm, id(0x11), &config).await;

        let mut eviction = EvictionManager::new(local);
        let outcome = cm
            .accept_offer(id(0xF0), &offer(), &config, &mut eviction, Instant::now())
            .await
            .unwrap();
        match outcome {
            OfferOutcome::Rejected(notice) => {
                assert_eq!(notice.reason, crate::messages::REJECT_MAX_PEERS);
                assert_eq!(notice.current_count, 1);
                assert_eq!(notice.max_peers, 1);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(cm.is_connected(&id(0x11)));
        assert!(!cm.has_link(&id(0xF0)));
    }

    #[tokio::test]
    async fn stale_link_is_purged_to_admit_offer() {
        let local = id(0x10);
        let (mut cm, _) = manager(local);
        let config = MeshConfig {
            max_peers: 1,
            eviction_strategy: false,
            ..MeshConfig::default()
        };
        connect_inbound(&mut cm, id(0x11), &config).await;

        let mut eviction = EvictionManager::new(local);
        let later = Instant::now() + Duration::from_secs(120);
        let outcome = cm
            .accept_offer(id(0xF0), &offer(), &config, &mut eviction, later)
            .await
            .unwrap();
        assert!(matches!(outcome, OfferOutcome::Answered { evicted: None, .. }));
        assert!(!cm.has_link(&id(0x11)));
    }

    #[tokio::test]
    async fn answer_flushes_queued_candidates_in_order() {
        let (mut cm, channels) = manager(id(0x80));
        cm.dial(id(0x10), &MeshConfig::default(), Instant::now()).await.unwrap();

        cm.handle_ice_candidate(id(0x10), IceCandidate::new("c1")).await.unwrap();
        cm.handle_ice_candidate(id(0x10), IceCandidate::new("c2")).await.unwrap();
        assert!(channels.candidates().is_empty());

        cm.accept_answer(id(0x10), &answer(), Instant::now()).await.unwrap();
        assert_eq!(channels.candidates(), vec!["c1".to_string(), "c2".to_string()]);

        let err = cm.accept_answer(id(0x10), &answer(), Instant::now()).await.unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn answer_failure_fails_link() {
        let (mut cm, channels) = manager(id(0x80));
        cm.dial(id(0x10), &MeshConfig::default(), Instant::now()).await.unwrap();
        channels.fail_answers(true);

        let err = cm.accept_answer(id(0x10), &answer(), Instant::now()).await.unwrap_err();
        assert!(matches!(err, MeshError::Transport { .. }));
        assert!(!cm.has_link(&id(0x10)));
        let departures = cm.drain_departures();
        assert_eq!(departures[0].state, LinkState::Failed);
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_is_conflict() {
        let (mut cm, _) = manager(id(0x80));
        let err = cm.handle_ice_candidate(id(0x10), IceCandidate::new("c")).await.unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn attempts_expire_without_touching_connected_links() {
        let (mut cm, _) = manager(id(0x80));
        let config = MeshConfig::default();
        let start = Instant::now();
        cm.dial(id(0x10), &config, start).await.unwrap();
        connect_inbound(&mut cm, id(0x90), &config).await;

        let expired = cm.expire_attempts(start + Duration::from_secs(31)).await;
        assert_eq!(expired, vec![id(0x10)]);
        assert!(!cm.has_link(&id(0x10)));
        assert!(cm.is_connected(&id(0x90)));
    }

    #[tokio::test]
    async fn excess_peers_disconnect_farthest_first() {
        let local = id(0x00);
        let (mut cm, _) = manager(local);
        let wide = MeshConfig {
            max_peers: 5,
            ..MeshConfig::default()
        };
        for first in [0x01, 0x02, 0x40, 0x80] {
            connect_inbound(&mut cm, id(first), &wide).await;
        }
        let narrow = MeshConfig {
            max_peers: 2,
            ..MeshConfig::default()
        };
        let mut eviction = EvictionManager::new(local);
        let evicted = eviction.disconnect_excess_peers(&mut cm, &narrow).await;
        assert_eq!(evicted, vec![id(0x80), id(0x40)]);
        assert_eq!(cm.connected_peers(), vec![id(0x01), id(0x02)]);
    }

    #[tokio::test]
    async fn ice_restart_requires_connected_initiator() {
        let (mut cm, channels) = manager(id(0x80));
        let config = MeshConfig::default();
        cm.dial(id(0x10), &config, Instant::now()).await.unwrap();
        assert!(cm.restart_ice(id(0x10), Instant::now()).await.is_err());

        cm.accept_answer(id(0x10), &answer(), Instant::now()).await.unwrap();
        cm.on_channel_connected(id(0x10), Instant::now()).unwrap();
        let restart = cm.restart_ice(id(0x10), Instant::now()).await.unwrap();
        assert_eq!(restart.kind, SdpType::Offer);
        assert_eq!(channels.restarts(), 1);

        cm.accept_ice_restart_answer(id(0x10), &answer(), Instant::now()).await.unwrap();
        assert_eq!(cm.link(&id(0x10)).unwrap().ice_restarts(), 1);
    }

    #[tokio::test]
    async fn unsolicited_restart_answer_touches_nothing() {
        let (mut cm, channels) = manager(id(0x80));
        let config = MeshConfig::default();
        cm.dial(id(0x10), &config, Instant::now()).await.unwrap();
        let stray = SessionDescription::answer("v=0\r\ns=stray-restart");

        // still negotiating
        let err = cm.accept_ice_restart_answer(id(0x10), &stray, Instant::now()).await.unwrap_err();
        assert!(err.is_state_conflict());
        assert_eq!(channels.answers_applied(), 0);
        assert_eq!(cm.link(&id(0x10)).unwrap().state(), LinkState::Connecting);

        // connected, but no restart was started
        cm.accept_answer(id(0x10), &answer(), Instant::now()).await.unwrap();
        cm.on_channel_connected(id(0x10), Instant::now()).unwrap();
        let err = cm.accept_ice_restart_answer(id(0x10), &stray, Instant::now()).await.unwrap_err();
        assert!(err.is_state_conflict());
        assert_eq!(channels.answers_applied(), 1);
        assert!(cm.is_connected(&id(0x10)));
    }

    #[tokio::test]
    async fn failed_answer_keeps_farther_peer() {
        let local = id(0x10);
        let (mut cm, channels) = manager(local);
        let config = MeshConfig {
            max_peers: 1,
            ..MeshConfig::default()
        };
        connect_inbound(&mut cm, id(0x40), &config).await;
        cm.drain_departures();
        channels.fail_answer_creation(true);

        let mut eviction = EvictionManager::new(local);
        let err = cm
            .accept_offer(id(0x50), &offer(), &config, &mut eviction, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Transport { .. }));
        assert!(cm.is_connected(&id(0x40)));
        assert!(!cm.has_link(&id(0x50)));
        assert_eq!(eviction.evicted_total(), 0);
        assert!(cm.drain_departures().is_empty());
    }
}
