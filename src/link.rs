//! # Peer Link
//!
//! State machine for one peer-to-peer channel:
//!
//! ```text
//! New ──► Connecting ──► Connected ──► Closed
//!   │          │
//!   └──────────┴──► Failed
//! ```
//!
//! `is_initiator` is fixed at creation. Remote ICE candidates that arrive
//! before the remote description are queued in arrival order and handed back
//! when the description is set.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::MeshError;
use crate::identity::PeerId;
use crate::messages::{IceCandidate, SessionDescription};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    /// Still negotiating.
    pub fn is_pending(&self) -> bool {
        matches!(self, LinkState::New | LinkState::Connecting)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a link for the public API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub peer_id: PeerId,
    pub state: LinkState,
    pub is_initiator: bool,
    pub age: Duration,
    pub idle: Duration,
}

#[derive(Debug)]
pub struct PeerLink {
    peer_id: PeerId,
    is_initiator: bool,
    state: LinkState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_ice_candidates: Vec<IceCandidate>,
    created_at: Instant,
    last_activity_at: Instant,
    ice_restarts: u32,
    restart_pending: bool,
}

impl PeerLink {
    pub fn new(peer_id: PeerId, is_initiator: bool, now: Instant) -> Self {
        Self {
            peer_id,
            is_initiator,
            state: LinkState::New,
            local_description: None,
            remote_description: None,
            pending_ice_candidates: Vec::new(),
            created_at: now,
            last_activity_at: now,
            ice_restarts: 0,
            restart_pending: false,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_ice_candidates.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts
    }

    /// We sent an ICE-restart offer and are waiting for its answer.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    fn conflict(&self, operation: &'static str) -> MeshError {
        MeshError::StateConflict {
            peer: self.peer_id,
            state: self.state,
            operation,
        }
    }

    /// Record the local offer or answer and move `New → Connecting`.
    pub fn begin_connecting(&mut self, local: SessionDescription, now: Instant) -> Result<(), MeshError> {
        if self.state != LinkState::New {
            return Err(self.conflict("set local description on"));
        }
        self.local_description = Some(local);
        self.state = LinkState::Connecting;
        self.last_activity_at = now;
        Ok(())
    }

    /// Set the remote description once, returning queued candidates in order.
    pub fn set_remote_description(
        &mut self,
        remote: SessionDescription,
        now: Instant,
    ) -> Result<Vec<IceCandidate>, MeshError> {
        if !self.state.is_pending() || self.remote_description.is_some() {
            return Err(self.conflict("set remote description on"));
        }
        self.remote_description = Some(remote);
        self.last_activity_at = now;
        Ok(std::mem::take(&mut self.pending_ice_candidates))
    }

    /// Returns the candidate back when it can be applied right away, otherwise
    /// queues it until the remote description arrives.
    pub fn queue_or_release(&mut self, candidate: IceCandidate) -> Result<Option<IceCandidate>, MeshError> {
        if self.state.is_terminal() {
            return Err(self.conflict("add ICE candidate to"));
        }
        if self.remote_description.is_some() {
            Ok(Some(candidate))
        } else {
            self.pending_ice_candidates.push(candidate);
            Ok(None)
        }
    }

    pub fn mark_connected(&mut self, now: Instant) -> Result<(), MeshError> {
        match self.state {
            LinkState::Connecting => {
                self.state = LinkState::Connected;
                self.last_activity_at = now;
                Ok(())
            }
            LinkState::Connected => Ok(()),
            _ => Err(self.conflict("mark connected")),
        }
    }

    pub fn mark_failed(&mut self) {
        if !self.state.is_terminal() {
            self.state = LinkState::Failed;
        }
        self.pending_ice_candidates.clear();
    }

    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = LinkState::Closed;
        }
        self.pending_ice_candidates.clear();
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    /// Replace the local description with an ICE-restart offer.
    pub fn begin_ice_restart(&mut self, offer: SessionDescription, now: Instant) -> Result<(), MeshError> {
        if self.state != LinkState::Connected {
            return Err(self.conflict("restart ICE on"));
        }
        self.local_description = Some(offer);
        self.restart_pending = true;
        self.ice_restarts += 1;
        self.last_activity_at = now;
        Ok(())
    }

    /// Answer side of a restart: both descriptions are replaced.
    pub fn accept_ice_restart(
        &mut self,
        remote_offer: SessionDescription,
        local_answer: SessionDescription,
        now: Instant,
    ) -> Result<(), MeshError> {
        if self.state != LinkState::Connected {
            return Err(self.conflict("accept ICE restart on"));
        }
        self.remote_description = Some(remote_offer);
        self.local_description = Some(local_answer);
        self.ice_restarts += 1;
        self.last_activity_at = now;
        Ok(())
    }

    pub fn complete_ice_restart(&mut self, answer: SessionDescription, now: Instant) -> Result<(), MeshError> {
        if self.state != LinkState::Connected || !self.restart_pending {
            return Err(self.conflict("complete ICE restart on"));
        }
        self.remote_description = Some(answer);
        self.restart_pending = false;
        self.last_activity_at = now;
        Ok(())
    }

    /// A negotiating link older than `attempt_timeout`, or a connected link
    /// silent for longer than `idle_timeout`.
    pub fn is_stale(&self, now: Instant, attempt_timeout: Duration, idle_timeout: Duration) -> bool {
        match self.state {
            LinkState::New | LinkState::Connecting => {
                now.saturating_duration_since(self.created_at) > attempt_timeout
            }
            LinkState::Connected => now.saturating_duration_since(self.last_activity_at) > idle_timeout,
            LinkState::Failed | LinkState::Closed => true,
        }
    }

    pub fn info(&self, now: Instant) -> LinkInfo {
        LinkInfo {
            peer_id: self.peer_id,
            state: self.state,
            is_initiator: self.is_initiator,
            age: now.saturating_duration_since(self.created_at),
            idle: now.saturating_duration_since(self.last_activity_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_bytes([0x42; 20])
    }

    fn sdp_offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\ns=offer-body")
    }

    fn sdp_answer() -> SessionDescription {
        SessionDescription::answer("v=0\r\ns=answer-body")
    }

    #[test]
    fn initiator_path_reaches_connected() {
        let now = Instant::now();
        let mut link = PeerLink::new(peer(), true, now);
        assert_eq!(link.state(), LinkState::New);

        link.begin_connecting(sdp_offer(), now).unwrap();
        assert_eq!(link.state(), LinkState::Connecting);
        link.set_remote_description(sdp_answer(), now).unwrap();
        link.mark_connected(now).unwrap();
        assert!(link.is_connected());
        assert!(link.is_initiator());
    }

    #[test]
    fn candidates_queue_until_remote_description() {
        let now = Instant::now();
        let mut link = PeerLink::new(peer(), true, now);
        link.begin_connecting(sdp_offer(), now).unwrap();

        assert_eq!(link.queue_or_release(IceCandidate::new("c1")).unwrap(), None);
        assert_eq!(link.queue_or_release(IceCandidate::new("c2")).unwrap(), None);
        assert_eq!(link.pending_candidates(), 2);

        let flushed = link.set_remote_description(sdp_answer(), now).unwrap();
        assert_eq!(flushed, vec![IceCandidate::new("c1"), IceCandidate::new("c2")]);
        assert_eq!(link.pending_candidates(), 0);

        let direct = link.queue_or_release(IceCandidate::new("c3")).unwrap();
        assert_eq!(direct, Some(IceCandidate::new("c3")));
    }

    #[test]
    fn remote_description_is_set_once() {
        let now = Instant::now();
        let mut link = PeerLink::new(peer(), true, now);
        link.begin_connecting(sdp_offer(), now).unwrap();
        link.set_remote_description(sdp_answer(), now).unwrap();
        let err = link.set_remote_description(sdp_answer(), now).unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[test]
    fn cannot_connect_from_new() {
        let now = Instant::now();
        let mut link = PeerLink::new(peer(), false, now);
        assert!(link.mark_connected(now).is_err());
        assert_eq!(link.state(), LinkState::New);
    }

    #[test]
    fn terminal_states_stick() {
        let now = Instant::now();
        let mut link = PeerLink::new(peer(), false, now);
        link.mark_failed();
        link.close();
        assert_eq!(link.state(), LinkState::Failed);
        assert!(link.queue_or_release(IceCandidate::new("c")).is_err());
    }

    #[test]
    fn staleness_depends_on_state() {
        let start = Instant::now();
        let attempt = Duration::from_secs(30);
        let idle = Duration::from_secs(90);
        let mut link = PeerLink::new(peer(), true, start);
        link.begin_connecting(sdp_offer(), start).unwrap();

        assert!(!link.is_stale(start + Duration::from_secs(10), attempt, idle));
        assert!(link.is_stale(start + Duration::from_secs(31), attempt, idle));

        link.set_remote_description(sdp_answer(), start).unwrap();
        link.mark_connected(start).unwrap();
        assert!(!link.is_stale(start + Duration::from_secs(60), attempt, idle));
        link.record_activity(start + Duration::from_secs(60));
        assert!(!link.is_stale(start + Duration::from_secs(120), attempt, idle));
        assert!(link.is_stale(start + Duration::from_secs(151), attempt, idle));
    }

    #[test]
    fn ice_restart_round_trip() {
        let now = Instant::now();
        let mut link = PeerLink::new(peer(), true, now);
        link.begin_connecting(sdp_offer(), now).unwrap();
        link.set_remote_description(sdp_answer(), now).unwrap();

        assert!(link.begin_ice_restart(sdp_offer(), now).is_err());
        link.mark_connected(now).unwrap();
        link.begin_ice_restart(sdp_offer(), now).unwrap();
        link.complete_ice_restart(sdp_answer(), now).unwrap();
        assert_eq!(link.ice_restarts(), 1);
        assert!(link.complete_ice_restart(sdp_answer(), now).is_err());
    }
}
