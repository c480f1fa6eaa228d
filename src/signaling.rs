//! Inbound signaling dispatch.
//!
//! Envelopes arrive through [`Mesh::handle_signaling`](crate::Mesh::handle_signaling)
//! and are handled here on the mesh actor. Nothing in this module touches the
//! network directly: replies go out through the signaling transport and
//! channel work goes through the [`ConnectionManager`](crate::connection::ConnectionManager).
//!
//! | Signal | Effect |
//! |--------|--------|
//! | `announce` / `peer-discovered` | record peer, maybe dial |
//! | `goodbye` | forget peer, close link |
//! | `offer` | admission, answer or `connection-rejected` |
//! | `answer` / `ice-candidate` | advance outbound negotiation |
//! | `ice-restart-offer` / `ice-restart-answer` | renegotiate a connected link |
//! | `connection-rejected` | drop attempt, look elsewhere |

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::connection::OfferOutcome;
use crate::error::MeshError;
use crate::identity::PeerId;
use crate::mesh::{MeshActor, MeshEvent, REASON_PEER_LEFT, REASON_REJECTED, StatusLevel};
use crate::messages::{InboundSignal, RejectionNotice, SessionDescription, Signal, SignalingEnvelope};

impl MeshActor {
    pub(crate) async fn on_signaling(&mut self, envelope: SignalingEnvelope) {
        if !self.addressed_to_us(&envelope) {
            return;
        }
        let inbound = match envelope.decode() {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!(kind = %envelope.kind, error = %e, "undecodable signaling message");
                self.status(StatusLevel::Error, format!("invalid signaling message: {e}"));
                return;
            }
        };
        if inbound.signal.is_transport_control() {
            return;
        }

        let InboundSignal { from, signal, .. } = inbound;
        let kind = signal.type_name();
        trace!(kind, from = %from.short(), "signaling message");
        if let Err(e) = self.dispatch_signal(from, signal).await {
            self.report_signal_error(kind, from, e);
        }
    }

    /// Routing filter on the raw envelope, so traffic for other peers and our
    /// own echoes are dropped without being decoded.
    fn addressed_to_us(&self, envelope: &SignalingEnvelope) -> bool {
        if !self.running {
            trace!(from = %envelope.from_peer_id, "not connected, ignoring signaling");
            return false;
        }
        let local = self.local.to_hex();
        if envelope.from_peer_id.eq_ignore_ascii_case(&local) {
            return false;
        }
        match envelope.target_peer_id.as_deref() {
            None | Some("") => true,
            Some(target) if target.eq_ignore_ascii_case(&local) => true,
            Some(_) => {
                trace!(from = %envelope.from_peer_id, "signaling addressed to another peer");
                false
            }
        }
    }

    async fn dispatch_signal(&mut self, from: PeerId, signal: Signal) -> Result<(), MeshError> {
        let now = Instant::now();
        match signal {
            Signal::Announce => self.on_announce(from, true).await,
            Signal::PeerDiscovered { peer_id } => self.on_announce(peer_id, false).await,
            Signal::Goodbye => {
                self.discovery.remove_discovered_peer(&from);
                self.connections.disconnect(from, REASON_PEER_LEFT).await;
            }
            Signal::Offer(offer) => self.on_offer(from, &offer, now).await?,
            Signal::Answer(answer) => self.connections.accept_answer(from, &answer, now).await?,
            Signal::IceCandidate(candidate) => self.connections.handle_ice_candidate(from, candidate).await?,
            Signal::IceRestartOffer(offer) => {
                let answer = self.connections.accept_ice_restart_offer(from, &offer, now).await?;
                self.send_signal(Some(from), Signal::IceRestartAnswer(answer)).await;
            }
            Signal::IceRestartAnswer(answer) => {
                self.connections.accept_ice_restart_answer(from, &answer, now).await?;
            }
            Signal::ConnectionRejected(notice) => self.on_rejected(from, &notice).await,
            Signal::Ping | Signal::Pong | Signal::Cleanup | Signal::CleanupAll => {}
        }
        Ok(())
    }

    /// Record a peer seen on signaling and dial it when the mesh wants it.
    /// A first `announce` is answered with a targeted announce so the newcomer
    /// learns about us without waiting for our next periodic one.
    async fn on_announce(&mut self, peer: PeerId, reply: bool) {
        if peer == self.local {
            return;
        }
        if self.discovery.add_discovered_peer(peer, Instant::now()) {
            self.emit(MeshEvent::PeerDiscovered { peer_id: peer });
            if reply {
                self.send_signal(Some(peer), Signal::Announce).await;
            }
        }
        if !self
            .discovery
            .should_dial_announced(&peer, &self.connections, &self.eviction, &self.config)
        {
            return;
        }
        self.make_room_for(&peer).await;
        if let Err(e) = self.dial(peer).await {
            debug!(peer = %peer.short(), error = %e, "not dialing announced peer");
        }
    }

    async fn on_offer(&mut self, from: PeerId, offer: &SessionDescription, now: Instant) -> Result<(), MeshError> {
        // validate before the offer can create any state
        offer.validate(crate::messages::SdpType::Offer, from)?;
        if self.discovery.add_discovered_peer(from, now) {
            self.emit(MeshEvent::PeerDiscovered { peer_id: from });
        }
        let outcome = self
            .connections
            .accept_offer(from, offer, &self.config, &mut self.eviction, now)
            .await?;
        match outcome {
            OfferOutcome::Answered { answer, evicted, .. } => {
                self.send_signal(Some(from), Signal::Answer(answer)).await;
                if let Some(victim) = evicted {
                    self.status(
                        StatusLevel::Info,
                        format!("evicted {} to admit closer peer {}", victim.short(), from.short()),
                    );
                }
            }
            OfferOutcome::Rejected(notice) => {
                debug!(peer = %from.short(), reason = %notice.reason, "rejecting offer");
                self.send_signal(Some(from), Signal::ConnectionRejected(notice)).await;
            }
        }
        Ok(())
    }

    async fn on_rejected(&mut self, from: PeerId, notice: &RejectionNotice) {
        debug!(
            peer = %from.short(),
            reason = %notice.reason,
            current = notice.current_count,
            max = notice.max_peers,
            "connection rejected by peer"
        );
        let aborted = self.connections.abort_attempt(from, REASON_REJECTED).await;
        if self.connections.connected_count() > 0 {
            if self.running {
                self.schedule.defer_optimize(Instant::now());
            }
        } else if !aborted {
            // an aborted link leaves as a departure and the isolation redial runs there
            self.react_to_loss(&[from]).await;
        }
    }

    fn report_signal_error(&self, kind: &'static str, from: PeerId, err: MeshError) {
        if err.is_validation() {
            debug!(kind, from = %from.short(), error = %err, "rejected invalid signaling message");
            self.status(StatusLevel::Error, format!("invalid {kind} from {}: {err}", from.short()));
        } else if err.is_state_conflict() {
            debug!(kind, from = %from.short(), error = %err, "ignoring signaling message");
            self.status(StatusLevel::Info, format!("ignored {kind} from {}: {err}", from.short()));
        } else if matches!(err, MeshError::Transport { .. }) {
            warn!(kind, from = %from.short(), error = %err, "transport error handling signaling");
            self.status(StatusLevel::Error, format!("{kind} from {} failed: {err}", from.short()));
        } else {
            debug!(kind, from = %from.short(), error = %err, "signaling message not applied");
        }
    }
}
