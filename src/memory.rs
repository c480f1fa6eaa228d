//! In-process network for tests, simulation and the CLI demo.
//!
//! [`MemoryNetwork`] plays both collaborator roles for every local node: a
//! signaling relay ([`MemorySignaling`]) and a channel provider
//! ([`MemoryChannels`]). Each node has one ordered inbox; [`MemoryNetwork::attach`]
//! spawns a pump that feeds it into the node's [`Mesh`], preserving per-sender
//! order the way a real relay would.
//!
//! Channels negotiate instantly: applying an answer opens the channel on both
//! sides and reports `Connected` to each. Closing an open channel reports
//! `Closed` to the other side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::identity::PeerId;
use crate::mesh::Mesh;
use crate::messages::{IceCandidate, SessionDescription, SignalingEnvelope};
use crate::protocols::{ChannelEvent, ChannelProvider, SignalingTransport};

enum Inbound {
    Signal(SignalingEnvelope),
    Channel(ChannelEvent),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Offered,
    Answered,
    Open,
}

#[derive(Clone, Copy, Debug)]
struct Session {
    offerer: PeerId,
    state: SessionState,
}

fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    (a.min(b), a.max(b))
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<Inbound>>,
    receivers: HashMap<PeerId, mpsc::UnboundedReceiver<Inbound>>,
    sessions: HashMap<(PeerId, PeerId), Session>,
}

impl NetworkState {
    fn register(&mut self, peer: PeerId) {
        if !self.inboxes.contains_key(&peer) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inboxes.insert(peer, tx);
            self.receivers.insert(peer, rx);
        }
    }

    fn deliver(&self, to: &PeerId, item: Inbound) {
        if let Some(inbox) = self.inboxes.get(to)
            && inbox.send(item).is_err()
        {
            trace!(peer = %to.short(), "dropping delivery to detached node");
        }
    }
}

/// Shared in-memory relay and channel fabric.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    sdp_counter: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut NetworkState) -> R) -> Result<R> {
        let mut state = self.state.lock().map_err(|_| anyhow!("memory network poisoned"))?;
        Ok(f(&mut state))
    }

    pub fn signaling(&self, peer: PeerId) -> Arc<MemorySignaling> {
        let _ = self.with(|s| s.register(peer));
        Arc::new(MemorySignaling {
            local: peer,
            network: self.clone(),
        })
    }

    pub fn channels(&self, peer: PeerId) -> Arc<MemoryChannels> {
        let _ = self.with(|s| s.register(peer));
        Arc::new(MemoryChannels {
            local: peer,
            network: self.clone(),
        })
    }

    /// Start feeding `mesh` from its inbox. The pump ends when the mesh shuts down.
    pub fn attach(&self, mesh: &Mesh) -> Result<JoinHandle<()>> {
        let peer = mesh.peer_id();
        let mut rx = self
            .with(|s| {
                s.register(peer);
                s.receivers.remove(&peer)
            })?
            .ok_or_else(|| anyhow!("node {} already attached", peer.short()))?;
        let mesh = mesh.clone();
        Ok(tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let delivered = match item {
                    Inbound::Signal(envelope) => mesh.handle_signaling(envelope).await,
                    Inbound::Channel(event) => mesh.handle_channel_event(event).await,
                };
                if delivered.is_err() {
                    break;
                }
            }
            trace!(peer = %peer.short(), "memory pump stopped");
        }))
    }

    /// Number of open channels across the network.
    pub fn open_channels(&self) -> usize {
        self.with(|s| s.sessions.values().filter(|x| x.state == SessionState::Open).count())
            .unwrap_or(0)
    }

    fn next_sdp(&self, kind: &str, from: PeerId, to: PeerId) -> String {
        let n = self.sdp_counter.fetch_add(1, Ordering::Relaxed);
        format!("v=0\r\no=memory {n} 1 IN IP4 127.0.0.1\r\ns={kind} {} {}", from.short(), to.short())
    }
}

pub struct MemorySignaling {
    local: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        let target = match envelope.target_peer_id.as_deref() {
            None | Some("") => None,
            Some(t) => Some(PeerId::from_hex(t)?),
        };
        let local = self.local;
        self.network.with(|s| match target {
            Some(target) => s.deliver(&target, Inbound::Signal(envelope)),
            None => {
                for peer in s.inboxes.keys().filter(|p| **p != local) {
                    s.deliver(peer, Inbound::Signal(envelope.clone()));
                }
            }
        })
    }
}

pub struct MemoryChannels {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryChannels {
    fn local_candidate(&self, peer: PeerId) -> ChannelEvent {
        ChannelEvent::LocalCandidate {
            peer,
            candidate: IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", 40000 + u16::from(self.local.as_bytes()[0])),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            },
        }
    }
}

#[async_trait]
impl ChannelProvider for MemoryChannels {
    async fn create_offer(&self, peer: &PeerId) -> Result<SessionDescription> {
        let (local, peer) = (self.local, *peer);
        let sdp = self.network.next_sdp("offer", local, peer);
        let candidate = self.local_candidate(peer);
        self.network.with(|s| {
            s.sessions.insert(
                pair(local, peer),
                Session {
                    offerer: local,
                    state: SessionState::Offered,
                },
            );
            s.deliver(&local, Inbound::Channel(candidate));
        })?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self, peer: &PeerId, _offer: &SessionDescription) -> Result<SessionDescription> {
        let (local, peer) = (self.local, *peer);
        let sdp = self.network.next_sdp("answer", local, peer);
        let candidate = self.local_candidate(peer);
        self.network.with(|s| {
            let key = pair(local, peer);
            // an ICE restart answers on an open channel, which stays open
            if s.sessions.get(&key).is_none_or(|x| x.state != SessionState::Open) {
                s.sessions.insert(
                    key,
                    Session {
                        offerer: peer,
                        state: SessionState::Answered,
                    },
                );
                s.deliver(&local, Inbound::Channel(candidate));
            }
        })?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_answer(&self, peer: &PeerId, _answer: &SessionDescription) -> Result<()> {
        let (local, peer) = (self.local, *peer);
        self.network.with(|s| {
            let key = pair(local, peer);
            let session = *s
                .sessions
                .get(&key)
                .ok_or_else(|| anyhow!("no channel negotiation with {}", peer.short()))?;
            match session.state {
                SessionState::Open => Ok(()),
                SessionState::Answered if session.offerer == local => {
                    s.sessions.insert(
                        key,
                        Session {
                            offerer: local,
                            state: SessionState::Open,
                        },
                    );
                    s.deliver(&local, Inbound::Channel(ChannelEvent::Connected(peer)));
                    s.deliver(&peer, Inbound::Channel(ChannelEvent::Connected(local)));
                    Ok(())
                }
                _ => bail!("channel with {} is not awaiting our answer", peer.short()),
            }
        })?
    }

    async fn add_ice_candidate(&self, _peer: &PeerId, _candidate: &IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn restart_ice(&self, peer: &PeerId) -> Result<SessionDescription> {
        let (local, peer) = (self.local, *peer);
        let open = self.network.with(|s| {
            s.sessions
                .get(&pair(local, peer))
                .is_some_and(|x| x.state == SessionState::Open)
        })?;
        if !open {
            bail!("no open channel with {}", peer.short());
        }
        Ok(SessionDescription::offer(self.network.next_sdp("restart", local, peer)))
    }

    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<()> {
        let (local, peer) = (self.local, *peer);
        self.network.with(|s| {
            let open = s
                .sessions
                .get(&pair(local, peer))
                .is_some_and(|x| x.state == SessionState::Open);
            if !open {
                bail!("no open channel with {}", peer.short());
            }
            s.deliver(&peer, Inbound::Channel(ChannelEvent::Data { peer: local, frame }));
            Ok(())
        })?
    }

    async fn close(&self, peer: &PeerId) -> Result<()> {
        let (local, peer) = (self.local, *peer);
        self.network.with(|s| {
            let Some(session) = s.sessions.remove(&pair(local, peer)) else {
                return;
            };
            // a bare offer never reached the other side's channel layer
            if session.state != SessionState::Offered {
                s.deliver(&peer, Inbound::Channel(ChannelEvent::Closed(local)));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(first: u8) -> PeerId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        PeerId::from_bytes(bytes)
    }

    fn drain(network: &MemoryNetwork, peer: PeerId) -> Vec<ChannelEvent> {
        let mut rx = network.with(|s| s.receivers.remove(&peer)).unwrap().unwrap();
        let mut events = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Inbound::Channel(event) = item {
                events.push(event);
            }
        }
        network.with(|s| s.receivers.insert(peer, rx)).unwrap();
        events
    }

    #[tokio::test]
    async fn negotiation_opens_both_sides() {
        let network = MemoryNetwork::new();
        let (a, b) = (id(0x80), id(0x10));
        let a_channels = network.channels(a);
        let b_channels = network.channels(b);

        let offer = a_channels.create_offer(&b).await.unwrap();
        let answer = b_channels.create_answer(&a, &offer).await.unwrap();
        assert!(a_channels.send(&b, vec![1]).await.is_err());
        a_channels.apply_answer(&b, &answer).await.unwrap();
        assert_eq!(network.open_channels(), 1);

        a_channels.send(&b, vec![7]).await.unwrap();
        let at_b = drain(&network, b);
        assert!(at_b.contains(&ChannelEvent::Connected(a)));
        assert!(at_b.contains(&ChannelEvent::Data { peer: a, frame: vec![7] }));
        assert!(drain(&network, a).contains(&ChannelEvent::Connected(b)));

        b_channels.close(&a).await.unwrap();
        assert_eq!(network.open_channels(), 0);
        assert!(drain(&network, a).contains(&ChannelEvent::Closed(b)));
    }

    #[tokio::test]
    async fn closing_bare_offer_is_silent() {
        let network = MemoryNetwork::new();
        let (a, b) = (id(0x80), id(0x10));
        let a_channels = network.channels(a);
        network.channels(b);
        a_channels.create_offer(&b).await.unwrap();
        a_channels.close(&b).await.unwrap();
        assert!(drain(&network, b).is_empty());
    }

    #[tokio::test]
    async fn broadcast_signaling_skips_sender() {
        let network = MemoryNetwork::new();
        let (a, b, c) = (id(1), id(2), id(3));
        let signaling = network.signaling(a);
        network.signaling(b);
        network.signaling(c);
        let announce = SignalingEnvelope::new(a, None, &crate::messages::Signal::Announce);
        signaling.send(announce).await.unwrap();

        for (peer, expected) in [(a, 0), (b, 1), (c, 1)] {
            let mut rx = network.with(|s| s.receivers.remove(&peer)).unwrap().unwrap();
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            assert_eq!(count, expected, "peer {}", peer.short());
        }
    }
}
