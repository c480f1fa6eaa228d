//! Recording collaborators for unit tests.

use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::identity::PeerId;
use crate::messages::{IceCandidate, SessionDescription, SignalingEnvelope};
use crate::protocols::{ChannelProvider, SignalingTransport};

#[derive(Default)]
struct StubState {
    offers: usize,
    answers: usize,
    applied: usize,
    restarts: usize,
    candidates: Vec<String>,
    closed: Vec<PeerId>,
    sent: Vec<(PeerId, Vec<u8>)>,
    fail_offers: bool,
    fail_answers: bool,
    fail_answer_creation: bool,
}

#[derive(Default)]
pub(crate) struct StubChannels {
    state: Mutex<StubState>,
}

impl StubChannels {
    fn with<R>(&self, f: impl FnOnce(&mut StubState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn fail_offers(&self, fail: bool) {
        self.with(|s| s.fail_offers = fail);
    }

    pub fn fail_answers(&self, fail: bool) {
        self.with(|s| s.fail_answers = fail);
    }

    pub fn fail_answer_creation(&self, fail: bool) {
        self.with(|s| s.fail_answer_creation = fail);
    }

    pub fn offers_created(&self) -> usize {
        self.with(|s| s.offers)
    }

    pub fn answers_created(&self) -> usize {
        self.with(|s| s.answers)
    }

    pub fn answers_applied(&self) -> usize {
        self.with(|s| s.applied)
    }

    pub fn restarts(&self) -> usize {
        self.with(|s| s.restarts)
    }

    pub fn candidates(&self) -> Vec<String> {
        self.with(|s| s.candidates.clone())
    }

    pub fn closed(&self) -> Vec<PeerId> {
        self.with(|s| s.closed.clone())
    }

    pub fn sent(&self) -> Vec<(PeerId, Vec<u8>)> {
        self.with(|s| s.sent.clone())
    }
}

#[async_trait]
impl ChannelProvider for StubChannels {
    async fn create_offer(&self, peer: &PeerId) -> Result<SessionDescription> {
        self.with(|s| {
            if s.fail_offers {
                bail!("offer generation failed");
            }
            s.offers += 1;
            Ok(SessionDescription::offer(format!("v=0\r\ns=offer-to-{}", peer.short())))
        })
    }

    async fn create_answer(&self, peer: &PeerId, _offer: &SessionDescription) -> Result<SessionDescription> {
        self.with(|s| {
            if s.fail_answer_creation {
                bail!("answer generation failed");
            }
            s.answers += 1;
            Ok(SessionDescription::answer(format!("v=0\r\ns=answer-to-{}", peer.short())))
        })
    }

    async fn apply_answer(&self, _peer: &PeerId, _answer: &SessionDescription) -> Result<()> {
        self.with(|s| {
            if s.fail_answers {
                bail!("remote answer rejected");
            }
            s.applied += 1;
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, _peer: &PeerId, candidate: &IceCandidate) -> Result<()> {
        self.with(|s| s.candidates.push(candidate.candidate.clone()));
        Ok(())
    }

    async fn restart_ice(&self, peer: &PeerId) -> Result<SessionDescription> {
        self.with(|s| s.restarts += 1);
        Ok(SessionDescription::offer(format!("v=0\r\ns=restart-to-{}", peer.short())))
    }

    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<()> {
        self.with(|s| s.sent.push((*peer, frame)));
        Ok(())
    }

    async fn close(&self, peer: &PeerId) -> Result<()> {
        self.with(|s| s.closed.push(*peer));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct StubSignaling {
    sent: Mutex<Vec<SignalingEnvelope>>,
}

impl StubSignaling {
    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent().into_iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl SignalingTransport for StubSignaling {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
}
