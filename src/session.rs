//! The negotiation aggregate: descriptions, signaling state and candidates
//! of one call. Pure state; the async driving lives in `negotiation`.

use crate::error::{NegotiationError, Result};
use crate::peer::types::{IceCandidate, SessionDescription, SignalingState};
use crate::utils::random_id;
use std::collections::VecDeque;

/// A description slot that is either empty or holds the current description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DescriptionSlot {
    #[default]
    Absent,
    Present(SessionDescription),
}

impl DescriptionSlot {
    pub fn is_present(&self) -> bool {
        matches!(self, DescriptionSlot::Present(_))
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match self {
            DescriptionSlot::Absent => None,
            DescriptionSlot::Present(desc) => Some(desc),
        }
    }

    pub fn cloned(&self) -> Option<SessionDescription> {
        self.description().cloned()
    }
}

/// Negotiation steps, validated against the signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreateOffer,
    CreateAnswer,
    CreateProvisionalAnswer,
    ApplyRemoteOffer,
    ApplyRemoteAnswer,
    ApplyRemotePrAnswer,
    Rollback,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::CreateOffer => "create_offer",
            Op::CreateAnswer => "create_answer",
            Op::CreateProvisionalAnswer => "create_provisional_answer",
            Op::ApplyRemoteOffer => "apply_remote_offer",
            Op::ApplyRemoteAnswer => "apply_remote_answer",
            Op::ApplyRemotePrAnswer => "apply_remote_pranswer",
            Op::Rollback => "rollback",
        }
    }

    /// Signaling state reached when `self` succeeds from `from`.
    pub fn target(self, from: SignalingState) -> Result<SignalingState> {
        use SignalingState::*;

        if from == Closed {
            return Err(NegotiationError::SessionClosed);
        }
        let to = match (self, from) {
            (Op::CreateOffer, Stable) => HaveLocalOffer,
            (Op::CreateAnswer, HaveRemoteOffer | HaveLocalPrAnswer) => Stable,
            (Op::CreateProvisionalAnswer, HaveRemoteOffer | HaveLocalPrAnswer) => HaveLocalPrAnswer,
            // HaveLocalOffer: glare, the local offer is rolled back
            (Op::ApplyRemoteOffer, Stable | HaveLocalOffer) => HaveRemoteOffer,
            (Op::ApplyRemoteAnswer, HaveLocalOffer | HaveRemotePrAnswer) => Stable,
            (Op::ApplyRemotePrAnswer, HaveLocalOffer | HaveRemotePrAnswer) => HaveRemotePrAnswer,
            (Op::Rollback, HaveLocalOffer | HaveRemoteOffer | HaveLocalPrAnswer | HaveRemotePrAnswer) => {
                Stable
            }
            (op, state) => {
                return Err(NegotiationError::InvalidTransition {
                    op: op.name(),
                    state,
                })
            }
        };
        Ok(to)
    }
}

/// State of a single call. Exactly one exists per peer connection.
#[derive(Debug)]
pub struct NegotiationSession {
    session_id: String,
    local: DescriptionSlot,
    remote: DescriptionSlot,
    signaling_state: SignalingState,
    local_candidates: Vec<IceCandidate>,
    remote_candidate_count: u64,
    pending_remote_candidates: VecDeque<IceCandidate>,
    // descriptions as of the last time the session was stable, restored on rollback
    stable_local: DescriptionSlot,
    stable_remote: DescriptionSlot,
}

impl Default for NegotiationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationSession {
    pub fn new() -> Self {
        Self::with_id(random_id())
    }

    pub fn with_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            local: DescriptionSlot::Absent,
            remote: DescriptionSlot::Absent,
            signaling_state: SignalingState::Stable,
            local_candidates: Vec::new(),
            remote_candidate_count: 0,
            pending_remote_candidates: VecDeque::new(),
            stable_local: DescriptionSlot::Absent,
            stable_remote: DescriptionSlot::Absent,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state == SignalingState::Closed
    }

    pub fn local(&self) -> &DescriptionSlot {
        &self.local
    }

    pub fn remote(&self) -> &DescriptionSlot {
        &self.remote
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_candidate_count(&self) -> u64 {
        self.remote_candidate_count
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(NegotiationError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Validates `op` against the current state without changing anything.
    pub fn check(&self, op: Op) -> Result<SignalingState> {
        op.target(self.signaling_state)
    }

    /// Commits a locally produced description; returns the new state.
    pub fn commit_local(&mut self, op: Op, desc: SessionDescription) -> Result<SignalingState> {
        let to = self.check(op)?;
        self.local = DescriptionSlot::Present(desc);
        self.enter(to);
        Ok(to)
    }

    /// Commits a description received from the peer; returns the new state.
    pub fn commit_remote(&mut self, op: Op, desc: SessionDescription) -> Result<SignalingState> {
        let to = self.check(op)?;
        if op == Op::ApplyRemoteOffer && self.signaling_state == SignalingState::HaveLocalOffer {
            self.local = self.stable_local.clone();
        }
        self.remote = DescriptionSlot::Present(desc);
        self.enter(to);
        Ok(to)
    }

    pub fn commit_rollback(&mut self) -> Result<SignalingState> {
        let to = self.check(Op::Rollback)?;
        self.local = self.stable_local.clone();
        self.remote = self.stable_remote.clone();
        self.enter(to);
        Ok(to)
    }

    fn enter(&mut self, state: SignalingState) {
        self.signaling_state = state;
        if state == SignalingState::Stable {
            self.stable_local = self.local.clone();
            self.stable_remote = self.remote.clone();
        }
    }

    pub fn push_local_candidate(&mut self, candidate: IceCandidate) {
        self.local_candidates.push(candidate);
    }

    /// Queues a remote candidate that arrived before the remote description.
    pub fn queue_remote_candidate(&mut self, candidate: IceCandidate) {
        self.pending_remote_candidates.push_back(candidate);
    }

    /// Takes the queued remote candidates in arrival order.
    pub fn take_pending_remote_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_remote_candidates.drain(..).collect()
    }

    pub fn record_remote_candidate(&mut self) {
        self.remote_candidate_count += 1;
    }

    /// Moves to `Closed`. Returns `false` if the session was already closed.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.signaling_state = SignalingState::Closed;
        self.pending_remote_candidates.clear();
        true
    }
}
