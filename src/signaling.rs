//! Outbound boundaries of a session: the signaling channel that carries
//! descriptions and candidates to the peer, and the event sink observing
//! the session. Both are driven from a dispatcher task so the negotiation
//! actor never waits on them.

use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription, SignalingState};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Carries local descriptions and candidates to the remote peer.
/// Implementations must not block; delivery is fire-and-forget.
pub trait SignalingChannel: Send + Sync {
    fn send_local_description(&self, desc: SessionDescription);
    fn send_local_candidate(&self, candidate: IceCandidate);
}

/// Observer of session events, invoked after the corresponding state change
/// has been committed.
pub trait SessionEventSink: Send + Sync {
    fn on_signaling_state_changed(&self, _state: SignalingState) {}
    fn on_local_candidate(&self, _candidate: &IceCandidate) {}
    fn on_connection_state_changed(&self, _state: ConnectionState) {}
    fn on_data_received(&self, _data: &[u8]) {}
    /// A queued remote candidate the engine refused when it was replayed.
    fn on_candidate_rejected(&self, _candidate: &IceCandidate, _reason: &str) {}
}

/// Sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl SessionEventSink for NoopSink {}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notification {
    SignalingState(SignalingState),
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    Data(Bytes),
    CandidateRejected(IceCandidate, String),
}

/// Ordered, non-blocking delivery of notifications to the sink and the
/// signaling channel.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl EventDispatcher {
    /// Spawns the delivery task on the current tokio runtime.
    pub(crate) fn spawn(
        sink: Arc<dyn SessionEventSink>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                trace!("dispatching {:?}", n);
                match n {
                    Notification::SignalingState(state) => sink.on_signaling_state_changed(state),
                    Notification::LocalDescription(desc) => signaling.send_local_description(desc),
                    Notification::LocalCandidate(candidate) => {
                        sink.on_local_candidate(&candidate);
                        signaling.send_local_candidate(candidate);
                    }
                    Notification::ConnectionState(state) => sink.on_connection_state_changed(state),
                    Notification::Data(data) => sink.on_data_received(&data),
                    Notification::CandidateRejected(candidate, reason) => {
                        sink.on_candidate_rejected(&candidate, &reason)
                    }
                }
            }
            debug!("event dispatcher stopped");
        });
        Self { tx }
    }

    pub(crate) fn notify(&self, n: Notification) {
        if self.tx.send(n).is_err() {
            debug!("event dispatcher gone, notification dropped");
        }
    }
}

/// Everything a session reports, as a single stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignalingStateChanged(SignalingState),
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    DataReceived(Bytes),
    CandidateRejected { candidate: IceCandidate, reason: String },
}

/// Adapter implementing both [`SignalingChannel`] and [`SessionEventSink`]
/// by forwarding into an unbounded channel.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn push(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl SignalingChannel for EventChannel {
    fn send_local_description(&self, desc: SessionDescription) {
        self.push(SessionEvent::LocalDescription(desc));
    }

    // the candidate is reported once, through `on_local_candidate`
    fn send_local_candidate(&self, _candidate: IceCandidate) {}
}

impl SessionEventSink for EventChannel {
    fn on_signaling_state_changed(&self, state: SignalingState) {
        self.push(SessionEvent::SignalingStateChanged(state));
    }

    fn on_local_candidate(&self, candidate: &IceCandidate) {
        self.push(SessionEvent::LocalCandidate(candidate.clone()));
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        self.push(SessionEvent::ConnectionStateChanged(state));
    }

    fn on_data_received(&self, data: &[u8]) {
        self.push(SessionEvent::DataReceived(Bytes::copy_from_slice(data)));
    }

    fn on_candidate_rejected(&self, candidate: &IceCandidate, reason: &str) {
        self.push(SessionEvent::CandidateRejected {
            candidate: candidate.clone(),
            reason: reason.to_owned(),
        });
    }
}
