//! Offer/answer state machine for a single peer connection.
//!
//! All transitions are serialized by `op_lock`, a FIFO async mutex held for
//! the whole step including the engine calls. Inputs from the peer
//! (descriptions, candidates) wait their turn so they are applied in arrival
//! order. Producing a local offer or answer is additionally guarded by the
//! `producing` flag: a second local step started while one is in flight
//! fails with `NegotiationInProgress` instead of queuing behind it.
//! `close()` never waits: it flips the session to `Closed` and every step
//! still in flight fails at commit time.

use crate::channels::DataChannelController;
use crate::config::SessionConfig;
use crate::engine::{EngineEvent, EngineEventReceiver, MediaEngine};
use crate::error::{NegotiationError, Result};
use crate::logger::{analyze_candidates, dump_candidate};
use crate::peer::codec::{self, SignalMessage};
use crate::peer::types::{
    CaptureFormat, ConnectionBundle, IceCandidate, MediaConstraints, SdpKind, SdpPayload,
    SessionDescription, SignalingState, TrackKind,
};
use crate::session::{NegotiationSession, Op};
use crate::signaling::{EventDispatcher, Notification, SessionEventSink, SignalingChannel};
use crate::tracks::TrackController;
use crate::utils::lock;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, MutexGuard};
use tracing::{debug, info, instrument, warn};

struct Inner {
    session_id: String,
    config: SessionConfig,
    engine: Arc<dyn MediaEngine>,
    session: Mutex<NegotiationSession>,
    op_lock: tokio::sync::Mutex<()>,
    producing: AtomicBool,
    tracks: TrackController,
    channels: DataChannelController,
    events: EventDispatcher,
    gathering_done: watch::Sender<bool>,
}

/// Handle to a negotiation session. Cloning is cheap; all clones drive the
/// same session.
#[derive(Clone)]
pub struct NegotiationStateMachine {
    inner: Arc<Inner>,
}

impl NegotiationStateMachine {
    /// Builds the session: attaches the configured local tracks, creates the
    /// local data channel and starts consuming engine events.
    #[instrument(skip_all)]
    pub async fn new(
        config: SessionConfig,
        engine: Arc<dyn MediaEngine>,
        engine_events: EngineEventReceiver,
        sink: Arc<dyn SessionEventSink>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<Self> {
        config.validate()?;

        let session = NegotiationSession::new();
        let session_id = session.session_id().to_owned();
        info!("Creating negotiation session {}", session_id);

        let tracks = TrackController::new(
            Arc::clone(&engine),
            config.stream_id.clone(),
            config.sender.clone(),
        )?;
        if config.enable_video {
            tracks.attach(TrackKind::Video).await?;
        }
        if config.enable_audio {
            tracks.attach(TrackKind::Audio).await?;
        }

        let channels =
            DataChannelController::open(Arc::clone(&engine), &config.data_channel_label).await?;

        let (gathering_done, _) = watch::channel(false);
        let machine = Self {
            inner: Arc::new(Inner {
                session_id,
                config,
                engine,
                session: Mutex::new(session),
                op_lock: tokio::sync::Mutex::new(()),
                producing: AtomicBool::new(false),
                tracks,
                channels,
                events: EventDispatcher::spawn(sink, signaling),
                gathering_done,
            }),
        };
        machine.attach_engine_events(engine_events);
        Ok(machine)
    }

    /// Consumes engine push events on a dedicated task until the session is
    /// closed or dropped.
    fn attach_engine_events(&self, mut rx: EngineEventReceiver) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if !inner.handle_engine_event(event) {
                    break;
                }
            }
            debug!("engine event loop finished");
        });
    }

    // ========== SNAPSHOTS ==========

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn signaling_state(&self) -> SignalingState {
        lock(&self.inner.session).signaling_state()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.session).is_closed()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner.session).local().cloned()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner.session).remote().cloned()
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner.session).local_candidates().to_vec()
    }

    pub fn remote_candidate_count(&self) -> u64 {
        lock(&self.inner.session).remote_candidate_count()
    }

    pub fn pending_remote_candidates(&self) -> usize {
        lock(&self.inner.session).pending_remote_candidates()
    }

    /// Short authentication string over both DTLS fingerprints, once both
    /// descriptions are known.
    pub fn fingerprint(&self) -> Option<String> {
        let session = lock(&self.inner.session);
        let local = session.local().description()?;
        let remote = session.remote().description()?;
        codec::session_fingerprint(&local.sdp, &remote.sdp)
    }

    pub fn tracks(&self) -> &TrackController {
        &self.inner.tracks
    }

    pub fn data_channels(&self) -> &DataChannelController {
        &self.inner.channels
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ========== LOCAL STEPS ==========

    /// Produces an offer with the configured constraints.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let constraints = self.inner.config.constraints.clone();
        self.create_offer_with(constraints).await
    }

    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn create_offer_with(&self, constraints: MediaConstraints) -> Result<SessionDescription> {
        let _step = self.begin_local_step(Op::CreateOffer).await?;
        self.produce_local(Op::CreateOffer, &constraints).await
    }

    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let _step = self.begin_local_step(Op::CreateAnswer).await?;
        let constraints = self.inner.config.constraints.clone();
        self.produce_local(Op::CreateAnswer, &constraints).await
    }

    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn create_provisional_answer(&self) -> Result<SessionDescription> {
        let _step = self.begin_local_step(Op::CreateProvisionalAnswer).await?;
        let constraints = self.inner.config.constraints.clone();
        self.produce_local(Op::CreateProvisionalAnswer, &constraints).await
    }

    /// Abandons the offer/answer exchange in progress and returns to the
    /// last stable descriptions.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn rollback(&self) -> Result<()> {
        let _step = self.inner.op_lock.lock().await;
        let from = {
            let session = lock(&self.inner.session);
            session.check(Op::Rollback)?;
            session.signaling_state()
        };

        let rollback = SessionDescription::rollback();
        let applied = match from {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer => {
                self.inner.engine.set_local_description(&rollback).await
            }
            _ => self.inner.engine.set_remote_description(&rollback).await,
        };
        applied.map_err(|e| self.inner.closed_or(e))?;

        let mut session = lock(&self.inner.session);
        let state = session.commit_rollback()?;
        info!("Rolled back from {} to {}", from, state);
        self.inner.notify(Notification::SignalingState(state));
        Ok(())
    }

    /// Fails fast when another local offer/answer is being produced, then
    /// waits for the remote inputs already queued.
    async fn begin_local_step(&self, op: Op) -> Result<LocalStep<'_>> {
        lock(&self.inner.session).ensure_open()?;
        let producing = self
            .inner
            .claim_production()
            .ok_or(NegotiationError::NegotiationInProgress)?;
        let guard = self.inner.op_lock.lock().await;
        lock(&self.inner.session).check(op)?;
        Ok(LocalStep {
            _producing: producing,
            _guard: guard,
        })
    }

    /// Runs a local offer/answer step. The caller holds `op_lock`.
    async fn produce_local(&self, op: Op, constraints: &MediaConstraints) -> Result<SessionDescription> {
        let inner = &self.inner;

        inner
            .tracks
            .prepare_for_negotiation()
            .await
            .map_err(|e| inner.closed_or(e))?;

        let produced = match op {
            Op::CreateOffer => inner.engine.create_offer(constraints).await,
            _ => inner.engine.create_answer(constraints).await,
        };
        let mut desc = produced.map_err(|e| inner.closed_or(e))?;
        if op == Op::CreateProvisionalAnswer {
            desc.kind = SdpKind::PrAnswer;
        }

        lock(&inner.session).ensure_open()?;
        // gathering restarts with a new local description; the engine
        // reports completion again once it is done
        let was_gathered = inner.gathering_done.send_replace(false);
        if let Err(e) = inner.engine.set_local_description(&desc).await {
            inner.gathering_done.send_replace(was_gathered);
            return Err(inner.closed_or(e));
        }

        let mut session = lock(&inner.session);
        let state = session.commit_local(op, desc.clone())?;
        info!("Local {} set, signaling state {}", desc.kind, state);

        inner.notify(Notification::SignalingState(state));
        inner.notify(Notification::LocalDescription(desc.clone()));
        Ok(desc)
    }

    // ========== REMOTE INPUT ==========

    /// Applies the peer's offer and, with `auto_answer`, answers it right
    /// away. A local offer still pending is rolled back first (glare: the
    /// remote offer wins). Returns the answer when one was produced.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn apply_remote_offer(&self, desc: SessionDescription) -> Result<Option<SessionDescription>> {
        if desc.kind != SdpKind::Offer {
            return Err(NegotiationError::Codec(format!("expected an offer, got {}", desc.kind)));
        }
        let inner = &self.inner;
        let _step = inner.op_lock.lock().await;

        let glare = {
            let session = lock(&inner.session);
            session.check(Op::ApplyRemoteOffer)?;
            session.signaling_state() == SignalingState::HaveLocalOffer
        };

        if glare {
            warn!("Glare: remote offer while local offer pending, rolling back local offer");
            inner
                .engine
                .set_local_description(&SessionDescription::rollback())
                .await
                .map_err(|e| inner.closed_or(e))?;
        }

        if let Err(e) = inner.engine.set_remote_description(&desc).await {
            if glare {
                // the engine already dropped the local offer
                let mut session = lock(&inner.session);
                if let Ok(state) = session.commit_rollback() {
                    inner.notify(Notification::SignalingState(state));
                }
            }
            return Err(inner.closed_or(e));
        }

        {
            let mut session = lock(&inner.session);
            let state = session.commit_remote(Op::ApplyRemoteOffer, desc)?;
            info!("Remote offer set, signaling state {}", state);
            inner.notify(Notification::SignalingState(state));
        }

        self.flush_pending_candidates().await?;

        if !inner.config.auto_answer {
            return Ok(None);
        }
        // a local step arriving now is turned away; one already queued on
        // op_lock keeps its claim and finds the answered session
        let _producing = inner.claim_production();
        let constraints = inner.config.constraints.clone();
        let answer = self.produce_local(Op::CreateAnswer, &constraints).await?;
        Ok(Some(answer))
    }

    /// Applies the peer's answer (`Stable`) or provisional answer
    /// (`HaveRemotePrAnswer`).
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn apply_remote_answer(&self, desc: SessionDescription) -> Result<()> {
        let op = match desc.kind {
            SdpKind::Answer => Op::ApplyRemoteAnswer,
            SdpKind::PrAnswer => Op::ApplyRemotePrAnswer,
            other => {
                return Err(NegotiationError::Codec(format!(
                    "expected an answer, got {}",
                    other
                )))
            }
        };
        let inner = &self.inner;
        let _step = inner.op_lock.lock().await;

        lock(&inner.session).check(op)?;
        inner
            .engine
            .set_remote_description(&desc)
            .await
            .map_err(|e| inner.closed_or(e))?;

        {
            let mut session = lock(&inner.session);
            let state = session.commit_remote(op, desc)?;
            info!("Remote answer set, signaling state {}", state);
            inner.notify(Notification::SignalingState(state));
        }

        self.flush_pending_candidates().await
    }

    /// Forwards a remote candidate to the engine, or queues it until a
    /// remote description exists. Queued candidates are replayed in arrival
    /// order right after the remote description is set.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let inner = &self.inner;
        let _step = inner.op_lock.lock().await;

        {
            let mut session = lock(&inner.session);
            session.ensure_open()?;
            if !session.remote().is_present() {
                debug!("Remote description not set yet, queuing candidate");
                session.queue_remote_candidate(candidate);
                return Ok(());
            }
        }

        dump_candidate("REMOTE", &candidate);
        inner
            .engine
            .add_ice_candidate(&candidate)
            .await
            .map_err(|e| inner.closed_or(e))?;
        lock(&inner.session).record_remote_candidate();
        Ok(())
    }

    /// Replays queued candidates. The caller holds `op_lock`. A rejected
    /// candidate does not stop the rest; it is reported to the sink.
    async fn flush_pending_candidates(&self) -> Result<()> {
        let inner = &self.inner;
        let pending = lock(&inner.session).take_pending_remote_candidates();
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Applying {} pending remote candidates", pending.len());

        for candidate in pending {
            lock(&inner.session).ensure_open()?;
            match inner.engine.add_ice_candidate(&candidate).await {
                Ok(()) => lock(&inner.session).record_remote_candidate(),
                Err(e) => {
                    let e = inner.closed_or(e);
                    if e.is_permanent() {
                        return Err(e);
                    }
                    warn!("Failed to apply pending candidate: {}", e);
                    let session = lock(&inner.session);
                    session.ensure_open()?;
                    inner.notify(Notification::CandidateRejected(candidate, e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Dispatches a message received from the signaling channel.
    pub async fn handle_signal(&self, msg: SignalMessage) -> Result<Option<SessionDescription>> {
        match msg {
            SignalMessage::Description(desc) => match desc.kind {
                SdpKind::Offer => self.apply_remote_offer(desc).await,
                SdpKind::Answer | SdpKind::PrAnswer => {
                    self.apply_remote_answer(desc).await.map(|_| None)
                }
                SdpKind::Rollback => self.rollback().await.map(|_| None),
            },
            SignalMessage::Candidate(candidate) => {
                self.add_remote_candidate(candidate).await.map(|_| None)
            }
        }
    }

    pub async fn handle_signal_json(&self, json: &str) -> Result<Option<SessionDescription>> {
        let msg = codec::decode_signal(json)?;
        self.handle_signal(msg).await
    }

    // ========== NON-TRICKLE BUNDLES ==========

    /// Waits until local candidate gathering completes or `timeout` elapses,
    /// then returns the local candidates gathered so far.
    pub async fn wait_for_candidates(&self, timeout: Duration) -> Vec<IceCandidate> {
        let mut done = self.inner.gathering_done.subscribe();
        if tokio::time::timeout(timeout, done.wait_for(|d| *d)).await.is_err() {
            debug!("Candidate collection timeout after {:?}", timeout);
        }
        self.local_candidates()
    }

    /// Encodes the current local description with every local candidate so
    /// far as a compact token.
    pub fn local_bundle(&self) -> Result<String> {
        let (desc, candidates) = {
            let session = lock(&self.inner.session);
            session.ensure_open()?;
            let desc = session
                .local()
                .cloned()
                .ok_or(NegotiationError::InvalidTransition {
                    op: "local_bundle",
                    state: session.signaling_state(),
                })?;
            (desc, session.local_candidates().to_vec())
        };
        analyze_candidates(&candidates);

        let bundle = ConnectionBundle {
            sdp_payload: SdpPayload {
                sdp: desc,
                id: self.inner.session_id.clone(),
                ts: chrono::Utc::now().timestamp(),
            },
            ice_candidates: candidates,
        };
        codec::encode_bundle(&bundle)
    }

    /// Applies a bundle produced by the peer's `local_bundle`: its
    /// description first, then its candidates in order.
    pub async fn apply_remote_bundle(&self, token: &str) -> Result<Option<SessionDescription>> {
        let bundle = codec::decode_bundle(token)?;
        info!(
            "Applying bundle {} with {} candidates",
            bundle.sdp_payload.id,
            bundle.ice_candidates.len()
        );
        let answer = self
            .handle_signal(SignalMessage::Description(bundle.sdp_payload.sdp))
            .await?;
        for candidate in bundle.ice_candidates {
            self.add_remote_candidate(candidate).await?;
        }
        Ok(answer)
    }

    // ========== DATA ==========

    pub async fn send_data(&self, data: Bytes) -> Result<()> {
        lock(&self.inner.session).ensure_open()?;
        self.inner.channels.send(data).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_data(Bytes::copy_from_slice(text.as_bytes())).await
    }

    // ========== MEDIA ==========

    /// Starts capture with the configured target format.
    pub async fn start_capture(&self) -> Result<CaptureFormat> {
        lock(&self.inner.session).ensure_open()?;
        self.inner.tracks.start_capture(&self.inner.config.capture).await
    }

    // ========== TEARDOWN ==========

    /// Closes the session. Idempotent; only the first call notifies and
    /// closes the engine. Steps still in flight fail with `SessionClosed`
    /// and late engine events are ignored.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn close(&self) -> Result<()> {
        {
            let mut session = lock(&self.inner.session);
            if !session.close() {
                return Ok(());
            }
            info!("Session closed");
            self.inner
                .notify(Notification::SignalingState(SignalingState::Closed));
        }
        self.inner.engine.close().await
    }
}

/// Held by a local step: the production claim plus its turn on `op_lock`.
struct LocalStep<'a> {
    _producing: Production<'a>,
    _guard: MutexGuard<'a, ()>,
}

/// Marks a local offer/answer as in flight until dropped.
struct Production<'a>(&'a AtomicBool);

impl Drop for Production<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Inner {
    /// Delivery goes through an unbounded queue and never blocks, so it is
    /// called with the session lock held: whatever is notified under that
    /// lock is ordered against `Closed`.
    fn notify(&self, n: Notification) {
        self.events.notify(n);
    }

    fn claim_production(&self) -> Option<Production<'_>> {
        self.producing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Production(&self.producing))
    }

    /// Engine errors seen after `close()` are reported as `SessionClosed`.
    fn closed_or(&self, e: NegotiationError) -> NegotiationError {
        if lock(&self.session).is_closed() {
            NegotiationError::SessionClosed
        } else {
            e
        }
    }

    /// Returns `false` once the session is closed, ending the event loop.
    fn handle_engine_event(&self, event: EngineEvent) -> bool {
        let mut session = lock(&self.session);
        if session.is_closed() {
            debug!("Session closed, dropping engine event {:?}", event);
            return false;
        }

        match event {
            EngineEvent::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", &candidate);
                session.push_local_candidate(candidate.clone());
                debug!(
                    "Added local ICE candidate, total count: {}",
                    session.local_candidates().len()
                );
                self.notify(Notification::LocalCandidate(candidate));
            }
            EngineEvent::GatheringComplete => {
                info!("ICE candidate gathering completed");
                analyze_candidates(session.local_candidates());
                self.gathering_done.send_replace(true);
            }
            EngineEvent::ConnectionStateChanged(state) => {
                info!("ICE connection state changed to {:?}", state);
                self.notify(Notification::ConnectionState(state));
            }
            EngineEvent::DataChannelStateChanged {
                origin,
                label,
                state,
            } => {
                self.channels.on_state_changed(origin, &label, state);
            }
            EngineEvent::DataReceived { origin, data } => {
                debug!("Received {} bytes on {:?} channel", data.len(), origin);
                self.notify(Notification::Data(data));
            }
        }
        true
    }
}
