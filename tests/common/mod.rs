//! Shared helpers for the integration tests: a scripted in-memory media
//! engine and a session wired to an event channel.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rtc_session::engine::{engine_event_channel, EngineEvent, EngineEventSender, MediaEngine};
use rtc_session::{
    CaptureFormat, EventChannel, IceCandidate, MediaConstraints, MediaSenderConfig,
    NegotiationError, NegotiationStateMachine, Result, SessionConfig, SessionDescription,
    SessionEvent, TrackKind,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Every call the session made on the engine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    AddTrack(TrackKind, String, String),
    SenderParams(TrackKind, MediaSenderConfig),
    TrackEnabled(TrackKind, bool),
    StartCapture(CaptureFormat, u32),
    CreateDataChannel(String),
    SendData(Bytes),
    Close,
}

/// Parks an engine method until the test releases it.
#[derive(Clone, Default)]
pub struct Hold {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Hold {
    /// Resolves once the held method has been called.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("held engine method was never called");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

pub struct FakeEngine {
    name: &'static str,
    calls: Mutex<Vec<Call>>,
    fail_once: Mutex<HashSet<&'static str>>,
    holds: Mutex<HashMap<&'static str, Hold>>,
    capture_formats: Mutex<Vec<CaptureFormat>>,
    events: EngineEventSender,
    seq: AtomicU32,
}

impl FakeEngine {
    pub fn new(name: &'static str) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = engine_event_channel();
        let engine = Arc::new(Self {
            name,
            calls: Mutex::new(Vec::new()),
            fail_once: Mutex::new(HashSet::new()),
            holds: Mutex::new(HashMap::new()),
            capture_formats: Mutex::new(vec![
                capture_format(1280, 720, "420f"),
                capture_format(1920, 1080, "420v"),
                capture_format(1920, 1080, "420f"),
            ]),
            events: tx,
            seq: AtomicU32::new(0),
        });
        (engine, rx)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than sender parameter updates, which happen before every
    /// offer/answer.
    pub fn negotiation_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::CreateOffer
                        | Call::CreateAnswer
                        | Call::SetLocal(_)
                        | Call::SetRemote(_)
                        | Call::AddCandidate(_)
                )
            })
            .collect()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c.candidate),
                _ => None,
            })
            .collect()
    }

    pub fn sent_data(&self) -> Vec<Bytes> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SendData(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// The next call of `method` fails with an engine error.
    pub fn fail_once(&self, method: &'static str) {
        self.fail_once.lock().unwrap().insert(method);
    }

    /// The next call of `method` waits until the returned hold is released.
    pub fn hold(&self, method: &'static str) -> Hold {
        let hold = Hold::default();
        self.holds.lock().unwrap().insert(method, hold.clone());
        hold
    }

    pub fn set_capture_formats(&self, formats: Vec<CaptureFormat>) {
        *self.capture_formats.lock().unwrap() = formats;
    }

    /// Pushes an engine event; ignored once the session stopped listening.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn sdp(&self, kind: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        format!(
            "v=0\r\no={}-{}-{} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=fingerprint:sha-256 {}\r\n",
            self.name,
            kind,
            n,
            hex_name(self.name)
        )
    }

    async fn enter(&self, method: &'static str, call: Option<Call>) -> Result<()> {
        if let Some(call) = call {
            self.calls.lock().unwrap().push(call);
        }
        let hold = self.holds.lock().unwrap().remove(method);
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        if self.fail_once.lock().unwrap().remove(method) {
            return Err(NegotiationError::EngineFailure(format!("{} failed", method)));
        }
        Ok(())
    }
}

fn hex_name(name: &str) -> String {
    name.bytes()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_offer(&self, _constraints: &MediaConstraints) -> Result<SessionDescription> {
        self.enter("create_offer", Some(Call::CreateOffer)).await?;
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self, _constraints: &MediaConstraints) -> Result<SessionDescription> {
        self.enter("create_answer", Some(Call::CreateAnswer)).await?;
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.enter("set_local_description", Some(Call::SetLocal(desc.clone())))
            .await
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.enter("set_remote_description", Some(Call::SetRemote(desc.clone())))
            .await
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.enter("add_ice_candidate", Some(Call::AddCandidate(candidate.clone())))
            .await
    }

    async fn add_track(&self, kind: TrackKind, track_id: &str, stream_id: &str) -> Result<()> {
        self.enter(
            "add_track",
            Some(Call::AddTrack(kind, track_id.into(), stream_id.into())),
        )
        .await
    }

    async fn set_sender_parameters(&self, kind: TrackKind, config: &MediaSenderConfig) -> Result<()> {
        self.enter("set_sender_parameters", Some(Call::SenderParams(kind, config.clone())))
            .await
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        self.calls.lock().unwrap().push(Call::TrackEnabled(kind, enabled));
        Ok(())
    }

    fn capture_formats(&self) -> Vec<CaptureFormat> {
        self.capture_formats.lock().unwrap().clone()
    }

    async fn start_capture(&self, format: &CaptureFormat, fps: u32) -> Result<()> {
        self.enter("start_capture", Some(Call::StartCapture(format.clone(), fps)))
            .await
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.enter("create_data_channel", Some(Call::CreateDataChannel(label.into())))
            .await
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        self.enter("send_data", Some(Call::SendData(data))).await
    }

    async fn close(&self) -> Result<()> {
        self.enter("close", Some(Call::Close)).await
    }
}

pub fn capture_format(width: u32, height: u32, pixel_format: &str) -> CaptureFormat {
    CaptureFormat {
        width,
        height,
        pixel_format: pixel_format.into(),
        min_fps: 1.0,
        max_fps: 60.0,
    }
}

pub struct TestSession {
    pub machine: NegotiationStateMachine,
    pub engine: Arc<FakeEngine>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl TestSession {
    pub async fn new(config: SessionConfig) -> Self {
        Self::named("fake", config).await
    }

    pub async fn named(name: &'static str, config: SessionConfig) -> Self {
        let (engine, engine_events) = FakeEngine::new(name);
        let (sink, events) = EventChannel::new();
        let machine = NegotiationStateMachine::new(
            config,
            engine.clone(),
            engine_events,
            sink.clone(),
            sink,
        )
        .await
        .expect("session setup");
        Self {
            machine,
            engine,
            events,
        }
    }

    /// Next event, failing the test if none arrives in time.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    /// Everything delivered so far, after letting pending tasks run.
    pub async fn drain_events(&mut self) -> Vec<SessionEvent> {
        settle().await;
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Lets spawned tasks process whatever is queued.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Polls `cond` until it holds or a deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn manual_answer_config() -> SessionConfig {
    SessionConfig {
        auto_answer: false,
        ..SessionConfig::default()
    }
}

pub fn host_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        "0",
        0,
        format!("candidate:{n} 1 udp 2130706431 192.168.1.{n} 5000{n} typ host"),
    )
}

pub fn remote_offer() -> SessionDescription {
    SessionDescription::offer(
        "v=0\r\no=remote 1 1 IN IP4 10.0.0.9\r\ns=-\r\nt=0 0\r\na=fingerprint:sha-256 AA:BB\r\n",
    )
}

pub fn remote_answer() -> SessionDescription {
    SessionDescription::answer(
        "v=0\r\no=remote 2 1 IN IP4 10.0.0.9\r\ns=-\r\nt=0 0\r\na=fingerprint:sha-256 AA:BB\r\n",
    )
}
