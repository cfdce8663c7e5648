use crate::config::{default_ice_servers, SessionConfig};
use crate::engine::{engine_event_channel, EngineEvent, EngineEventReceiver, EngineEventSender, MediaEngine};
use crate::error::{NegotiationError, Result};
use crate::peer::data_channel::{attach_dc, channel_state};
use crate::peer::ice::{connection_state, engine_error, from_rtc_candidate, ice_servers, to_candidate_init};
use crate::peer::state::PeerFactory;
use crate::peer::types::{
    CaptureFormat, ChannelOrigin, ChannelState, IceCandidate, MediaConstraints, MediaSenderConfig, SdpKind,
    ServerConfig, SessionDescription, TrackKind,
};
use crate::utils::lock;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Settings of the concrete engine that are not part of negotiation.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub ice_servers: Vec<ServerConfig>,
    /// Formats advertised by the capture device feeding the video track
    pub capture_formats: Vec<CaptureFormat>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            capture_formats: default_capture_formats(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            ..Self::default()
        }
    }
}

fn default_capture_formats() -> Vec<CaptureFormat> {
    [(1280, 720), (1920, 1080)]
        .into_iter()
        .map(|(width, height)| CaptureFormat {
            width,
            height,
            pixel_format: "420f".into(),
            min_fps: 1.0,
            max_fps: 60.0,
        })
        .collect()
}

struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    sender_config: Mutex<Option<MediaSenderConfig>>,
}

/// Engine events on behalf of one peer connection. Once that connection is
/// replaced its callbacks go quiet.
#[derive(Clone)]
pub(crate) struct PeerEvents {
    tx: EngineEventSender,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl PeerEvents {
    pub(crate) fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    pub(crate) fn send(&self, event: EngineEvent) {
        if self.is_current() {
            let _ = self.tx.send(event);
        }
    }
}

/// [`MediaEngine`] backed by a `webrtc` peer connection.
pub struct WebRtcEngine {
    api: Arc<API>,
    ice_servers: Vec<ServerConfig>,
    pc: Mutex<Arc<RTCPeerConnection>>,
    events: EngineEventSender,
    generation: Arc<AtomicU64>,
    tracks: Mutex<HashMap<TrackKind, Arc<LocalTrack>>>,
    remote_dc: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    local_dc: Mutex<Option<Arc<RTCDataChannel>>>,
    capture_formats: Vec<CaptureFormat>,
    capture: Mutex<Option<(CaptureFormat, u32)>>,
}

impl WebRtcEngine {
    /// Creates the peer connection and wires its callbacks into `events`.
    #[instrument(skip_all)]
    pub async fn new(options: EngineOptions, events: EngineEventSender) -> Result<Self> {
        let api = PeerFactory::shared()?;
        let generation = Arc::new(AtomicU64::new(0));
        let remote_dc: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        let peer_events = PeerEvents {
            tx: events.clone(),
            current: Arc::clone(&generation),
            generation: 0,
        };
        let pc = open_peer(&api, &options.ice_servers, peer_events, Arc::clone(&remote_dc)).await?;

        Ok(Self {
            api,
            ice_servers: options.ice_servers,
            pc: Mutex::new(pc),
            events,
            generation,
            tracks: Mutex::new(HashMap::new()),
            remote_dc,
            local_dc: Mutex::new(None),
            capture_formats: options.capture_formats,
            capture: Mutex::new(None),
        })
    }

    /// Builds an engine for `config` together with its event stream.
    pub async fn from_config(config: &SessionConfig) -> Result<(Arc<Self>, EngineEventReceiver)> {
        let (tx, rx) = engine_event_channel();
        let engine = Self::new(EngineOptions::from_config(config), tx).await?;
        Ok((Arc::new(engine), rx))
    }

    /// The live peer connection. A rollback replaces it.
    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&lock(&self.pc))
    }

    fn peer_events(&self) -> PeerEvents {
        PeerEvents {
            tx: self.events.clone(),
            current: Arc::clone(&self.generation),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    pub fn local_channel(&self) -> Option<Arc<RTCDataChannel>> {
        lock(&self.local_dc).clone()
    }

    /// Feeds one encoded frame to the local track of `kind`. Frames written
    /// while the track is disabled are dropped.
    pub async fn write_sample(&self, kind: TrackKind, sample: &Sample) -> Result<()> {
        let track = lock(&self.tracks).get(&kind).cloned();
        let Some(track) = track else {
            return Err(NegotiationError::EngineFailure(format!("no {} track attached", kind)));
        };
        if !track.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        track
            .track
            .write_sample(sample)
            .await
            .map_err(|e| engine_error("write sample", e))
    }

    /// Sender parameters last applied to the track of `kind`.
    pub fn sender_parameters(&self, kind: TrackKind) -> Option<MediaSenderConfig> {
        let track = lock(&self.tracks).get(&kind).cloned()?;
        let config = lock(&track.sender_config).clone();
        config
    }

    /// Capture format and frame rate chosen by the last `start_capture`.
    pub fn active_capture(&self) -> Option<(CaptureFormat, u32)> {
        lock(&self.capture).clone()
    }

    /// Adds recv-only transceivers for the kinds the constraints want to
    /// receive but nothing sends or receives yet.
    async fn ensure_receive_transceivers(&self, constraints: &MediaConstraints) -> Result<()> {
        let pc = self.peer_connection();
        let transceivers = pc.get_transceivers().await;
        let wanted = [
            (RTPCodecType::Audio, constraints.receive_audio),
            (RTPCodecType::Video, constraints.receive_video),
        ];
        for (kind, receive) in wanted {
            if !receive || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| engine_error("add transceiver", e))?;
            debug!("Added recv-only {:?} transceiver", kind);
        }
        Ok(())
    }

    /// Abandons an offer/answer exchange by replacing the peer connection:
    /// webrtc-rs has no rollback transition. Only an exchange that never
    /// completed can be abandoned this way; tracks and the local data
    /// channel move to the new connection and the old one goes quiet.
    #[instrument(skip_all)]
    async fn restart_peer(&self) -> Result<()> {
        let old = self.peer_connection();
        if old.current_remote_description().await.is_some() {
            return Err(NegotiationError::EngineFailure(
                "rollback of a renegotiation is not supported".into(),
            ));
        }

        let previous = self.generation.fetch_add(1, Ordering::AcqRel);
        *lock(&self.remote_dc) = None;
        let events = self.peer_events();
        let opened = open_peer(
            &self.api,
            &self.ice_servers,
            events.clone(),
            Arc::clone(&self.remote_dc),
        )
        .await;
        let pc = match opened {
            Ok(pc) => pc,
            Err(e) => {
                self.generation.store(previous, Ordering::Release);
                return Err(e);
            }
        };
        let local_dc = match self.carry_over(&pc, events).await {
            Ok(dc) => dc,
            Err(e) => {
                self.generation.store(previous, Ordering::Release);
                let _ = pc.close().await;
                return Err(e);
            }
        };

        *lock(&self.local_dc) = local_dc;
        *lock(&self.pc) = pc;
        if let Err(e) = old.close().await {
            warn!("Failed to close replaced peer connection: {}", e);
        }
        info!("Peer connection replaced (generation {})", previous + 1);
        Ok(())
    }

    /// Binds the existing tracks and reopens the local data channel on `pc`.
    async fn carry_over(
        &self,
        pc: &RTCPeerConnection,
        events: PeerEvents,
    ) -> Result<Option<Arc<RTCDataChannel>>> {
        let tracks: Vec<_> = lock(&self.tracks)
            .values()
            .map(|local| Arc::clone(&local.track))
            .collect();
        for track in &tracks {
            bind_track(pc, track).await?;
        }

        let label = lock(&self.local_dc).as_ref().map(|dc| dc.label().to_owned());
        match label {
            Some(label) => open_channel(pc, &label, events).await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<SessionDescription> {
        self.ensure_receive_transceivers(constraints).await?;
        let offer = self
            .peer_connection()
            .create_offer(None)
            .await
            .map_err(|e| engine_error("create offer", e))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self, _constraints: &MediaConstraints) -> Result<SessionDescription> {
        let answer = self
            .peer_connection()
            .create_answer(None)
            .await
            .map_err(|e| engine_error("create answer", e))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        if desc.kind == SdpKind::Rollback {
            return self.restart_peer().await;
        }
        let pc = self.peer_connection();
        pc.set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| engine_error("set local description", e))?;
        if pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            // nothing new will be gathered for this description
            self.peer_events().send(EngineEvent::GatheringComplete);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        if desc.kind == SdpKind::Rollback {
            return self.restart_peer().await;
        }
        self.peer_connection()
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| engine_error("set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.peer_connection()
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| engine_error("add ICE candidate", e))
    }

    async fn add_track(&self, kind: TrackKind, track_id: &str, stream_id: &str) -> Result<()> {
        let capability = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.to_owned(),
            stream_id.to_owned(),
        ));
        bind_track(&self.peer_connection(), &track).await?;

        lock(&self.tracks).insert(
            kind,
            Arc::new(LocalTrack {
                track,
                enabled: AtomicBool::new(true),
                sender_config: Mutex::new(None),
            }),
        );
        Ok(())
    }

    async fn set_sender_parameters(&self, kind: TrackKind, config: &MediaSenderConfig) -> Result<()> {
        let track = lock(&self.tracks).get(&kind).cloned();
        match track {
            Some(track) => {
                *lock(&track.sender_config) = Some(config.clone());
                Ok(())
            }
            None => Err(NegotiationError::EngineFailure(format!(
                "no {} sender to configure",
                kind
            ))),
        }
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        if let Some(track) = lock(&self.tracks).get(&kind) {
            track.enabled.store(enabled, Ordering::Release);
        }
        Ok(())
    }

    fn capture_formats(&self) -> Vec<CaptureFormat> {
        self.capture_formats.clone()
    }

    async fn start_capture(&self, format: &CaptureFormat, fps: u32) -> Result<()> {
        let rate = f64::from(fps);
        if rate < format.min_fps || rate > format.max_fps {
            return Err(NegotiationError::InvalidConfig(format!(
                "{} fps outside {}..{} supported by {}x{} {}",
                fps, format.min_fps, format.max_fps, format.width, format.height, format.pixel_format
            )));
        }
        *lock(&self.capture) = Some((format.clone(), fps));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let dc = open_channel(&self.peer_connection(), label, self.peer_events()).await?;
        *lock(&self.local_dc) = Some(dc);
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        let dc = lock(&self.remote_dc).clone();
        let Some(dc) = dc else {
            return Err(NegotiationError::ChannelNotReady {
                label: String::new(),
                state: ChannelState::Closed,
            });
        };
        let state = channel_state(dc.ready_state());
        if state != ChannelState::Open {
            return Err(NegotiationError::ChannelNotReady {
                label: dc.label().to_owned(),
                state,
            });
        }
        dc.send(&data)
            .await
            .map_err(|e| engine_error("send data", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection()
            .close()
            .await
            .map_err(|e| engine_error("close peer connection", e))
    }
}

/// Creates a peer connection whose callbacks report through `events`.
async fn open_peer(
    api: &API,
    servers: &[ServerConfig],
    events: PeerEvents,
    remote_dc: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
) -> Result<Arc<RTCPeerConnection>> {
    let pc = Arc::new(
        api.new_peer_connection(rtc_config(servers))
            .await
            .map_err(|e| engine_error("create peer connection", e))?,
    );
    info!("Peer connection created with {} ICE servers", servers.len());

    pc.on_ice_candidate(Box::new({
        let events = events.clone();
        move |cand: Option<RTCIceCandidate>| {
            let event = match cand {
                Some(c) => match from_rtc_candidate(&c) {
                    Ok(candidate) => EngineEvent::LocalCandidate(candidate),
                    Err(e) => {
                        warn!("Failed to serialize local candidate: {}", e);
                        return Box::pin(async {});
                    }
                },
                // cand == None means gathering is done
                None => EngineEvent::GatheringComplete,
            };
            events.send(event);
            Box::pin(async {})
        }
    }));

    pc.on_ice_connection_state_change(Box::new({
        let events = events.clone();
        move |st: RTCIceConnectionState| {
            debug!("ICE connection state: {:?}", st);
            if let Some(state) = connection_state(st) {
                events.send(EngineEvent::ConnectionStateChanged(state));
            }
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        if events.is_current() {
            info!("Remote data channel {:?} received", dc.label());
            attach_dc(&dc, ChannelOrigin::Remote, events.clone());
            *lock(&remote_dc) = Some(dc);
        }
        Box::pin(async {})
    }));

    Ok(pc)
}

async fn bind_track(pc: &RTCPeerConnection, track: &Arc<TrackLocalStaticSample>) -> Result<()> {
    let sender = pc
        .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| engine_error("add track", e))?;

    // RTCP has to be drained or the interceptors stall
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut buf).await {}
    });
    Ok(())
}

async fn open_channel(pc: &RTCPeerConnection, label: &str, events: PeerEvents) -> Result<Arc<RTCDataChannel>> {
    let dc = pc
        .create_data_channel(label, Some(RTCDataChannelInit::default()))
        .await
        .map_err(|e| engine_error("create data channel", e))?;
    attach_dc(&dc, ChannelOrigin::Local, events);
    Ok(dc)
}

/// Builds the peer connection configuration
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::PrAnswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::EngineFailure(
                "engine produced a description without type".into(),
            ))
        }
    };
    Ok(SessionDescription::new(kind, desc.sdp))
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        SdpKind::PrAnswer => RTCSessionDescription::pranswer(desc.sdp.clone()),
        SdpKind::Rollback => {
            return Err(NegotiationError::EngineFailure(
                "rollback is applied by replacing the peer connection".into(),
            ))
        }
    };
    parsed.map_err(|e| engine_error("parse description", e))
}
