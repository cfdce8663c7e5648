//! Boundary to the media engine that owns codecs, ICE and secure transport.

use crate::error::Result;
use crate::peer::types::{
    CaptureFormat, ChannelOrigin, ChannelState, ConnectionState, IceCandidate, MediaConstraints,
    MediaSenderConfig, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Push notifications from the engine. They may be produced on any worker
/// thread; the session consumes them on its own task.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    /// Local gathering finished (the `null` candidate)
    GatheringComplete,
    ConnectionStateChanged(ConnectionState),
    DataChannelStateChanged {
        origin: ChannelOrigin,
        label: String,
        state: ChannelState,
    },
    DataReceived {
        origin: ChannelOrigin,
        data: Bytes,
    },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

/// Operations the session manager drives on the underlying peer connection.
///
/// Every method may suspend. Errors are reported as
/// [`NegotiationError::EngineFailure`](crate::error::NegotiationError::EngineFailure).
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<SessionDescription>;

    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Create a local track of `kind` and attach it to the connection
    async fn add_track(&self, kind: TrackKind, track_id: &str, stream_id: &str) -> Result<()>;

    async fn set_sender_parameters(&self, kind: TrackKind, config: &MediaSenderConfig)
        -> Result<()>;

    /// Flip the track's enabled flag without renegotiation
    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<()>;

    /// Formats supported by the capture device feeding the video track
    fn capture_formats(&self) -> Vec<CaptureFormat>;

    async fn start_capture(&self, format: &CaptureFormat, fps: u32) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<()>;

    /// Send on the channel the remote side opened
    async fn send_data(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
