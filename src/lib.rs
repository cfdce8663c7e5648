//! Session manager for a single peer-to-peer media connection: offer/answer
//! negotiation, trickle ICE candidate exchange, local tracks and the
//! bidirectional data channel.
//!
//! The media stack itself is abstracted behind [`engine::MediaEngine`];
//! [`peer::WebRtcEngine`] is the implementation on top of the `webrtc` crate.

pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod tracks;
pub mod utils;

pub use config::{LoggingConfig, SessionConfig};
pub use engine::{engine_event_channel, EngineEvent, MediaEngine};
pub use error::{NegotiationError, Result};
pub use negotiation::NegotiationStateMachine;
pub use peer::codec::SignalMessage;
pub use peer::types::{
    CaptureFormat, CaptureTarget, ChannelState, ConnectionState, IceCandidate, MediaConstraints,
    MediaSenderConfig, SdpKind, SessionDescription, SignalingState, TrackKind,
};
pub use signaling::{EventChannel, NoopSink, SessionEvent, SessionEventSink, SignalingChannel};
