//! Error types for session negotiation

use crate::peer::types::{ChannelState, SignalingState};

/// Result type alias using [`NegotiationError`]
pub type Result<T> = std::result::Result<T, NegotiationError>;

/// Errors surfaced by the session manager. None of them is swallowed:
/// every failure reaches the caller through a `Result`.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The media engine rejected an operation; session state is unchanged
    #[error("Media engine failure: {0}")]
    EngineFailure(String),

    /// Operation not allowed in the current signaling state
    #[error("Invalid transition: {op} is not allowed in state {state}")]
    InvalidTransition {
        op: &'static str,
        state: SignalingState,
    },

    /// Another offer/answer is being produced for this session
    #[error("Negotiation already in progress")]
    NegotiationInProgress,

    /// The session has been closed
    #[error("Session closed")]
    SessionClosed,

    /// No capture format matched the requested one exactly
    #[error("No matching capture format for {width}x{height} {pixel_format}")]
    NoMatchingCaptureFormat {
        width: u32,
        height: u32,
        pixel_format: String,
    },

    /// Send attempted on a data channel that is not open
    #[error("Data channel {label:?} not ready (state: {state})")]
    ChannelNotReady { label: String, state: ChannelState },

    /// Malformed wire message or bundle
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NegotiationError {
    /// Whether the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NegotiationError::NegotiationInProgress | NegotiationError::ChannelNotReady { .. }
        )
    }

    /// Whether the error can never go away for this session
    pub fn is_permanent(&self) -> bool {
        matches!(self, NegotiationError::SessionClosed)
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(e: serde_json::Error) -> Self {
        NegotiationError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for NegotiationError {
    fn from(e: std::io::Error) -> Self {
        NegotiationError::Codec(e.to_string())
    }
}

impl From<webrtc::Error> for NegotiationError {
    fn from(e: webrtc::Error) -> Self {
        NegotiationError::EngineFailure(e.to_string())
    }
}
