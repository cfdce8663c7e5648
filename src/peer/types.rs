use crate::error::{NegotiationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a session description, serialized with the lowercase names
/// used by browsers (`offer`, `answer`, `pranswer`, `rollback`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    PrAnswer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::PrAnswer => "pranswer",
            SdpKind::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Session description as exchanged over signaling: `{"type": .., "sdp": ..}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp)
    }

    pub fn pranswer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::PrAnswer, sdp)
    }

    pub fn rollback() -> Self {
        Self::new(SdpKind::Rollback, String::new())
    }
}

/// ICE candidate in browser format
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }

    /// Candidate type taken from the `typ` attribute of the candidate line.
    pub fn candidate_type(&self) -> CandidateType {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return match parts.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::Srflx,
                    Some("prflx") => CandidateType::Prflx,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
    Unknown,
}

/// Signaling state of a negotiation session
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    #[serde(rename = "have-local-pranswer")]
    HaveLocalPrAnswer,
    #[serde(rename = "have-remote-pranswer")]
    HaveRemotePrAnswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPrAnswer => "have-local-pranswer",
            SignalingState::HaveRemotePrAnswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE connection state reported by the media engine
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Encoding parameters applied to a track's sender before every offer/answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MediaSenderConfig {
    pub max_bitrate_bps: u32,
    pub min_bitrate_bps: u32,
    pub max_framerate_fps: u32,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub scale_resolution_down_by: f64,
}

impl Default for MediaSenderConfig {
    fn default() -> Self {
        Self {
            max_bitrate_bps: 16_000_000,
            min_bitrate_bps: 8_000_000,
            max_framerate_fps: 60,
            resolution_width: 1920,
            resolution_height: 1080,
            scale_resolution_down_by: 1.0,
        }
    }
}

impl MediaSenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_bitrate_bps > self.max_bitrate_bps {
            return Err(NegotiationError::InvalidConfig(format!(
                "min bitrate {} exceeds max bitrate {}",
                self.min_bitrate_bps, self.max_bitrate_bps
            )));
        }
        if self.max_framerate_fps == 0 {
            return Err(NegotiationError::InvalidConfig(
                "max framerate must be positive".into(),
            ));
        }
        if !(self.scale_resolution_down_by >= 1.0) {
            return Err(NegotiationError::InvalidConfig(format!(
                "scale_resolution_down_by must be >= 1.0, got {}",
                self.scale_resolution_down_by
            )));
        }
        Ok(())
    }
}

/// Constraints handed to the engine when producing an offer or answer:
/// media direction flags plus resolution/framerate hints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MediaConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub min_frame_rate: u32,
    pub max_frame_rate: u32,
    pub scale_resolution_down_by: f64,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
            width: 1920,
            height: 1080,
            min_width: 1920,
            min_height: 1080,
            min_frame_rate: 30,
            max_frame_rate: 60,
            scale_resolution_down_by: 1.0,
        }
    }
}

/// One capture format advertised by a camera device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    /// FourCC pixel format, e.g. `420f`
    pub pixel_format: String,
    pub min_fps: f64,
    pub max_fps: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureTarget {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub pixel_format: String,
}

impl Default for CaptureTarget {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 60,
            pixel_format: "420f".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side created a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelHandle {
    pub label: String,
    pub ready_state: ChannelState,
}

/// SDP payload with metadata
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SdpPayload {
    pub sdp: SessionDescription,
    pub id: String,
    pub ts: i64,
}

/// Full connection bundle: SDP plus candidates
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionBundle {
    pub sdp_payload: SdpPayload,
    pub ice_candidates: Vec<IceCandidate>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_type_is_read_from_typ_attribute() {
        let c = IceCandidate::new(
            "0",
            0,
            "candidate:1 1 udp 2130706431 192.168.1.2 54321 typ host generation 0",
        );
        assert_eq!(c.candidate_type(), CandidateType::Host);

        let c = IceCandidate::new("0", 0, "candidate:2 1 udp 1 10.0.0.1 3478 typ relay raddr 1.2.3.4");
        assert_eq!(c.candidate_type(), CandidateType::Relay);

        let c = IceCandidate::new("0", 0, "garbage");
        assert_eq!(c.candidate_type(), CandidateType::Unknown);
    }

    #[test]
    fn sender_config_rejects_inverted_bitrates() {
        let cfg = MediaSenderConfig {
            min_bitrate_bps: 20_000_000,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(NegotiationError::InvalidConfig(_))
        ));
        assert!(MediaSenderConfig::default().validate().is_ok());
    }

    #[test]
    fn sender_config_rejects_upscaling() {
        let cfg = MediaSenderConfig {
            scale_resolution_down_by: 0.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn signaling_state_display_matches_w3c_names() {
        assert_eq!(SignalingState::HaveLocalPrAnswer.to_string(), "have-local-pranswer");
        assert_eq!(SignalingState::default(), SignalingState::Stable);
    }

    #[test]
    fn signaling_state_serializes_like_display() {
        for state in [
            SignalingState::Stable,
            SignalingState::HaveLocalOffer,
            SignalingState::HaveRemoteOffer,
            SignalingState::HaveLocalPrAnswer,
            SignalingState::HaveRemotePrAnswer,
            SignalingState::Closed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
            assert_eq!(serde_json::from_str::<SignalingState>(&json).unwrap(), state);
        }
    }
}
