use crate::error::{NegotiationError, Result};
use crate::peer::types::{ConnectionState, IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Candidate in webrtc form for add_ice_candidate
pub fn to_candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: Some(candidate.sdp_mid.clone()),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    }
}

/// Local webrtc candidate in browser format
pub fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidate> {
    let init = candidate.to_json()?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid.unwrap_or_default(),
        sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
    })
}

pub fn connection_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    let state = match state {
        RTCIceConnectionState::New => ConnectionState::New,
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected => ConnectionState::Connected,
        RTCIceConnectionState::Completed => ConnectionState::Completed,
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    };
    Some(state)
}

/// Configured servers in webrtc form
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub(crate) fn engine_error(context: &str, e: webrtc::Error) -> NegotiationError {
    NegotiationError::EngineFailure(format!("{}: {}", context, e))
}
