//! Wire encoding for descriptions, candidates and non-trickle bundles.

use crate::error::{NegotiationError, Result};
use crate::peer::types::{ConnectionBundle, IceCandidate, SessionDescription};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Limit on the decompressed bundle size (zip-bomb guard)
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// Any message travelling over the signaling channel, told apart by shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SignalMessage {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

pub fn encode_description(desc: &SessionDescription) -> Result<String> {
    Ok(serde_json::to_string(desc)?)
}

pub fn decode_description(s: &str) -> Result<SessionDescription> {
    Ok(serde_json::from_str(s)?)
}

pub fn encode_candidate(candidate: &IceCandidate) -> Result<String> {
    Ok(serde_json::to_string(candidate)?)
}

pub fn decode_candidate(s: &str) -> Result<IceCandidate> {
    Ok(serde_json::from_str(s)?)
}

pub fn decode_signal(s: &str) -> Result<SignalMessage> {
    serde_json::from_str(s).map_err(|e| {
        NegotiationError::Codec(format!("not a description or candidate: {}", e))
    })
}

/// JSON -> gzip -> base64
pub fn encode_bundle(bundle: &ConnectionBundle) -> Result<String> {
    let json = serde_json::to_vec(bundle)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_bundle(s: &str) -> Result<ConnectionBundle> {
    let compressed = general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| NegotiationError::Codec(format!("invalid base64: {}", e)))?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.take(MAX_DECOMPRESSED_SIZE + 1).read_to_end(&mut json)?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(NegotiationError::Codec(format!(
            "bundle exceeds {} bytes when decompressed",
            MAX_DECOMPRESSED_SIZE
        )));
    }

    Ok(serde_json::from_slice(&json)?)
}

fn fingerprint_lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("a=fingerprint:"))
}

/// Short authentication string over the DTLS fingerprints of both sides.
/// 48 bits (12 hex chars), independent of which side is local.
pub fn session_fingerprint(local_sdp: &str, remote_sdp: &str) -> Option<String> {
    let mut lines: Vec<&str> = fingerprint_lines(local_sdp).collect();
    let local_count = lines.len();
    lines.extend(fingerprint_lines(remote_sdp));
    if local_count == 0 || lines.len() == local_count {
        return None;
    }
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    Some(hex::encode(&digest[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{SdpKind, SdpPayload};

    const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
        a=fingerprint:sha-256 AA:BB:CC\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
    const ANSWER_SDP: &str = "v=0\r\no=- 3 4 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
        a=fingerprint:sha-256 DD:EE:FF\r\n";

    #[test]
    fn description_wire_format_uses_type_and_sdp() {
        let desc = SessionDescription::offer("v=0");
        let json = encode_description(&desc).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
        assert_eq!(decode_description(&json).unwrap(), desc);
    }

    #[test]
    fn pranswer_uses_browser_name() {
        let desc = decode_description(r#"{"type":"pranswer","sdp":"v=0"}"#).unwrap();
        assert_eq!(desc.kind, SdpKind::PrAnswer);
    }

    #[test]
    fn unknown_description_type_is_rejected() {
        let err = decode_description(r#"{"type":"bogus","sdp":"v=0"}"#).unwrap_err();
        assert!(matches!(err, NegotiationError::Codec(_)));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let c = IceCandidate::new("video", 1, "candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        let json = encode_candidate(&c).unwrap();
        assert!(json.contains(r#""sdpMid":"video""#));
        assert!(json.contains(r#""sdpMLineIndex":1"#));
        assert_eq!(decode_candidate(&json).unwrap(), c);
    }

    #[test]
    fn signal_message_is_told_apart_by_shape() {
        let desc = decode_signal(r#"{"type":"answer","sdp":"v=0"}"#).unwrap();
        assert_eq!(desc, SignalMessage::Description(SessionDescription::answer("v=0")));

        let cand = decode_signal(r#"{"candidate":"c","sdpMid":"0","sdpMLineIndex":0}"#).unwrap();
        assert_eq!(cand, SignalMessage::Candidate(IceCandidate::new("0", 0, "c")));

        assert!(decode_signal(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn bundle_survives_compression() {
        let bundle = ConnectionBundle {
            sdp_payload: SdpPayload {
                sdp: SessionDescription::offer(OFFER_SDP),
                id: "abc".into(),
                ts: 1_700_000_000,
            },
            ice_candidates: vec![IceCandidate::new("0", 0, "candidate:1 1 udp 1 10.0.0.1 5000 typ host")],
        };
        let token = encode_bundle(&bundle).unwrap();
        assert!(!token.contains('{'));
        assert_eq!(decode_bundle(&token).unwrap(), bundle);
    }

    #[test]
    fn oversized_bundle_is_rejected() {
        let huge = vec![b' '; (MAX_DECOMPRESSED_SIZE as usize) + 10];
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&huge).unwrap();
        let token = general_purpose::STANDARD.encode(gz.finish().unwrap());
        assert!(matches!(decode_bundle(&token), Err(NegotiationError::Codec(_))));
    }

    #[test]
    fn garbage_bundle_is_a_codec_error() {
        assert!(matches!(decode_bundle("%%%"), Err(NegotiationError::Codec(_))));
    }

    #[test]
    fn fingerprint_is_symmetric() {
        let a = session_fingerprint(OFFER_SDP, ANSWER_SDP).unwrap();
        let b = session_fingerprint(ANSWER_SDP, OFFER_SDP).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn fingerprint_needs_both_sides() {
        assert!(session_fingerprint(OFFER_SDP, "v=0\r\n").is_none());
        assert!(session_fingerprint("v=0\r\n", ANSWER_SDP).is_none());
    }
}
