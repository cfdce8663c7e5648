use crate::config::LoggingConfig;
use crate::peer::types::{CandidateType, IceCandidate};
use tracing::{debug, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global `tracing` subscriber. Returns `false` when logging is
/// disabled or a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    if !config.enabled {
        return false;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_owned()))
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

/// Prints an ICE candidate as it shows up (trickle ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
    pub unknown: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        match candidate.candidate_type() {
            CandidateType::Host => summary.host += 1,
            CandidateType::Srflx => summary.srflx += 1,
            CandidateType::Prflx => summary.prflx += 1,
            CandidateType::Relay => summary.relay += 1,
            CandidateType::Unknown => summary.unknown += 1,
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} prflx, {} relay",
        summary.host, summary.srflx, summary.prflx, summary.relay
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found, connection through NAT may fail");
    }
    summary
}
