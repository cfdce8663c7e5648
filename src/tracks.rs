//! Local media tracks: creation, mute/unmute and sender encoding parameters.

use crate::engine::MediaEngine;
use crate::error::{NegotiationError, Result};
use crate::peer::types::{CaptureFormat, CaptureTarget, MediaSenderConfig, TrackKind};
use crate::utils::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
struct TrackEntry {
    track_id: String,
    enabled: bool,
}

/// Owns the local tracks of a session and the encoding parameters of their
/// senders. The sender config is pushed to the engine right before each
/// offer/answer is produced, from inside the negotiation step, so it never
/// races an in-flight negotiation for the same sender.
pub struct TrackController {
    engine: Arc<dyn MediaEngine>,
    stream_id: String,
    sender: Mutex<MediaSenderConfig>,
    tracks: Mutex<HashMap<TrackKind, TrackEntry>>,
}

impl TrackController {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        stream_id: impl Into<String>,
        sender: MediaSenderConfig,
    ) -> Result<Self> {
        sender.validate()?;
        Ok(Self {
            engine,
            stream_id: stream_id.into(),
            sender: Mutex::new(sender),
            tracks: Mutex::new(HashMap::new()),
        })
    }

    /// Creates the local track of `kind` and attaches it to the connection.
    /// Attaching the same kind twice is a no-op.
    #[instrument(skip(self))]
    pub async fn attach(&self, kind: TrackKind) -> Result<()> {
        if lock(&self.tracks).contains_key(&kind) {
            debug!("{} track already attached", kind);
            return Ok(());
        }

        let track_id = format!("{}0", kind);
        self.engine.add_track(kind, &track_id, &self.stream_id).await?;
        info!("Attached {} track {} to stream {}", kind, track_id, self.stream_id);

        lock(&self.tracks).insert(
            kind,
            TrackEntry {
                track_id,
                enabled: true,
            },
        );
        Ok(())
    }

    pub fn attached_kinds(&self) -> Vec<TrackKind> {
        let mut kinds: Vec<TrackKind> = lock(&self.tracks).keys().copied().collect();
        kinds.sort_by_key(|k| matches!(k, TrackKind::Video));
        kinds
    }

    pub fn track_id(&self, kind: TrackKind) -> Option<String> {
        lock(&self.tracks).get(&kind).map(|t| t.track_id.clone())
    }

    pub fn sender_config(&self) -> MediaSenderConfig {
        lock(&self.sender).clone()
    }

    /// Replaces the sender config; it takes effect at the next offer/answer.
    pub fn set_sender_config(&self, config: MediaSenderConfig) -> Result<()> {
        config.validate()?;
        *lock(&self.sender) = config;
        Ok(())
    }

    /// Pushes the current sender config to the video sender. Called by the
    /// negotiation actor immediately before an offer or answer is produced.
    pub async fn prepare_for_negotiation(&self) -> Result<()> {
        if !lock(&self.tracks).contains_key(&TrackKind::Video) {
            return Ok(());
        }
        let config = self.sender_config();
        debug!(
            "Applying sender config: {}..{} bps, {} fps, {}x{}, scale {}",
            config.min_bitrate_bps,
            config.max_bitrate_bps,
            config.max_framerate_fps,
            config.resolution_width,
            config.resolution_height,
            config.scale_resolution_down_by
        );
        self.engine
            .set_sender_parameters(TrackKind::Video, &config)
            .await
    }

    /// Mute/unmute (audio) or hide/show (video). The track stays attached,
    /// only its enabled flag flips; no renegotiation happens.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        let mut tracks = lock(&self.tracks);
        let Some(entry) = tracks.get_mut(&kind) else {
            debug!("No {} track attached, set_enabled({}) ignored", kind, enabled);
            return Ok(());
        };
        self.engine.set_track_enabled(kind, enabled)?;
        entry.enabled = enabled;
        info!("{} track {}", kind, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        lock(&self.tracks).get(&kind).map(|t| t.enabled)
    }

    /// Picks the capture format that exactly matches `target` and starts
    /// capturing with it.
    #[instrument(skip(self))]
    pub async fn start_capture(&self, target: &CaptureTarget) -> Result<CaptureFormat> {
        let formats = self.engine.capture_formats();
        let format = select_capture_format(&formats, target)?;
        self.engine.start_capture(&format, target.frame_rate).await?;
        info!(
            "Capture started: {}x{} {} @ {} fps",
            format.width, format.height, format.pixel_format, target.frame_rate
        );
        Ok(format)
    }
}

/// Exact match on width, height and pixel format. Near matches are never
/// picked; the caller decides on a fallback.
pub fn select_capture_format(
    formats: &[CaptureFormat],
    target: &CaptureTarget,
) -> Result<CaptureFormat> {
    formats
        .iter()
        .find(|f| {
            debug!(
                "Desired {}x{} {}, actual {}x{} {}",
                target.width, target.height, target.pixel_format, f.width, f.height, f.pixel_format
            );
            f.width == target.width
                && f.height == target.height
                && f.pixel_format == target.pixel_format
        })
        .cloned()
        .ok_or_else(|| NegotiationError::NoMatchingCaptureFormat {
            width: target.width,
            height: target.height,
            pixel_format: target.pixel_format.clone(),
        })
}
