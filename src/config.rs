// Session configuration.
// Logging is on by default only in debug builds.

use crate::error::{NegotiationError, Result};
use crate::peer::types::{
    CaptureTarget, IceServerKind, MediaConstraints, MediaSenderConfig, ServerConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            filter: "info,webrtc=warn".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub data_channel_label: String,
    pub stream_id: String,
    pub enable_audio: bool,
    pub enable_video: bool,
    pub constraints: MediaConstraints,
    pub sender: MediaSenderConfig,
    pub capture: CaptureTarget,
    /// Answer a remote offer as soon as it is applied
    pub auto_answer: bool,
    pub logging: LoggingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            data_channel_label: "WebRTCData".into(),
            stream_id: "stream".into(),
            enable_audio: false,
            enable_video: true,
            constraints: MediaConstraints::default(),
            sender: MediaSenderConfig::default(),
            capture: CaptureTarget::default(),
            auto_answer: true,
            logging: LoggingConfig::default(),
        }
    }
}

/// Default STUN servers
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

impl SessionConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(s)
            .map_err(|e| NegotiationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NegotiationError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(NegotiationError::InvalidConfig(format!(
                    "ICE server {} has an empty URL",
                    server.id
                )));
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(NegotiationError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.data_channel_label.is_empty() {
            return Err(NegotiationError::InvalidConfig(
                "data channel label cannot be empty".into(),
            ));
        }
        self.sender.validate()
    }
}
