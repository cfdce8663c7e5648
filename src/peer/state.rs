use crate::error::Result;
use crate::utils::lock;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;

/// ========== GLOBAL STATE ==========

/// Shared API with codecs and interceptors, one per process
static FACTORY: Lazy<Mutex<Option<Arc<API>>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide factory for peer connections.
pub struct PeerFactory;

impl PeerFactory {
    /// Returns the shared API, building it on first use.
    pub fn shared() -> Result<Arc<API>> {
        let mut slot = lock(&FACTORY);
        if let Some(api) = slot.as_ref() {
            return Ok(Arc::clone(api));
        }

        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs)?;
        let api = Arc::new(
            APIBuilder::new()
                .with_media_engine(codecs)
                .with_interceptor_registry(registry)
                .build(),
        );
        info!("Peer connection factory initialized");

        *slot = Some(Arc::clone(&api));
        Ok(api)
    }

    /// Drops the shared API. Connections already created keep their own
    /// reference; the next `shared()` builds a fresh one.
    pub fn shutdown() {
        if lock(&FACTORY).take().is_some() {
            debug!("Peer connection factory released");
        }
    }
}
