//! Data channel bookkeeping.
//!
//! The local channel is created eagerly when the session is built. The
//! remote channel only exists once the peer opens one; its state is observed
//! from engine events, never driven from here. Outbound data always goes to
//! the remote channel.

use crate::engine::MediaEngine;
use crate::error::{NegotiationError, Result};
use crate::peer::types::{ChannelOrigin, ChannelState, DataChannelHandle};
use crate::utils::lock;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

pub struct DataChannelController {
    engine: Arc<dyn MediaEngine>,
    local: Mutex<DataChannelHandle>,
    remote: Mutex<Option<DataChannelHandle>>,
}

impl DataChannelController {
    /// Creates the local channel with `label`.
    #[instrument(skip(engine))]
    pub async fn open(engine: Arc<dyn MediaEngine>, label: &str) -> Result<Self> {
        engine.create_data_channel(label).await?;
        info!("Local data channel {:?} created", label);
        Ok(Self {
            engine,
            local: Mutex::new(DataChannelHandle {
                label: label.to_owned(),
                ready_state: ChannelState::Connecting,
            }),
            remote: Mutex::new(None),
        })
    }

    pub fn local(&self) -> DataChannelHandle {
        lock(&self.local).clone()
    }

    pub fn remote(&self) -> Option<DataChannelHandle> {
        lock(&self.remote).clone()
    }

    /// Records a state change reported by the engine.
    pub(crate) fn on_state_changed(&self, origin: ChannelOrigin, label: &str, state: ChannelState) {
        match origin {
            ChannelOrigin::Local => {
                let mut local = lock(&self.local);
                debug!("Local channel {:?}: {} -> {}", label, local.ready_state, state);
                local.ready_state = state;
            }
            ChannelOrigin::Remote => {
                let mut remote = lock(&self.remote);
                match remote.as_mut() {
                    Some(handle) if handle.label == label => {
                        debug!("Remote channel {:?}: {} -> {}", label, handle.ready_state, state);
                        handle.ready_state = state;
                    }
                    _ => {
                        info!("Remote data channel {:?} appeared ({})", label, state);
                        *remote = Some(DataChannelHandle {
                            label: label.to_owned(),
                            ready_state: state,
                        });
                    }
                }
            }
        }
    }

    /// Sends on the channel the remote side opened. Fails with
    /// `ChannelNotReady` unless that channel is open; nothing is queued.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let remote = self.remote();
        match remote {
            Some(handle) if handle.ready_state == ChannelState::Open => {
                debug!("Sending {} bytes on {:?}", data.len(), handle.label);
                self.engine.send_data(data).await
            }
            Some(handle) => Err(NegotiationError::ChannelNotReady {
                label: handle.label,
                state: handle.ready_state,
            }),
            None => Err(NegotiationError::ChannelNotReady {
                label: String::new(),
                state: ChannelState::Closed,
            }),
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }
}
