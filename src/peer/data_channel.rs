use crate::engine::EngineEvent;
use crate::peer::connection::PeerEvents;
use crate::peer::types::{ChannelOrigin, ChannelState};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
            ChannelState::Connecting
        }
    }
}

/// common data-channel handler: open/close/message become engine events
pub(crate) fn attach_dc(dc: &Arc<RTCDataChannel>, origin: ChannelOrigin, events: PeerEvents) {
    let label = dc.label().to_owned();
    debug!("attach_dc called for {:?} ({:?})", label, origin);

    events.send(EngineEvent::DataChannelStateChanged {
        origin,
        label: label.clone(),
        state: channel_state(dc.ready_state()),
    });

    dc.on_open(Box::new({
        let events = events.clone();
        let label = label.clone();
        move || {
            info!("Data channel {:?} opened", label);
            events.send(EngineEvent::DataChannelStateChanged {
                origin,
                label,
                state: ChannelState::Open,
            });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        move |msg: DataChannelMessage| {
            debug!("Received message, length: {}", msg.data.len());
            events.send(EngineEvent::DataReceived {
                origin,
                data: msg.data,
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        info!("Data channel {:?} closed", label);
        events.send(EngineEvent::DataChannelStateChanged {
            origin,
            label: label.clone(),
            state: ChannelState::Closed,
        });
        Box::pin(async {})
    }));
}
