mod common;

use bytes::Bytes;
use common::*;
use rtc_session::engine::EngineEvent;
use rtc_session::peer::types::ChannelOrigin;
use rtc_session::{ChannelState, NegotiationError, SessionConfig, SessionEvent};

fn remote_channel(state: ChannelState) -> EngineEvent {
    EngineEvent::DataChannelStateChanged {
        origin: ChannelOrigin::Remote,
        label: "WebRTCData".into(),
        state,
    }
}

#[tokio::test]
async fn local_channel_is_created_with_session() {
    let s = TestSession::new(SessionConfig::default()).await;

    assert_eq!(s.engine.count(&Call::CreateDataChannel("WebRTCData".into())), 1);
    let local = s.machine.data_channels().local();
    assert_eq!(local.label, "WebRTCData");
    assert_eq!(local.ready_state, ChannelState::Connecting);
    assert!(s.machine.data_channels().remote().is_none());
}

#[tokio::test]
async fn send_requires_open_remote_channel() {
    let s = TestSession::new(SessionConfig::default()).await;

    let err = s.machine.send_text("hello").await.unwrap_err();
    assert!(matches!(err, NegotiationError::ChannelNotReady { .. }));

    // an open local channel is not enough
    s.engine.emit(EngineEvent::DataChannelStateChanged {
        origin: ChannelOrigin::Local,
        label: "WebRTCData".into(),
        state: ChannelState::Open,
    });
    wait_until(|| s.machine.data_channels().local().ready_state == ChannelState::Open).await;
    assert!(s.machine.send_text("hello").await.is_err());

    s.engine.emit(remote_channel(ChannelState::Connecting));
    wait_until(|| s.machine.data_channels().remote().is_some()).await;
    let err = s.machine.send_text("hello").await.unwrap_err();
    assert!(matches!(
        err,
        NegotiationError::ChannelNotReady {
            state: ChannelState::Connecting,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert!(s.engine.sent_data().is_empty());

    s.engine.emit(remote_channel(ChannelState::Open));
    wait_until(|| {
        s.machine.data_channels().remote().map(|h| h.ready_state) == Some(ChannelState::Open)
    })
    .await;

    s.machine.send_data(Bytes::from_static(&[1, 2, 3])).await.unwrap();
    s.machine.send_text("hi").await.unwrap();
    assert_eq!(
        s.engine.sent_data(),
        vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(b"hi")]
    );
}

#[tokio::test]
async fn closed_remote_channel_rejects_sends() {
    let s = TestSession::new(SessionConfig::default()).await;
    s.engine.emit(remote_channel(ChannelState::Open));
    s.engine.emit(remote_channel(ChannelState::Closed));
    wait_until(|| {
        s.machine.data_channels().remote().map(|h| h.ready_state) == Some(ChannelState::Closed)
    })
    .await;

    assert!(matches!(
        s.machine.send_text("late").await,
        Err(NegotiationError::ChannelNotReady {
            state: ChannelState::Closed,
            ..
        })
    ));
}

#[tokio::test]
async fn inbound_data_reaches_the_sink() {
    let mut s = TestSession::new(SessionConfig::default()).await;

    s.engine.emit(EngineEvent::DataReceived {
        origin: ChannelOrigin::Remote,
        data: Bytes::from_static(b"ping"),
    });
    s.engine.emit(EngineEvent::DataReceived {
        origin: ChannelOrigin::Local,
        data: Bytes::from_static(b"pong"),
    });

    assert_eq!(
        s.next_event().await,
        SessionEvent::DataReceived(Bytes::from_static(b"ping"))
    );
    assert_eq!(
        s.next_event().await,
        SessionEvent::DataReceived(Bytes::from_static(b"pong"))
    );
}

#[tokio::test]
async fn send_after_close_fails() {
    let s = TestSession::new(SessionConfig::default()).await;
    s.engine.emit(remote_channel(ChannelState::Open));
    wait_until(|| s.machine.data_channels().remote().is_some()).await;

    s.machine.close().await.unwrap();
    assert!(matches!(
        s.machine.send_text("bye").await,
        Err(NegotiationError::SessionClosed)
    ));
    assert!(s.engine.sent_data().is_empty());
}

#[tokio::test]
async fn custom_label_is_used() {
    let config = SessionConfig {
        data_channel_label: "control".into(),
        ..SessionConfig::default()
    };
    let s = TestSession::new(config).await;
    assert_eq!(s.machine.data_channels().local().label, "control");
    assert_eq!(s.engine.count(&Call::CreateDataChannel("control".into())), 1);
}
