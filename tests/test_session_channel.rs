//! Integration tests for the session channel against a scripted fake service

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeService, eventually, fast_settings, wait_for};
use region_watch::channel::{ChannelState, Credentials, FaultReason, GeminiLiveProtocol, SessionChannel};
use region_watch::config::ChannelSettings;
use region_watch::processing::encoder::JPEG_MIME;
use region_watch::{EncodedPayload, ResponseSink, WatchError};

fn payload(sequence: u64) -> EncodedPayload {
    EncodedPayload {
        bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
        mime_type: JPEG_MIME,
        sequence,
        width: 4,
        height: 4,
        quality: 85,
    }
}

fn channel_with(service: &Arc<FakeService>, settings: ChannelSettings) -> (SessionChannel, Arc<ResponseSink>) {
    let sink = Arc::new(ResponseSink::new());
    let channel = SessionChannel::new(
        service.connector(),
        Arc::new(GeminiLiveProtocol::new("gemini-2.0-flash-exp")),
        sink.clone(),
        settings,
    );
    (channel, sink)
}

fn texts(sink: &ResponseSink) -> Vec<String> {
    sink.fragments().into_iter().map(|f| f.text).collect()
}

#[tokio::test]
async fn test_frames_arrive_in_send_order() {
    let service = FakeService::new();
    let (channel, _) = channel_with(&service, fast_settings(3));
    channel.connect(Credentials::new("valid")).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Streaming);

    for seq in 1..=6 {
        let delivery = channel.send(payload(seq), &format!("frame-{}", seq)).unwrap();
        assert_eq!(delivery.sequence(), seq);
        delivery.await.unwrap();
    }

    let expected: Vec<String> = (1..=6).map(|s| format!("frame-{}", s)).collect();
    assert_eq!(service.prompts(), expected);
    assert_eq!(channel.stats().frames_written, 6);
    channel.close().await;
}

#[tokio::test]
async fn test_replies_flow_while_writes_are_stalled() {
    let service = FakeService::new();
    let (channel, sink) = channel_with(&service, fast_settings(3));
    channel.connect(Credentials::new("valid")).await.unwrap();

    service.set_stalled(true);
    let mut first = channel.send(payload(1), "describe").unwrap();
    // Writer holds frame 1; the queue takes one more and refuses the next.
    eventually(|| channel.send(payload(2), "describe").is_ok()).await;
    let refused = channel.send(payload(3), "describe").unwrap_err();
    assert!(matches!(refused, WatchError::SendDropped { sequence: Some(3), .. }));

    service.reply(&["A terminal", " window"]);
    service.reply(&["with a build error"]);
    eventually(|| sink.len() == 3).await;
    assert_eq!(texts(&sink), ["A terminal", " window", "with a build error"]);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut first)
            .await
            .is_err(),
        "write completed while stalled"
    );

    service.set_stalled(false);
    first.await.unwrap();
    eventually(|| service.frames().len() == 2).await;
    assert_eq!(channel.stats().fragments_received, 3);
    channel.close().await;
}

#[tokio::test]
async fn test_connect_retries_within_budget() {
    let service = FakeService::new();
    service.fail_next_connects(2);
    let (channel, _) = channel_with(&service, fast_settings(5));

    channel.connect(Credentials::new("valid")).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Streaming);
    assert_eq!(service.connect_calls(), 3);
    channel.close().await;
}

#[tokio::test]
async fn test_connect_gives_up_when_budget_spent() {
    let service = FakeService::new();
    service.fail_next_connects(5);
    let (channel, _) = channel_with(&service, fast_settings(5));

    let err = channel.connect(Credentials::new("valid")).await.unwrap_err();
    assert!(matches!(err, WatchError::ConnectionLost { attempts: 5, .. }));
    assert!(matches!(
        channel.state(),
        ChannelState::Faulted(FaultReason::ConnectionLost { attempts: 5, .. })
    ));
    assert_eq!(service.connect_calls(), 5);

    // A faulted channel can be closed and reconnected.
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    channel.connect(Credentials::new("valid")).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Streaming);
    channel.close().await;
}

#[tokio::test]
async fn test_auth_rejection_is_not_retried() {
    let service = FakeService::new();
    service.reject_auth();
    let (channel, _) = channel_with(&service, fast_settings(5));

    let err = channel.connect(Credentials::new("invalid")).await.unwrap_err();
    assert!(matches!(err, WatchError::Auth { .. }));
    assert!(matches!(
        channel.state(),
        ChannelState::Faulted(FaultReason::AuthRejected(_))
    ));
    assert_eq!(service.connect_calls(), 1);
}

#[tokio::test]
async fn test_reconnects_after_connection_drop() {
    let service = FakeService::new();
    let (channel, sink) = channel_with(&service, fast_settings(5));
    channel.connect(Credentials::new("valid")).await.unwrap();
    channel.send(payload(1), "before").unwrap().await.unwrap();

    let mut states = channel.subscribe();
    service.fail_next_connects(1);
    service.drop_connection();
    wait_for(&mut states, |s| *s == ChannelState::Connecting).await;
    wait_for(&mut states, |s| *s == ChannelState::Streaming).await;
    assert_eq!(channel.stats().reconnects, 1);
    assert_eq!(service.connect_calls(), 3);

    channel.send(payload(2), "after").unwrap().await.unwrap();
    assert_eq!(service.prompts(), ["before", "after"]);

    service.reply(&["still watching"]);
    eventually(|| sink.len() == 1).await;
    channel.close().await;
}

#[tokio::test]
async fn test_send_refused_unless_streaming() {
    let service = FakeService::new();
    let (channel, _) = channel_with(&service, fast_settings(3));

    let err = channel.send(payload(7), "describe").unwrap_err();
    assert!(matches!(err, WatchError::SendDropped { sequence: Some(7), .. }));
    assert!(service.frames().is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let service = FakeService::new();
    let (channel, _) = channel_with(&service, fast_settings(3));

    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);

    channel.connect(Credentials::new("valid")).await.unwrap();
    channel.close().await;
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(channel.send(payload(1), "late").is_err());
}

#[tokio::test]
async fn test_close_interrupts_backoff() {
    let service = FakeService::new();
    service.fail_next_connects(u32::MAX);
    let mut settings = fast_settings(1_000);
    settings.reconnect.initial_delay = Duration::from_millis(200);
    settings.reconnect.max_delay = Duration::from_secs(1);
    let (channel, _) = channel_with(&service, settings);
    let channel = Arc::new(channel);

    let connecting = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.connect(Credentials::new("valid")).await })
    };
    eventually(|| service.connect_calls() >= 1).await;
    channel.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), connecting)
        .await
        .expect("connect did not observe close")
        .unwrap();
    assert!(matches!(result, Err(WatchError::Cancelled { .. })));
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_faulted_channel_accepts_new_connect() {
    let service = FakeService::new();
    let (channel, sink) = channel_with(&service, fast_settings(2));
    channel.connect(Credentials::new("valid")).await.unwrap();

    let mut states = channel.subscribe();
    service.fail_next_connects(u32::MAX);
    service.drop_connection();
    wait_for(&mut states, |s| {
        matches!(s, ChannelState::Faulted(FaultReason::ConnectionLost { .. }))
    })
    .await;
    assert!(channel.send(payload(1), "late").is_err());

    // No close in between: the fault itself ends the old session.
    service.fail_next_connects(0);
    channel.connect(Credentials::new("valid")).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Streaming);
    channel.send(payload(2), "again").unwrap().await.unwrap();
    assert_eq!(service.prompts(), ["again"]);

    service.reply(&["back online"]);
    eventually(|| sink.len() == 1).await;
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_connect_rejected_while_streaming() {
    let service = FakeService::new();
    let (channel, _) = channel_with(&service, fast_settings(3));
    channel.connect(Credentials::new("valid")).await.unwrap();

    let err = channel.connect(Credentials::new("valid")).await.unwrap_err();
    assert!(matches!(err, WatchError::AlreadyRunning { .. }));
    assert_eq!(service.connect_calls(), 1);
    channel.close().await;
}

#[tokio::test]
async fn test_auth_revoked_mid_session_is_terminal() {
    let service = FakeService::new();
    let (channel, _) = channel_with(&service, fast_settings(5));
    channel.connect(Credentials::new("valid")).await.unwrap();

    let mut states = channel.subscribe();
    service.revoke_auth();
    wait_for(&mut states, |s| {
        matches!(s, ChannelState::Faulted(FaultReason::AuthRejected(_)))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.connect_calls(), 1);
    assert_eq!(channel.stats().reconnects, 0);
    assert!(matches!(
        channel.state(),
        ChannelState::Faulted(FaultReason::AuthRejected(_))
    ));
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_setup_rejection_is_not_retried() {
    let service = FakeService::new();
    service.reject_model();
    let (channel, _) = channel_with(&service, fast_settings(5));

    let err = channel.connect(Credentials::new("valid")).await.unwrap_err();
    assert!(matches!(err, WatchError::Protocol { .. }));
    assert!(matches!(
        channel.state(),
        ChannelState::Faulted(FaultReason::SetupRejected(_))
    ));
    assert_eq!(service.connect_calls(), 1);
}

#[tokio::test]
async fn test_stalled_write_times_out_and_reconnects() {
    let service = FakeService::new();
    let mut settings = fast_settings(5);
    settings.send_timeout = Duration::from_millis(100);
    let (channel, _) = channel_with(&service, settings);
    channel.connect(Credentials::new("valid")).await.unwrap();

    service.set_stalled(true);
    let delivery = channel.send(payload(1), "stuck").unwrap();
    let err = delivery.await.unwrap_err();
    assert!(matches!(err, WatchError::SendDropped { sequence: Some(1), .. }));

    eventually(|| channel.stats().reconnects == 1).await;
    let mut states = channel.subscribe();
    wait_for(&mut states, |s| *s == ChannelState::Streaming).await;
    assert_eq!(service.connect_calls(), 2);

    service.set_stalled(false);
    channel.send(payload(2), "after").unwrap().await.unwrap();
    assert_eq!(service.prompts(), ["after"]);
    channel.close().await;
}

#[tokio::test]
async fn test_rotation_does_not_spend_retry_budget() {
    let service = FakeService::new();
    // A budget of one attempt: any rotation counted as a failure would fault.
    let mut settings = fast_settings(1);
    settings.rotate_after = Some(Duration::from_millis(150));
    let (channel, sink) = channel_with(&service, settings);
    channel.connect(Credentials::new("valid")).await.unwrap();

    eventually(|| channel.stats().reconnects >= 3).await;
    assert!(service.connect_calls() >= 4);
    assert!(!matches!(channel.state(), ChannelState::Faulted(_)));

    let mut states = channel.subscribe();
    wait_for(&mut states, |s| *s == ChannelState::Streaming).await;
    // Re-send if a rotation swallowed the reply on a closing link.
    eventually(|| {
        if sink.is_empty() {
            service.reply(&["after rotation"]);
        }
        !sink.is_empty()
    })
    .await;
    assert_eq!(texts(&sink)[0], "after rotation");
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
}
