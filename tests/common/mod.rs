//! Common test utilities for the region-watch integration tests
//!
//! Fakes for the two outside edges of the pipeline (the screen and the
//! remote service) plus a recording observer. None of them touch a display
//! or the network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use region_watch::channel::{Connector, Credentials, Transport, TransportRx, TransportTx};
use region_watch::config::{ChannelSettings, ReconnectPolicy};
use region_watch::{
    Frame, Region, RegionCapturer, ResponseFragment, ResponseObserver, SessionState, WatchError,
    WatchResult,
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

/// Capturer that paints a small gradient and counts calls.
#[derive(Default)]
pub struct FakeCapturer {
    calls: AtomicU64,
    fail: AtomicBool,
}

impl FakeCapturer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl RegionCapturer for FakeCapturer {
    fn capture(&self, region: &Region) -> WatchResult<Frame> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::capture(
                region_watch::CaptureFailure::Backend,
                "fake capture failure",
            ));
        }
        Ok(gradient_frame(region.width, region.height))
    }
}

pub fn gradient_frame(width: u32, height: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128, 255]);
        }
    }
    Frame::bgra(width, height, data)
}

/// Observer that records everything it is told.
#[derive(Default)]
pub struct RecordingObserver {
    pub fragments: Mutex<Vec<String>>,
    pub states: Mutex<Vec<SessionState>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn texts(&self) -> Vec<String> {
        self.fragments.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.states.lock().unwrap().clone()
    }
}

impl ResponseObserver for RecordingObserver {
    fn on_fragment(&self, fragment: &ResponseFragment) -> anyhow::Result<()> {
        self.fragments.lock().unwrap().push(fragment.text.clone());
        Ok(())
    }

    fn on_status(&self, state: &SessionState) -> anyhow::Result<()> {
        self.states.lock().unwrap().push(state.clone());
        Ok(())
    }
}

type Inbound = mpsc::UnboundedSender<WatchResult<String>>;

/// Scriptable stand-in for the live endpoint.
///
/// Acknowledges the setup message (or rejects it when `reject_auth` is
/// set), records every frame message in arrival order, and lets the test
/// push server messages, stall writes or drop the connection.
pub struct FakeService {
    connect_calls: AtomicU32,
    fail_connects: AtomicU32,
    reject_auth: AtomicBool,
    reject_model: AtomicBool,
    frames: Mutex<Vec<Value>>,
    inbound: Mutex<Option<Inbound>>,
    stall: watch::Sender<bool>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        let (stall, _) = watch::channel(false);
        Arc::new(Self {
            connect_calls: AtomicU32::new(0),
            fail_connects: AtomicU32::new(0),
            reject_auth: AtomicBool::new(false),
            reject_model: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            stall,
        })
    }

    /// Refuse the next `n` connection attempts at the transport level.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn reject_auth(&self) {
        self.reject_auth.store(true, Ordering::SeqCst);
    }

    /// Answer setup with a non-credential service error (unknown model).
    pub fn reject_model(&self) {
        self.reject_model.store(true, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Frame messages received, oldest first.
    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    /// Prompt text of each received frame, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| {
                f["client_content"]["turns"][0]["parts"][0]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    /// Hold every write until `set_stalled(false)`.
    pub fn set_stalled(&self, stalled: bool) {
        self.stall.send_replace(stalled);
    }

    /// Stream a model reply made of `parts` on the open connection.
    pub fn reply(&self, parts: &[&str]) {
        let parts: Vec<Value> = parts.iter().map(|t| json!({ "text": t })).collect();
        let message = json!({ "serverContent": { "modelTurn": { "parts": parts } } });
        self.push(Ok(message.to_string()));
    }

    /// Report on the open connection that the key was revoked.
    pub fn revoke_auth(&self) {
        let message = json!({
            "error": { "code": 403, "status": "PERMISSION_DENIED", "message": "API key revoked" }
        });
        self.push(Ok(message.to_string()));
    }

    /// Break the open connection as a network reset would.
    pub fn drop_connection(&self) {
        self.push(Err(WatchError::connect("fake", "connection reset")));
    }

    fn push(&self, message: WatchResult<String>) {
        if let Some(inbound) = self.inbound.lock().unwrap().as_ref() {
            let _ = inbound.send(message);
        }
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            service: self.clone(),
        })
    }
}

struct FakeConnector {
    service: Arc<FakeService>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, credentials: &Credentials) -> WatchResult<Transport> {
        let service = &self.service;
        service.connect_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = service.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            service.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(WatchError::connect("fake", "connection refused"));
        }
        assert!(!credentials.api_key().is_empty());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        *service.inbound.lock().unwrap() = Some(inbound_tx.clone());
        Ok((
            Box::new(FakeTx {
                service: service.clone(),
                inbound: inbound_tx,
            }),
            Box::new(FakeRx { inbound: inbound_rx }),
        ))
    }
}

struct FakeTx {
    service: Arc<FakeService>,
    inbound: Inbound,
}

#[async_trait]
impl TransportTx for FakeTx {
    async fn send(&mut self, text: String) -> WatchResult<()> {
        let message: Value = serde_json::from_str(&text).expect("client sends JSON");
        if message.get("setup").is_some() {
            let reply = if self.service.reject_auth.load(Ordering::SeqCst) {
                json!({ "error": { "code": 401, "status": "UNAUTHENTICATED", "message": "API key not valid" } })
            } else if self.service.reject_model.load(Ordering::SeqCst) {
                json!({ "error": { "code": 400, "status": "INVALID_ARGUMENT", "message": "model not found" } })
            } else {
                json!({ "setupComplete": {} })
            };
            let _ = self.inbound.send(Ok(reply.to_string()));
            return Ok(());
        }

        let mut stall = self.service.stall.subscribe();
        let _ = stall.wait_for(|stalled| !*stalled).await;
        self.service.frames.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&mut self) -> WatchResult<()> {
        Ok(())
    }
}

struct FakeRx {
    inbound: mpsc::UnboundedReceiver<WatchResult<String>>,
}

#[async_trait]
impl TransportRx for FakeRx {
    async fn recv(&mut self) -> Option<WatchResult<String>> {
        self.inbound.recv().await
    }
}

/// Channel settings with short backoff so retry tests run quickly.
pub fn fast_settings(max_attempts: u32) -> ChannelSettings {
    ChannelSettings {
        endpoint: "ws://fake.invalid/live".to_string(),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(40),
            max_attempts,
        },
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_millis(500),
        ..ChannelSettings::default()
    }
}

/// Wait up to five seconds for `rx` to satisfy `pred`.
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("state not reached in time")
        .expect("sender dropped")
        .clone()
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
