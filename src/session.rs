//! # Watch Session Orchestration
//!
//! [`Orchestrator`] ties the pipeline together for one region-watch session
//! at a time:
//!
//! ```text
//! start(config) -> validate -> SessionChannel::connect -> PacedScheduler::start
//!                                        |
//!   tick: capture (blocking) -> encode (blocking) -> channel.send -> delivery
//! ```
//!
//! Responses flow separately, from the channel's reader task into the shared
//! [`ResponseSink`].
//!
//! ## States
//!
//! `Idle -> Connecting -> Streaming -> Stopping -> Idle`, with `Failed(reason)`
//! reachable from `Connecting` and `Streaming`. A monitor task mirrors the
//! channel: a reconnect shows as `Connecting`, recovery as `Streaming`, a
//! channel fault stops the scheduler and lands in `Failed`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::{RegionCapturer, default_capturer};
use crate::channel::{
    ChannelState, Connector, Credentials, GeminiLiveProtocol, SessionChannel, WebSocketConnector,
    WireProtocol,
};
use crate::config::{ChannelSettings, EncoderSettings, Region, SessionConfig};
use crate::error::{CaptureFailure, WatchError, WatchResult, classify};
use crate::processing::{EncodedPayload, FrameEncoder, QualityHint};
use crate::scheduler::{PacedScheduler, TickHandler};
use crate::sink::{ResponseObserver, ResponseSink};

/// Lifecycle of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Stopping,
    Failed(String),
}

impl SessionState {
    /// States from which `start` is accepted.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Capture cycle counters, cumulative since the orchestrator was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Ticks that began a capture.
    pub attempted: u64,
    pub captured: u64,
    /// Frames the channel reported as written.
    pub sent: u64,
    pub capture_failures: u64,
    pub encode_failures: u64,
    pub dropped_sends: u64,
    /// Tick boundaries skipped because the previous cycle was still busy.
    pub skipped_ticks: u64,
}

#[derive(Debug, Default)]
struct CycleCounters {
    attempted: AtomicU64,
    captured: AtomicU64,
    sent: AtomicU64,
    capture_failures: AtomicU64,
    encode_failures: AtomicU64,
    dropped_sends: AtomicU64,
    retired_skips: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Cleared when the tick that owns it is dropped, so blocking work queued by
/// an aborted tick does not touch the screen after `stop` returns.
struct TickGuard(Arc<AtomicBool>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One tick of the pipeline: capture, encode, send, await the write.
struct CaptureCycle {
    capturer: Arc<dyn RegionCapturer>,
    encoder: Arc<FrameEncoder>,
    channel: Arc<SessionChannel>,
    region: Region,
    prompt: Arc<str>,
    hint: QualityHint,
    counters: Arc<CycleCounters>,
}

#[async_trait]
impl TickHandler for CaptureCycle {
    async fn on_tick(&self, tick: u64) {
        bump(&self.counters.attempted);

        let capturer = self.capturer.clone();
        let encoder = self.encoder.clone();
        let counters = self.counters.clone();
        let region = self.region;
        let hint = self.hint;
        let live = Arc::new(AtomicBool::new(true));
        let _guard = TickGuard(live.clone());
        let prepared = tokio::task::spawn_blocking(move || -> WatchResult<EncodedPayload> {
            if !live.load(Ordering::SeqCst) {
                return Err(WatchError::cancelled("capture"));
            }
            let frame = capturer.capture(&region)?;
            bump(&counters.captured);
            encoder.encode(frame, hint, tick)
        })
        .await;

        let payload = match prepared {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                match &e {
                    WatchError::Encode { .. } => bump(&self.counters.encode_failures),
                    _ => bump(&self.counters.capture_failures),
                }
                if is_display_failure(&e) {
                    error!(tick, "frame skipped: {}", e);
                } else {
                    warn!(tick, "frame skipped: {}", e);
                }
                return;
            }
            Err(join) => {
                bump(&self.counters.capture_failures);
                error!(tick, "capture task failed: {}", join);
                return;
            }
        };

        debug!(
            tick,
            bytes = payload.bytes.len(),
            width = payload.width,
            height = payload.height,
            quality = payload.quality,
            "frame encoded"
        );

        let delivery = match self.channel.send(payload, &self.prompt) {
            Ok(delivery) => delivery,
            Err(e) => {
                bump(&self.counters.dropped_sends);
                warn!(tick, "{}", e);
                return;
            }
        };
        match delivery.await {
            Ok(()) => bump(&self.counters.sent),
            Err(e) => {
                bump(&self.counters.dropped_sends);
                warn!(tick, "{}", e);
            }
        }
    }
}

/// Resources of the session that currently owns the orchestrator.
struct Active {
    generation: u64,
    channel: Arc<SessionChannel>,
    scheduler: Option<Arc<PacedScheduler>>,
    monitor: Option<JoinHandle<()>>,
}

impl Active {
    /// Stop the scheduler, then close the channel.
    async fn shut_down(self, counters: &CycleCounters) {
        if let Some(monitor) = &self.monitor {
            monitor.abort();
        }
        if let Some(scheduler) = self.scheduler {
            scheduler.stop().await;
            counters
                .retired_skips
                .fetch_add(scheduler.skipped(), Ordering::Relaxed);
        }
        self.channel.close().await;
    }
}

struct Shared {
    state: watch::Sender<SessionState>,
    sink: Arc<ResponseSink>,
    active: Mutex<Option<Active>>,
    counters: Arc<CycleCounters>,
}

impl Shared {
    fn active(&self) -> std::sync::MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn status(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Set the state and tell observers, if it changed.
    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            info!(state = %next, "session state changed");
            self.sink.notify_status(&next);
        }
    }

    /// Move `from` to `to`, but only while `generation` still owns the session.
    ///
    /// Holds the `active` lock across the change so a concurrent `fail` or
    /// `stop` cannot retire the generation between the check and the write.
    fn transition(&self, generation: u64, from: SessionState, to: SessionState) {
        let active = self.active();
        if active.as_ref().is_some_and(|a| a.generation == generation) && self.status() == from {
            self.set_state(to);
        }
    }

    /// Retire `generation` after a channel fault.
    async fn fail(&self, generation: u64, reason: String) {
        let taken = {
            let mut active = self.active();
            match active.as_ref() {
                Some(a) if a.generation == generation => active.take(),
                _ => None,
            }
        };
        let Some(mut taken) = taken else {
            return;
        };
        // Running inside the monitor; do not abort ourselves.
        taken.monitor = None;
        error!(%reason, "session failed");
        taken.shut_down(&self.counters).await;

        if self.active().is_none() && self.status() != SessionState::Idle {
            self.set_state(SessionState::Failed(reason));
        }
    }
}

/// Mirror channel state into the session state until the channel faults.
async fn monitor(shared: Arc<Shared>, generation: u64, mut channel: watch::Receiver<ChannelState>) {
    loop {
        let state = channel.borrow_and_update().clone();
        match state {
            ChannelState::Faulted(reason) => {
                shared.fail(generation, reason.to_string()).await;
                return;
            }
            ChannelState::Connecting => {
                shared.transition(generation, SessionState::Streaming, SessionState::Connecting)
            }
            ChannelState::Streaming => {
                shared.transition(generation, SessionState::Connecting, SessionState::Streaming)
            }
            _ => {}
        }
        if channel.changed().await.is_err() {
            return;
        }
    }
}

/// Runs region-watch sessions: one at a time, start to stop.
pub struct Orchestrator {
    capturer: Arc<dyn RegionCapturer>,
    connector: Arc<dyn Connector>,
    protocol: Arc<dyn WireProtocol>,
    encoder: Arc<FrameEncoder>,
    channel_settings: ChannelSettings,
    shared: Arc<Shared>,
    generation: AtomicU64,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Validate `config`, open the channel and start capturing.
    ///
    /// Returns once the session is `Streaming`. Validation errors leave the
    /// state untouched and never reach the network. A connection failure
    /// leaves `Failed(reason)` and is returned. If `stop` runs while the
    /// channel is connecting, returns `Cancelled`.
    pub async fn start(&self, config: SessionConfig) -> WatchResult<()> {
        config.validate()?;
        self.encoder.settings().validate()?;
        self.channel_settings.validate()?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Arc::new(SessionChannel::new(
            self.connector.clone(),
            self.protocol.clone(),
            self.shared.sink.clone(),
            self.channel_settings.clone(),
        ));
        {
            let mut active = self.shared.active();
            let state = self.shared.status();
            if active.is_some() || !state.can_start() {
                return Err(WatchError::already_running(state.to_string()));
            }
            *active = Some(Active {
                generation,
                channel: channel.clone(),
                scheduler: None,
                monitor: None,
            });
        }
        self.shared.set_state(SessionState::Connecting);
        info!(
            region = %config.region,
            frame_rate_hz = config.frame_rate_hz,
            "starting watch session"
        );

        if let Err(e) = channel.connect(Credentials::new(config.api_key.clone())).await {
            let owned = {
                let mut active = self.shared.active();
                match active.as_ref() {
                    Some(a) if a.generation == generation => active.take().is_some(),
                    _ => false,
                }
            };
            if !owned {
                return Err(WatchError::cancelled("start"));
            }
            if classify::is_fatal(&e) {
                error!("session start failed: {}", e);
            } else {
                warn!("session start failed: {}", e);
            }
            channel.close().await;
            self.shared.set_state(SessionState::Failed(e.to_string()));
            return Err(e);
        }

        let handler = Arc::new(CaptureCycle {
            capturer: self.capturer.clone(),
            encoder: self.encoder.clone(),
            channel: channel.clone(),
            region: config.region,
            prompt: config.prompt.clone(),
            hint: QualityHint::for_rate(self.encoder.settings(), config.frame_rate_hz),
            counters: self.shared.counters.clone(),
        });
        let scheduler = Arc::new(PacedScheduler::new(config.frame_rate_hz, handler));

        let started = {
            let mut active = self.shared.active();
            match active.as_mut() {
                Some(a) if a.generation == generation => {
                    scheduler.start()?;
                    a.scheduler = Some(scheduler);
                    a.monitor = Some(tokio::spawn(monitor(
                        self.shared.clone(),
                        generation,
                        channel.subscribe(),
                    )));
                    true
                }
                _ => false,
            }
        };
        if !started {
            channel.close().await;
            return Err(WatchError::cancelled("start"));
        }
        self.shared
            .transition(generation, SessionState::Connecting, SessionState::Streaming);
        Ok(())
    }

    /// Stop capturing and close the channel. Safe in any state; ends `Idle`.
    pub async fn stop(&self) {
        let active = self.shared.active().take();
        let Some(active) = active else {
            self.shared.set_state(SessionState::Idle);
            return;
        };
        self.shared.set_state(SessionState::Stopping);
        active.shut_down(&self.shared.counters).await;
        self.shared.set_state(SessionState::Idle);
        info!("watch session stopped");
    }

    pub fn status(&self) -> SessionState {
        self.shared.status()
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.shared.counters;
        let live_skips = self
            .shared
            .active()
            .as_ref()
            .and_then(|a| a.scheduler.as_ref().map(|s| s.skipped()))
            .unwrap_or(0);
        SessionStats {
            attempted: c.attempted.load(Ordering::Relaxed),
            captured: c.captured.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            capture_failures: c.capture_failures.load(Ordering::Relaxed),
            encode_failures: c.encode_failures.load(Ordering::Relaxed),
            dropped_sends: c.dropped_sends.load(Ordering::Relaxed),
            skipped_ticks: c.retired_skips.load(Ordering::Relaxed) + live_skips,
        }
    }

    /// Response log shared with the channel.
    pub fn sink(&self) -> &Arc<ResponseSink> {
        &self.shared.sink
    }

    pub fn add_observer(&self, observer: Arc<dyn ResponseObserver>) {
        self.shared.sink.add_observer(observer);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(active) = self.shared.active().take() {
            if let Some(monitor) = active.monitor {
                monitor.abort();
            }
        }
    }
}

/// Fluent construction of an [`Orchestrator`]. Anything not supplied falls
/// back to the platform capturer, the WebSocket transport and the Gemini
/// Live framing.
#[derive(Default)]
pub struct OrchestratorBuilder {
    capturer: Option<Arc<dyn RegionCapturer>>,
    connector: Option<Arc<dyn Connector>>,
    protocol: Option<Arc<dyn WireProtocol>>,
    observers: Vec<Arc<dyn ResponseObserver>>,
    encoder_settings: EncoderSettings,
    channel_settings: ChannelSettings,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capturer(mut self, capturer: Arc<dyn RegionCapturer>) -> Self {
        self.capturer = Some(capturer);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn WireProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_encoder_settings(mut self, settings: EncoderSettings) -> Self {
        self.encoder_settings = settings;
        self
    }

    pub fn with_channel_settings(mut self, settings: ChannelSettings) -> Self {
        self.channel_settings = settings;
        self
    }

    pub fn build(self) -> WatchResult<Orchestrator> {
        self.encoder_settings.validate()?;
        self.channel_settings.validate()?;

        let capturer = self
            .capturer
            .unwrap_or_else(|| Arc::from(default_capturer()));
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WebSocketConnector::new(self.channel_settings.endpoint.clone()))
        });
        let protocol = self
            .protocol
            .unwrap_or_else(|| Arc::new(GeminiLiveProtocol::from_settings(&self.channel_settings)));

        let sink = Arc::new(ResponseSink::new());
        for observer in self.observers {
            sink.add_observer(observer);
        }
        let (state, _) = watch::channel(SessionState::Idle);

        Ok(Orchestrator {
            capturer,
            connector,
            protocol,
            encoder: Arc::new(FrameEncoder::new(self.encoder_settings)),
            channel_settings: self.channel_settings,
            shared: Arc::new(Shared {
                state,
                sink,
                active: Mutex::new(None),
                counters: Arc::new(CycleCounters::default()),
            }),
            generation: AtomicU64::new(0),
        })
    }
}

/// Capture failures that mean the session cannot make progress at all.
pub fn is_display_failure(error: &WatchError) -> bool {
    matches!(
        error,
        WatchError::Capture {
            kind: CaptureFailure::DisplayUnavailable | CaptureFailure::PermissionDenied,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_start_gate() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(
            SessionState::Failed("auth rejected".into()).to_string(),
            "failed: auth rejected"
        );
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Failed(String::new()).can_start());
        assert!(!SessionState::Streaming.can_start());
        assert!(!SessionState::Connecting.can_start());
        assert!(!SessionState::Stopping.can_start());
    }

    #[test]
    fn test_display_failure_classification() {
        let err = WatchError::capture(CaptureFailure::PermissionDenied, "no grant");
        assert!(is_display_failure(&err));
        let err = WatchError::capture(CaptureFailure::OffScreen, "outside");
        assert!(!is_display_failure(&err));
    }

    #[test]
    fn test_transition_ignores_retired_generation() {
        let (state, _) = watch::channel(SessionState::Connecting);
        let shared = Shared {
            state,
            sink: Arc::new(ResponseSink::new()),
            active: Mutex::new(None),
            counters: Arc::new(CycleCounters::default()),
        };
        shared.transition(1, SessionState::Connecting, SessionState::Streaming);
        assert_eq!(shared.status(), SessionState::Connecting);

        shared.set_state(SessionState::Failed("connection lost".into()));
        shared.transition(1, SessionState::Connecting, SessionState::Streaming);
        assert!(matches!(shared.status(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let orchestrator = Orchestrator::builder().build().unwrap();
        orchestrator.stop().await;
        orchestrator.stop().await;
        assert_eq!(orchestrator.status(), SessionState::Idle);
        assert_eq!(orchestrator.stats(), SessionStats::default());
    }
}
