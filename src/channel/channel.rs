//! # Session Channel
//!
//! Long-lived duplex session with the remote model.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Authenticated -> Streaming -> Closing -> Disconnected
//!                      |              |              |
//!                      +--------------+--------------+--> Faulted(reason)
//! ```
//!
//! ## Tasks
//!
//! Each open connection gets two tasks under a child of the session's
//! `CancellationToken`:
//!
//! - **writer**: drains a depth-1 `mpsc` queue and writes frames in order
//! - **reader**: decodes incoming messages and appends text to the sink
//!
//! A supervisor task watches them. When either ends with an error it drops
//! the queued frame, reconnects with backoff and starts a fresh pair. Auth
//! rejection and an exhausted retry budget end in `Faulted`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::WireProtocol;
use super::transport::{Connector, Credentials, TransportRx, TransportTx};
use crate::config::ChannelSettings;
use crate::error::{Retryable, WatchError, WatchResult};
use crate::processing::EncodedPayload;
use crate::sink::{ResponseFragment, ResponseSink};

/// Why a channel gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultReason {
    /// The remote rejected the credentials.
    AuthRejected(String),
    /// Every attempt in the reconnect budget failed.
    ConnectionLost { attempts: u32, last_error: String },
    /// The remote refused the session setup for a reason other than
    /// credentials, such as an unknown model.
    SetupRejected(String),
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::AuthRejected(reason) => write!(f, "authentication rejected: {}", reason),
            FaultReason::ConnectionLost {
                attempts,
                last_error,
            } => write!(
                f,
                "connection lost after {} attempt(s): {}",
                attempts, last_error
            ),
            FaultReason::SetupRejected(reason) => write!(f, "setup rejected: {}", reason),
        }
    }
}

impl FaultReason {
    fn from_error(error: &WatchError) -> Self {
        match error {
            WatchError::Auth { reason, .. } => FaultReason::AuthRejected(reason.clone()),
            WatchError::ConnectionLost {
                attempts,
                last_error,
                ..
            } => FaultReason::ConnectionLost {
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            other => FaultReason::SetupRejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Closing,
    Faulted(FaultReason),
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => f.write_str("disconnected"),
            ChannelState::Connecting => f.write_str("connecting"),
            ChannelState::Authenticated => f.write_str("authenticated"),
            ChannelState::Streaming => f.write_str("streaming"),
            ChannelState::Closing => f.write_str("closing"),
            ChannelState::Faulted(reason) => write!(f, "faulted ({})", reason),
        }
    }
}

/// Resolves when the frame's network write completes or fails.
///
/// Dropping a `Delivery` does not cancel the write.
#[derive(Debug)]
pub struct Delivery {
    sequence: u64,
    rx: oneshot::Receiver<WatchResult<()>>,
}

impl Delivery {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Future for Delivery {
    type Output = WatchResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sequence = self.sequence;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WatchError::send_dropped(
                Some(sequence),
                "link closed before the write",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Outgoing {
    text: String,
    sequence: u64,
    ack: oneshot::Sender<WatchResult<()>>,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_written: u64,
    pub fragments_received: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    frames_written: AtomicU64,
    fragments_received: AtomicU64,
    reconnects: AtomicU64,
}

struct Control {
    session: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    protocol: Arc<dyn WireProtocol>,
    sink: Arc<ResponseSink>,
    settings: ChannelSettings,
    state: watch::Sender<ChannelState>,
    queue: Mutex<Option<mpsc::Sender<Outgoing>>>,
    control: Mutex<Option<Control>>,
    counters: Counters,
}

impl Inner {
    /// Publish `next` unless the session was cancelled; `close` owns the
    /// state from that point.
    fn publish(&self, session: &CancellationToken, next: ChannelState) {
        self.state.send_if_modified(|state| {
            if session.is_cancelled() || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "channel state");
            *state = next;
            true
        });
    }

    fn set_queue(&self, sender: Option<mpsc::Sender<Outgoing>>) {
        *self.queue.lock().unwrap_or_else(|p| p.into_inner()) = sender;
    }

    fn queue(&self) -> Option<mpsc::Sender<Outgoing>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn control(&self) -> std::sync::MutexGuard<'_, Option<Control>> {
        self.control.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Duplex session with the remote model.
pub struct SessionChannel {
    inner: Arc<Inner>,
}

impl SessionChannel {
    pub fn new(
        connector: Arc<dyn Connector>,
        protocol: Arc<dyn WireProtocol>,
        sink: Arc<ResponseSink>,
        settings: ChannelSettings,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                protocol,
                sink,
                settings,
                state,
                queue: Mutex::new(None),
                control: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> ChannelStats {
        let c = &self.inner.counters;
        ChannelStats {
            frames_written: c.frames_written.load(Ordering::Relaxed),
            fragments_received: c.fragments_received.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Open the session and return once it is `Streaming`.
    ///
    /// Transport failures are retried under the reconnect policy; credential
    /// rejection is not. When `close` runs first, returns `Cancelled`.
    /// A `Faulted` channel accepts a new `connect` without `close`; a live one
    /// answers `AlreadyRunning`.
    pub async fn connect(&self, credentials: Credentials) -> WatchResult<()> {
        let session = CancellationToken::new();
        {
            let mut control = self.inner.control();
            if let Some(previous) = control.as_ref() {
                let state = self.state();
                if !matches!(state, ChannelState::Faulted(_)) {
                    return Err(WatchError::already_running(state.to_string()));
                }
                // The supervisor gave up; its session is over.
                previous.session.cancel();
            }
            *control = Some(Control {
                session: session.clone(),
                supervisor: None,
            });
        }

        let link = match establish(&self.inner, &credentials, &session).await {
            Ok(link) => link,
            Err(e) => {
                if !matches!(e, WatchError::Cancelled { .. }) {
                    error!("session connect failed: {}", e);
                    self.inner
                        .publish(&session, ChannelState::Faulted(FaultReason::from_error(&e)));
                    let mut control = self.inner.control();
                    if !session.is_cancelled() {
                        *control = None;
                    }
                }
                return Err(e);
            }
        };

        let tasks = start_link(&self.inner, link, &session);
        let supervisor = tokio::spawn(supervise(
            self.inner.clone(),
            credentials,
            session.clone(),
            tasks,
        ));

        let mut control = self.inner.control();
        match control.as_mut() {
            Some(c) if !session.is_cancelled() => {
                c.supervisor = Some(supervisor);
                info!("session channel streaming");
                Ok(())
            }
            _ => {
                session.cancel();
                Err(WatchError::cancelled("connect"))
            }
        }
    }

    /// Queue one frame for writing. Never waits for the network.
    pub fn send(&self, payload: EncodedPayload, prompt: &str) -> WatchResult<Delivery> {
        let sequence = payload.sequence;
        let state = self.state();
        if state != ChannelState::Streaming {
            return Err(WatchError::send_dropped(
                Some(sequence),
                format!("channel is {}", state),
            ));
        }
        let Some(queue) = self.inner.queue() else {
            return Err(WatchError::send_dropped(Some(sequence), "no open link"));
        };

        let text = self.inner.protocol.frame_message(&payload, prompt)?;
        drop(payload);
        let (ack, rx) = oneshot::channel();
        queue
            .try_send(Outgoing {
                text,
                sequence,
                ack,
            })
            .map_err(|e| {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "previous frame still queued",
                    mpsc::error::TrySendError::Closed(_) => "link closed",
                };
                WatchError::send_dropped(Some(sequence), reason)
            })?;
        Ok(Delivery { sequence, rx })
    }

    /// Tear the session down. Safe to call in any state, any number of times.
    pub async fn close(&self) {
        let control = self.inner.control().take();
        let Some(control) = control else {
            self.inner.state.send_replace(ChannelState::Disconnected);
            return;
        };

        control.session.cancel();
        self.inner.state.send_replace(ChannelState::Closing);
        self.inner.set_queue(None);

        if let Some(mut supervisor) = control.supervisor {
            let limit = self.inner.settings.close_timeout;
            if tokio::time::timeout(limit, &mut supervisor).await.is_err() {
                warn!(timeout_ms = limit.as_millis() as u64, "supervisor did not stop in time, aborting");
                supervisor.abort();
            }
        }
        self.inner.state.send_replace(ChannelState::Disconnected);
        info!("session channel closed");
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Some(control) = self.inner.control().take() {
            control.session.cancel();
            if let Some(supervisor) = control.supervisor {
                supervisor.abort();
            }
        }
    }
}

/// An authenticated connection that has not started its tasks yet.
struct Link {
    tx: Box<dyn TransportTx>,
    rx: Box<dyn TransportRx>,
}

/// Open one authenticated connection, retrying transport failures.
async fn establish(
    inner: &Arc<Inner>,
    credentials: &Credentials,
    session: &CancellationToken,
) -> WatchResult<Link> {
    let policy = &inner.settings.reconnect;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        inner.publish(session, ChannelState::Connecting);

        let last_error = match open_once(inner, credentials, session).await {
            Ok(link) => {
                inner.publish(session, ChannelState::Authenticated);
                return Ok(link);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };
        warn!(attempt, max_attempts = policy.max_attempts, "connect attempt failed: {}", last_error);

        if attempt >= policy.max_attempts {
            return Err(WatchError::connection_lost(attempt, last_error.to_string()));
        }
        let delay = policy.delay_after(attempt);
        tokio::select! {
            biased;
            _ = session.cancelled() => return Err(WatchError::cancelled("connect")),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run `fut` under `limit`, giving up early if `session` is cancelled.
async fn bounded<T>(
    session: &CancellationToken,
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = WatchResult<T>>,
) -> WatchResult<T> {
    tokio::select! {
        biased;
        _ = session.cancelled() => Err(WatchError::cancelled(operation)),
        r = tokio::time::timeout(limit, fut) => match r {
            Ok(result) => result,
            Err(_) => Err(WatchError::timeout(operation, limit.as_millis() as u64)),
        },
    }
}

/// One connection attempt: transport, setup message, setup acknowledgement.
async fn open_once(
    inner: &Arc<Inner>,
    credentials: &Credentials,
    session: &CancellationToken,
) -> WatchResult<Link> {
    let settings = &inner.settings;
    let (mut tx, mut rx) = bounded(
        session,
        "connect",
        settings.connect_timeout,
        inner.connector.connect(credentials),
    )
    .await?;

    let setup = handshake(inner, tx.as_mut(), rx.as_mut());
    let result = bounded(session, "handshake", settings.handshake_timeout, setup).await;
    match result {
        Ok(()) => Ok(Link { tx, rx }),
        Err(e) => {
            let _ = tokio::time::timeout(settings.close_timeout, tx.close()).await;
            Err(e)
        }
    }
}

/// Send the setup message and wait for its acknowledgement.
async fn handshake(
    inner: &Inner,
    tx: &mut dyn TransportTx,
    rx: &mut dyn TransportRx,
) -> WatchResult<()> {
    tx.send(inner.protocol.setup_message()?).await?;
    loop {
        match rx.recv().await {
            Some(Ok(reply)) => {
                if inner.protocol.is_setup_ack(&reply)? {
                    return Ok(());
                }
                debug!("ignoring message before setup acknowledgement");
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(WatchError::connect(
                    &inner.settings.endpoint,
                    "closed during setup handshake",
                ));
            }
        }
    }
}

/// Writer and reader of one connection.
struct LinkTasks {
    token: CancellationToken,
    writer: JoinHandle<Option<WatchError>>,
    reader: JoinHandle<Option<WatchError>>,
}

impl LinkTasks {
    /// First error reported by either task.
    async fn failure(&mut self) -> WatchError {
        let joined = tokio::select! {
            r = &mut self.writer => r,
            r = &mut self.reader => r,
        };
        match joined {
            Ok(Some(e)) => e,
            Ok(None) => WatchError::connect("link", "link task stopped"),
            Err(e) => WatchError::connect("link", format!("link task failed: {}", e)),
        }
    }

    /// Cancel both tasks and wait for them, aborting stragglers.
    async fn shutdown(mut self, limit: Duration) {
        self.token.cancel();
        for handle in [&mut self.writer, &mut self.reader] {
            if handle.is_finished() {
                continue;
            }
            if tokio::time::timeout(limit, &mut *handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

fn start_link(inner: &Arc<Inner>, link: Link, session: &CancellationToken) -> LinkTasks {
    let token = session.child_token();
    let (queue_tx, queue_rx) = mpsc::channel(1);
    let writer = tokio::spawn(write_loop(inner.clone(), link.tx, queue_rx, token.clone()));
    let reader = tokio::spawn(read_loop(inner.clone(), link.rx, token.clone()));
    inner.set_queue(Some(queue_tx));
    inner.publish(session, ChannelState::Streaming);
    LinkTasks {
        token,
        writer,
        reader,
    }
}

async fn write_loop(
    inner: Arc<Inner>,
    mut tx: Box<dyn TransportTx>,
    mut queue: mpsc::Receiver<Outgoing>,
    token: CancellationToken,
) -> Option<WatchError> {
    let send_timeout = inner.settings.send_timeout;
    let mut failure = None;

    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = queue.recv() => item,
        };
        let Some(item) = item else { break };

        let written = bounded(&token, "send", send_timeout, tx.send(item.text)).await;
        match written {
            Ok(()) => {
                inner.counters.frames_written.fetch_add(1, Ordering::Relaxed);
                debug!(sequence = item.sequence, "frame written");
                let _ = item.ack.send(Ok(()));
            }
            Err(e) => {
                let _ = item.ack.send(Err(WatchError::send_dropped(
                    Some(item.sequence),
                    e.to_string(),
                )));
                if !matches!(e, WatchError::Cancelled { .. }) {
                    failure = Some(e);
                }
                break;
            }
        }
    }

    queue.close();
    while let Ok(stale) = queue.try_recv() {
        let _ = stale.ack.send(Err(WatchError::send_dropped(
            Some(stale.sequence),
            "dropped on reconnect",
        )));
    }
    if failure.is_none() {
        let _ = tokio::time::timeout(inner.settings.close_timeout, tx.close()).await;
    }
    failure
}

async fn read_loop(
    inner: Arc<Inner>,
    mut rx: Box<dyn TransportRx>,
    token: CancellationToken,
) -> Option<WatchError> {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            message = rx.recv() => message,
        };
        match message {
            Some(Ok(text)) => match inner.protocol.decode(&text) {
                Ok(parts) => {
                    for part in parts {
                        inner.counters.fragments_received.fetch_add(1, Ordering::Relaxed);
                        inner.sink.append(ResponseFragment::now(part));
                    }
                }
                Err(e @ WatchError::Auth { .. }) => return Some(e),
                Err(e) => warn!("skipping undecodable message: {}", e),
            },
            Some(Err(e)) => return Some(e),
            None => {
                return Some(WatchError::connect(
                    &inner.settings.endpoint,
                    "remote closed the stream",
                ));
            }
        }
    }
}

enum LinkEnd {
    Cancelled,
    Failed(WatchError),
    Rotate,
}

async fn supervise(
    inner: Arc<Inner>,
    credentials: Credentials,
    session: CancellationToken,
    mut tasks: LinkTasks,
) {
    let close_timeout = inner.settings.close_timeout;
    loop {
        let rotate = async {
            match inner.settings.rotate_after {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        let end = tokio::select! {
            biased;
            _ = session.cancelled() => LinkEnd::Cancelled,
            e = tasks.failure() => LinkEnd::Failed(e),
            _ = rotate => LinkEnd::Rotate,
        };

        inner.set_queue(None);
        tasks.shutdown(close_timeout).await;

        match end {
            LinkEnd::Cancelled => return,
            LinkEnd::Failed(e @ WatchError::Auth { .. }) => {
                error!("remote rejected credentials mid-session: {}", e);
                inner.publish(&session, ChannelState::Faulted(FaultReason::from_error(&e)));
                return;
            }
            LinkEnd::Failed(e) => warn!("link failed, reconnecting: {}", e),
            LinkEnd::Rotate => info!("rotating session connection"),
        }
        inner.publish(&session, ChannelState::Connecting);

        match establish(&inner, &credentials, &session).await {
            Ok(link) => {
                inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                tasks = start_link(&inner, link, &session);
                info!("session channel re-established");
            }
            Err(WatchError::Cancelled { .. }) => return,
            Err(e) => {
                error!("giving up on session: {}", e);
                inner.publish(&session, ChannelState::Faulted(FaultReason::from_error(&e)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_reason_from_error() {
        let lost = FaultReason::from_error(&WatchError::connection_lost(3, "refused"));
        assert_eq!(
            lost,
            FaultReason::ConnectionLost {
                attempts: 3,
                last_error: "refused".into()
            }
        );
        assert_eq!(
            FaultReason::from_error(&WatchError::auth("bad key")),
            FaultReason::AuthRejected("bad key".into())
        );
        assert_eq!(
            ChannelState::Faulted(lost).to_string(),
            "faulted (connection lost after 3 attempt(s): refused)"
        );
        assert_eq!(
            FaultReason::from_error(&WatchError::protocol("unknown model")).to_string(),
            "setup rejected: Protocol error: unknown model"
        );
    }

    #[tokio::test]
    async fn test_delivery_resolves_dropped_when_sender_gone() {
        let (ack, rx) = oneshot::channel::<WatchResult<()>>();
        drop(ack);
        let delivery = Delivery { sequence: 9, rx };
        assert!(matches!(
            delivery.await,
            Err(WatchError::SendDropped {
                sequence: Some(9),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bounded_times_out_and_cancels() {
        let token = CancellationToken::new();
        let slow = bounded(&token, "op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, WatchError>(())
        })
        .await;
        assert!(matches!(slow, Err(WatchError::Timeout { .. })));

        token.cancel();
        let cancelled = bounded(&token, "op", Duration::from_secs(5), async {
            std::future::pending::<WatchResult<()>>().await
        })
        .await;
        assert!(matches!(cancelled, Err(WatchError::Cancelled { .. })));
    }
}
