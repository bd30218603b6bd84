//! Local WebSocket broadcast of finished replies.
//!
//! Clients connect to `ws://<addr>/` and receive one JSON text message per
//! reply:
//!
//! ```json
//! {"type":"text_update","timestamp":"2026-10-17T14:03:11.204+02:00","content":"A build failed."}
//! ```
//!
//! Clients only listen; anything they send is ignored. A client that falls
//! more than [`CLIENT_BACKLOG`] messages behind loses the oldest ones.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{WatchError, WatchResult};
use crate::sink::{ResponseFragment, ResponseObserver};

/// Messages buffered per client before the oldest are dropped.
pub const CLIENT_BACKLOG: usize = 64;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct TextUpdate<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    content: &'a str,
}

impl<'a> TextUpdate<'a> {
    fn from_fragment(fragment: &'a ResponseFragment) -> Self {
        Self {
            kind: "text_update",
            timestamp: fragment.received_at.to_rfc3339(),
            content: &fragment.text,
        }
    }
}

/// WebSocket server that re-publishes replies to every connected client.
pub struct BroadcastServer {
    local_addr: SocketAddr,
    updates: broadcast::Sender<Arc<str>>,
    clients: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastServer {
    /// Bind `addr` and start accepting clients. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> WatchResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            WatchError::io("binding broadcast server", e)
                .with_context(addr.to_string())
                .with_recovery_suggestion("pick another address in [broadcast].addr")
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WatchError::io("binding broadcast server", e))?;

        let (updates, _) = broadcast::channel(CLIENT_BACKLOG);
        let clients = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            updates.clone(),
            clients.clone(),
            shutdown.clone(),
        ));
        info!(%local_addr, "reply broadcast listening");

        Ok(Self {
            local_addr,
            updates,
            clients,
            shutdown,
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Clients that completed the WebSocket handshake and are still open.
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Queue `fragment` for every client. Returns how many will receive it.
    pub fn publish(&self, fragment: &ResponseFragment) -> WatchResult<usize> {
        let text = serde_json::to_string(&TextUpdate::from_fragment(fragment))?;
        // No subscribers is not an error; the reply just has no audience.
        Ok(self.updates.send(Arc::from(text)).unwrap_or(0))
    }

    /// Close every client and stop accepting. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let accept = self.accept.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut accept) = accept {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut accept).await.is_err() {
                accept.abort();
            }
            info!(addr = %self.local_addr, "reply broadcast stopped");
        }
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ResponseObserver for BroadcastServer {
    fn on_fragment(&self, fragment: &ResponseFragment) -> anyhow::Result<()> {
        let receivers = self.publish(fragment)?;
        debug!(receivers, "reply broadcast");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    updates: broadcast::Sender<Arc<str>>,
    clients: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                // Subscribe before the handshake so nothing published while
                // it runs is missed.
                let rx = updates.subscribe();
                tokio::spawn(serve_client(
                    stream,
                    peer,
                    rx,
                    clients.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(e) => warn!("broadcast accept failed: {}", e),
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut updates: broadcast::Receiver<Arc<str>>,
    clients: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, "broadcast handshake failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, "broadcast handshake timed out");
            return;
        }
    };
    let connected = clients.fetch_add(1, Ordering::SeqCst) + 1;
    info!(%peer, clients = connected, "broadcast client connected");

    let (mut tx, mut rx) = ws.split();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
            update = updates.recv() => match update {
                Ok(text) => {
                    if let Err(e) = tx.send(Message::Text(text.to_string())).await {
                        debug!(%peer, "broadcast send failed: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "broadcast client lagging, oldest replies dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let remaining = clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    info!(%peer, clients = remaining, "broadcast client disconnected");
}
