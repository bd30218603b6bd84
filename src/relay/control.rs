//! HTTP control endpoints for a launcher that supervises the watcher.
//!
//! | Route | Reply |
//! |-------|-------|
//! | `GET /health` | `{"status":"ok","service":"region-watch","port":N}` |
//! | `POST /shutdown` | `{"status":"shutting_down"}`, then fires [`ControlServer::shutdown_requested`] |
//! | anything else | 404 `{"error":"not found"}` |

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{WatchError, WatchResult};

/// Name reported by `/health`.
pub const SERVICE_NAME: &str = "region-watch";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct ControlState {
    port: u16,
    requested: CancellationToken,
}

async fn health(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({ "status": "ok", "service": SERVICE_NAME, "port": state.port }))
}

async fn shutdown(State(state): State<ControlState>) -> Json<Value> {
    info!("shutdown requested over HTTP");
    state.requested.cancel();
    Json(json!({ "status": "shutting_down" }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .fallback(not_found)
        .with_state(state)
}

/// Serves the control routes until [`ControlServer::close`].
pub struct ControlServer {
    local_addr: SocketAddr,
    requested: CancellationToken,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
    /// Bind `addr` and start serving. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> WatchResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            WatchError::io("binding control server", e)
                .with_context(addr.to_string())
                .with_recovery_suggestion("pick another address in [control].addr")
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WatchError::io("binding control server", e))?;

        let requested = CancellationToken::new();
        let stop = CancellationToken::new();
        let app = router(ControlState {
            port: local_addr.port(),
            requested: requested.clone(),
        });
        let graceful = stop.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!("control server stopped: {}", e);
            }
        });
        info!(%local_addr, "control server listening (/health, /shutdown)");

        Ok(Self {
            local_addr,
            requested,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Completes once a client has posted to `/shutdown`.
    pub async fn shutdown_requested(&self) {
        self.requested.cancelled().await
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Stop serving. Idempotent.
    pub async fn close(&self) {
        self.stop.cancel();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
            info!(addr = %self.local_addr, "control server stopped");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
