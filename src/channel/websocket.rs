//! WebSocket transport over `tokio-tungstenite` (TLS via native-tls).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use super::transport::{Connector, Credentials, Transport, TransportRx, TransportTx};
use crate::error::{WatchError, WatchResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a `ws://`/`wss://` endpoint, passing the API key as the
/// `key` query parameter.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint with credentials attached. Never log the result.
    fn url_for(&self, credentials: &Credentials) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, credentials.api_key())
    }
}

/// Classify a handshake failure. The error text never includes the URL.
fn map_connect_error(endpoint: &str, error: WsError) -> WatchError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            if matches!(status.as_u16(), 400 | 401 | 403) {
                WatchError::auth(format!("endpoint answered HTTP {}", status))
                    .with_recovery_suggestion("check the API key")
            } else {
                WatchError::connect(endpoint, format!("HTTP {}", status))
            }
        }
        WsError::Url(_) => WatchError::connect(endpoint, "invalid endpoint URL"),
        other => WatchError::connect(endpoint, other.to_string()),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, credentials: &Credentials) -> WatchResult<Transport> {
        debug!(endpoint = %self.endpoint, "opening websocket");
        let (stream, response) = connect_async(self.url_for(credentials))
            .await
            .map_err(|e| map_connect_error(&self.endpoint, e))?;
        info!(status = %response.status(), "websocket connected");

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsTx { sink }),
            Box::new(WsRx {
                stream,
                endpoint: self.endpoint.clone(),
            }),
        ))
    }
}

struct WsTx {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportTx for WsTx {
    async fn send(&mut self, text: String) -> WatchResult<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| WatchError::connect("websocket", e.to_string()).with_operation("send"))
    }

    async fn close(&mut self) -> WatchResult<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(WatchError::connect("websocket", e.to_string()).with_operation("close")),
        }
    }
}

struct WsRx {
    stream: SplitStream<WsStream>,
    endpoint: String,
}

#[async_trait]
impl TransportRx for WsRx {
    async fn recv(&mut self) -> Option<WatchResult<String>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => {
                    return Some(Err(WatchError::connect(&self.endpoint, e.to_string())
                        .with_operation("receive")));
                }
            };
            match message {
                Message::Text(text) => return Some(Ok(text)),
                // The live endpoint sends JSON in binary frames as well.
                Message::Binary(bytes) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        WatchError::protocol(format!("binary frame is not UTF-8: {}", e))
                    }));
                }
                Message::Close(Some(frame)) if frame.code == CloseCode::Policy => {
                    return Some(Err(WatchError::auth(frame.reason.to_string())));
                }
                Message::Close(frame) => {
                    debug!(?frame, "websocket closed by remote");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::{Response, StatusCode};

    fn http_error(status: u16) -> WsError {
        let response = Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .body(None)
            .unwrap();
        WsError::Http(response)
    }

    #[test]
    fn test_url_carries_key() {
        let connector = WebSocketConnector::new("wss://example.test/ws");
        assert_eq!(
            connector.url_for(&Credentials::new("abc")),
            "wss://example.test/ws?key=abc"
        );
        let with_query = WebSocketConnector::new("wss://example.test/ws?alt=json");
        assert_eq!(
            with_query.url_for(&Credentials::new("abc")),
            "wss://example.test/ws?alt=json&key=abc"
        );
    }

    #[test]
    fn test_http_rejections_map_to_auth() {
        for status in [400, 401, 403] {
            let err = map_connect_error("wss://x", http_error(status));
            assert!(matches!(err, WatchError::Auth { .. }), "status {}", status);
        }
        let err = map_connect_error("wss://x", http_error(503));
        assert!(matches!(err, WatchError::Connect { .. }));
    }

    #[test]
    fn test_connect_error_omits_key() {
        let err = map_connect_error("wss://x", WsError::ConnectionClosed);
        assert!(!err.to_string().contains("key="));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // Port 9 on loopback is reliably closed in test environments.
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/ws");
        let err = connector
            .connect(&Credentials::new("k"))
            .await
            .err()
            .expect("connection should fail");
        assert!(matches!(err, WatchError::Connect { .. }));
    }
}
