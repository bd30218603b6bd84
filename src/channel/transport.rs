//! Transport seam between the session channel and the network.
//!
//! A [`Connector`] opens one duplex connection and hands back its two
//! halves. The channel owns the halves for the lifetime of that connection
//! and drives them from separate tasks, so neither direction blocks the
//! other.

use std::fmt;

use async_trait::async_trait;

use crate::error::WatchResult;

/// Credentials kept by the channel for re-authentication on reconnect.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// Outgoing half of a connection.
#[async_trait]
pub trait TransportTx: Send {
    /// Write one text message. Resolves once the bytes are handed to the
    /// network.
    async fn send(&mut self, text: String) -> WatchResult<()>;

    /// Best-effort graceful close.
    async fn close(&mut self) -> WatchResult<()>;
}

/// Incoming half of a connection.
#[async_trait]
pub trait TransportRx: Send {
    /// Next text message. `None` when the remote ended the stream cleanly.
    async fn recv(&mut self) -> Option<WatchResult<String>>;
}

/// Both halves of one open connection.
pub type Transport = (Box<dyn TransportTx>, Box<dyn TransportRx>);

/// Opens connections to the remote endpoint.
///
/// Implementations map credential rejection to `WatchError::Auth` and every
/// other failure to `WatchError::Connect`; the channel retries only the
/// latter.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> WatchResult<Transport>;
}
