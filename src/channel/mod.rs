//! # Session Channel Module
//!
//! Duplex session with the remote model: connection supervision
//! ([`channel`]), the transport seam ([`transport`]), message framing
//! ([`protocol`]) and the shipped WebSocket transport ([`websocket`]).

pub mod channel;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use channel::{ChannelState, ChannelStats, Delivery, FaultReason, SessionChannel};
pub use protocol::{GeminiLiveProtocol, WireProtocol};
pub use transport::{Connector, Credentials, Transport, TransportRx, TransportTx};
pub use websocket::WebSocketConnector;
