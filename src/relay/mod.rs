//! # Relay Module
//!
//! Local outlets for the model's replies and a control surface for whoever
//! launched the watcher:
//!
//! - [`sentences`]: joins streamed fragments into whole replies
//! - [`broadcast`]: WebSocket server re-publishing replies to local clients
//! - [`control`]: HTTP `/health` and `/shutdown` endpoints
//!
//! All three plug into the pipeline as [`ResponseObserver`](crate::sink::ResponseObserver)s
//! or sit beside it; none of them can stall the receive loop.

pub mod broadcast;
pub mod control;
pub mod sentences;

pub use broadcast::BroadcastServer;
pub use control::ControlServer;
pub use sentences::{SentenceBuffer, SentenceObserver};
