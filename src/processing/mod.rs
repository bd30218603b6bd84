//! # Frame Processing
//!
//! Turns raw captured frames into compact payloads for the session channel.

pub mod encoder;

pub use encoder::{EncodedPayload, FrameEncoder, QualityHint};
