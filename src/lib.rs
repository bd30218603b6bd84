//! # Region Watch Library
//!
//! Watches a rectangular region of the screen and streams paced JPEG
//! snapshots, each paired with a text prompt, to a live multimodal model over
//! a long-lived duplex session. Streamed text replies are collected in a
//! response log and pushed to observers as they arrive.
//!
//! ## Architecture
//!
//! - `capture`: region capture backends (x11rb on Linux, scrap on Windows/macOS)
//! - `processing`: JPEG encoding with downscaling and a bandwidth budget
//! - `scheduler`: fixed-rate tick source with drop-oldest pacing
//! - `channel`: duplex session with reconnect, transport and wire framing
//! - `sink`: response log and observer fan-out
//! - `session`: the [`Orchestrator`] that runs one session start to stop
//! - `config`: session config, tuning settings and the TOML settings file
//! - `probe`: one-shot API key check over REST
//! - `relay`: sentence assembly, local WebSocket broadcast and HTTP control
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use region_watch::{Orchestrator, Region, ResponseFragment, ResponseObserver, SessionConfig};
//!
//! struct Print;
//!
//! impl ResponseObserver for Print {
//!     fn on_fragment(&self, fragment: &ResponseFragment) -> anyhow::Result<()> {
//!         println!("{}", fragment);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let orchestrator = Orchestrator::builder()
//!     .with_observer(Arc::new(Print))
//!     .build()?;
//! let config = SessionConfig::new(
//!     std::env::var("GEMINI_API_KEY")?,
//!     2,
//!     Region::new(0, 0, 800, 600),
//!     "Describe what changed on screen.",
//! );
//! orchestrator.start(config).await?;
//! tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//! orchestrator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod probe;
pub mod processing;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use capture::{Frame, PixelFormat, RegionCapturer, default_capturer};
pub use channel::{ChannelState, Connector, Credentials, SessionChannel, WireProtocol};
pub use config::{ChannelSettings, EncoderSettings, Region, SessionConfig, WatchSettings};
pub use error::{
    CaptureFailure, ErrorContext, ErrorSeverity, HasRecoverySuggestion, HasSeverity, Retryable,
    WatchError, WatchResult,
};
pub use processing::{EncodedPayload, FrameEncoder};
pub use session::{Orchestrator, OrchestratorBuilder, SessionState, SessionStats};
pub use sink::{ResponseFragment, ResponseObserver, ResponseSink};
