//! # Configuration Module
//!
//! Session parameters ([`config`]), pipeline tuning knobs ([`settings`]) and
//! the optional TOML settings file.

pub mod config;
pub mod settings;

pub use config::{
    API_KEY_ENV, DEFAULT_FRAME_RATE_HZ, MAX_FRAME_RATE_HZ, MIN_FRAME_RATE_HZ, Region, SessionConfig,
};
pub use settings::{
    ChannelSettings, EncoderSettings, ReconnectPolicy, ServiceSettings, WatchSettings,
};
