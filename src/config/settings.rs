//! # Pipeline Settings
//!
//! Tuning knobs for the encoder and the session channel, plus the optional
//! TOML settings file. Defaults reproduce the watcher's long-standing
//! behaviour: 2 fps, JPEG quality 85, longest side 800 px, 500 output
//! tokens.
//!
//! ## Settings File
//!
//! Every table and every key is optional; missing keys keep their defaults.
//!
//! ```toml
//! [session]
//! frame_rate_hz = 3
//! prompt = "Summarise what changed"
//! region = { x = 0, y = 0, width = 800, height = 600 }
//!
//! [encoder]
//! quality = 80
//! max_long_side = 640
//! bandwidth_budget_bytes_per_sec = 262144
//!
//! [channel]
//! max_output_tokens = 300
//! rotate_after_secs = 30
//!
//! [channel.reconnect]
//! max_attempts = 3
//!
//! [broadcast]
//! addr = "127.0.0.1:8001"
//!
//! [control]
//! enabled = false
//! ```
//!
//! A `[broadcast]` or `[control]` table turns that local server on unless it
//! says `enabled = false`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::config::config::{DEFAULT_FRAME_RATE_HZ, Region, SessionConfig};
use crate::error::{WatchError, WatchResult};

/// Live endpoint for the bidirectional generate-content service.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
/// Model requested in the setup message.
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
/// Accepted range for `max_output_tokens`.
pub const OUTPUT_TOKEN_RANGE: std::ops::RangeInclusive<u32> = 50..=8192;
/// Where finished replies are re-published to local WebSocket clients.
pub const DEFAULT_BROADCAST_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8001);
/// Where the `/health` and `/shutdown` endpoints listen.
pub const DEFAULT_CONTROL_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8005);

/// Local servers that run beside the watch session. `None` leaves a server
/// off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSettings {
    pub broadcast: Option<SocketAddr>,
    pub control: Option<SocketAddr>,
}

/// Encoder knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    /// Longest side after downscaling; `None` keeps native size.
    pub max_long_side: Option<u32>,
    /// Long side the budget loop never shrinks below.
    pub min_long_side: u32,
    /// Starting JPEG quality (1-100).
    pub quality: u8,
    /// Quality the budget loop never goes below.
    pub min_quality: u8,
    /// Amount quality drops per budget pass.
    pub quality_step: u8,
    /// Upload budget; divided by the frame rate to get the per-frame cap.
    /// `None` disables the budget loop.
    pub bandwidth_budget_bytes_per_sec: Option<u64>,
    /// Upper bound on re-encode passes for one frame.
    pub max_passes: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            max_long_side: Some(800),
            min_long_side: 320,
            quality: 85,
            min_quality: 40,
            quality_step: 15,
            bandwidth_budget_bytes_per_sec: Some(512 * 1024),
            max_passes: 6,
        }
    }
}

impl EncoderSettings {
    pub fn validate(&self) -> WatchResult<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(WatchError::validation(
                "encoder.quality",
                "must be between 1 and 100",
                self.quality.to_string(),
            ));
        }
        if self.min_quality == 0 || self.min_quality > self.quality {
            return Err(WatchError::validation(
                "encoder.min_quality",
                "must be between 1 and encoder.quality",
                self.min_quality.to_string(),
            ));
        }
        if self.min_long_side == 0 {
            return Err(WatchError::validation(
                "encoder.min_long_side",
                "must be greater than 0",
                "0",
            ));
        }
        if let Some(max) = self.max_long_side {
            if max < self.min_long_side {
                return Err(WatchError::validation(
                    "encoder.max_long_side",
                    "must not be smaller than encoder.min_long_side",
                    max.to_string(),
                ));
            }
        }
        if self.bandwidth_budget_bytes_per_sec == Some(0) {
            return Err(WatchError::validation(
                "encoder.bandwidth_budget_bytes_per_sec",
                "must be greater than 0 when set",
                "0",
            ));
        }
        Ok(())
    }

    /// Byte cap for one frame at `frame_rate_hz`.
    pub fn per_frame_budget(&self, frame_rate_hz: u32) -> Option<usize> {
        self.bandwidth_budget_bytes_per_sec
            .map(|bps| (bps / frame_rate_hz.max(1) as u64) as usize)
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total connection attempts per (re)connect cycle, first one included.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` counts failures
    /// so far (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exp);
        if nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    pub fn validate(&self) -> WatchResult<()> {
        if self.max_attempts == 0 {
            return Err(WatchError::validation(
                "channel.reconnect.max_attempts",
                "must be at least 1",
                "0",
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(WatchError::validation(
                "channel.reconnect.multiplier",
                "must be at least 1.0",
                self.multiplier.to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(WatchError::validation(
                "channel.reconnect.max_delay",
                "must not be shorter than initial_delay",
                format!("{:?}", self.max_delay),
            ));
        }
        Ok(())
    }
}

/// Session channel knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    /// WebSocket endpoint, without the `key` query parameter.
    pub endpoint: String,
    pub model: String,
    /// Forwarded only when inside 50..=8192.
    pub max_output_tokens: Option<u32>,
    /// Passed through verbatim as the setup message's `safety_settings`.
    pub safety_settings: Option<serde_json::Value>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Bound on one network write.
    pub send_timeout: Duration,
    /// How long `close` waits for the link tasks before aborting them.
    pub close_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Planned reconnect after this long on one connection.
    pub rotate_after: Option<Duration>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: Some(500),
            safety_settings: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            rotate_after: None,
        }
    }
}

impl ChannelSettings {
    pub fn validate(&self) -> WatchResult<()> {
        if !(self.endpoint.starts_with("wss://") || self.endpoint.starts_with("ws://")) {
            return Err(WatchError::validation(
                "channel.endpoint",
                "must be a ws:// or wss:// URL",
                self.endpoint.clone(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(WatchError::validation("channel.model", "must not be empty", ""));
        }
        for (field, value) in [
            ("channel.connect_timeout", self.connect_timeout),
            ("channel.handshake_timeout", self.handshake_timeout),
            ("channel.send_timeout", self.send_timeout),
            ("channel.close_timeout", self.close_timeout),
        ] {
            if value.is_zero() {
                return Err(WatchError::validation(field, "must be greater than 0", "0"));
            }
        }
        if self.rotate_after.is_some_and(|d| d.is_zero()) {
            return Err(WatchError::validation(
                "channel.rotate_after",
                "must be greater than 0 when set",
                "0",
            ));
        }
        self.reconnect.validate()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    pub api_key: Option<String>,
    pub frame_rate_hz: Option<u32>,
    pub prompt: Option<String>,
    pub region: Option<Region>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderSection {
    pub max_long_side: Option<u32>,
    pub native: Option<bool>,
    pub min_long_side: Option<u32>,
    pub quality: Option<u8>,
    pub min_quality: Option<u8>,
    pub quality_step: Option<u8>,
    pub bandwidth_budget_bytes_per_sec: Option<u64>,
    pub max_passes: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectSection {
    pub initial_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub safety_settings: Option<serde_json::Value>,
    pub connect_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
    pub rotate_after_secs: Option<u64>,
    pub reconnect: Option<ReconnectSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerSection {
    pub enabled: Option<bool>,
    pub addr: Option<SocketAddr>,
}

impl ListenerSection {
    fn resolve(&self, default: SocketAddr) -> Option<SocketAddr> {
        match self.enabled {
            Some(false) => None,
            _ => Some(self.addr.unwrap_or(default)),
        }
    }
}

/// Parsed settings file. Each section overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchSettings {
    pub session: Option<SessionSection>,
    pub encoder: Option<EncoderSection>,
    pub channel: Option<ChannelSection>,
    pub broadcast: Option<ListenerSection>,
    pub control: Option<ListenerSection>,
}

impl WatchSettings {
    /// Read and parse a settings file.
    pub fn load(path: impl AsRef<Path>) -> WatchResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WatchError::io("reading settings file", e).with_context(path.display().to_string())
        })?;
        Self::from_toml(&text).map_err(|e| e.with_context(path.display().to_string()))
    }

    pub fn from_toml(text: &str) -> WatchResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Encoder settings with this file's overrides applied.
    pub fn encoder_settings(&self) -> EncoderSettings {
        let mut out = EncoderSettings::default();
        let Some(sec) = &self.encoder else {
            return out;
        };
        if let Some(v) = sec.max_long_side {
            out.max_long_side = Some(v);
        }
        if sec.native == Some(true) {
            out.max_long_side = None;
        }
        if let Some(v) = sec.min_long_side {
            out.min_long_side = v;
        }
        if let Some(v) = sec.quality {
            out.quality = v;
        }
        if let Some(v) = sec.min_quality {
            out.min_quality = v;
        }
        if let Some(v) = sec.quality_step {
            out.quality_step = v;
        }
        if let Some(v) = sec.bandwidth_budget_bytes_per_sec {
            out.bandwidth_budget_bytes_per_sec = Some(v);
        }
        if let Some(v) = sec.max_passes {
            out.max_passes = v;
        }
        out
    }

    /// Channel settings with this file's overrides applied.
    pub fn channel_settings(&self) -> ChannelSettings {
        let mut out = ChannelSettings::default();
        let Some(sec) = &self.channel else {
            return out;
        };
        if let Some(v) = &sec.endpoint {
            out.endpoint = v.clone();
        }
        if let Some(v) = &sec.model {
            out.model = v.clone();
        }
        if let Some(v) = sec.max_output_tokens {
            out.max_output_tokens = Some(v);
        }
        if let Some(v) = &sec.safety_settings {
            out.safety_settings = Some(v.clone());
        }
        if let Some(ms) = sec.connect_timeout_ms {
            out.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = sec.handshake_timeout_ms {
            out.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = sec.send_timeout_ms {
            out.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = sec.close_timeout_ms {
            out.close_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = sec.rotate_after_secs {
            out.rotate_after = Some(Duration::from_secs(secs));
        }
        if let Some(r) = &sec.reconnect {
            if let Some(ms) = r.initial_delay_ms {
                out.reconnect.initial_delay = Duration::from_millis(ms);
            }
            if let Some(v) = r.multiplier {
                out.reconnect.multiplier = v;
            }
            if let Some(ms) = r.max_delay_ms {
                out.reconnect.max_delay = Duration::from_millis(ms);
            }
            if let Some(v) = r.max_attempts {
                out.reconnect.max_attempts = v;
            }
        }
        out
    }

    /// Local servers the file asks for.
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            broadcast: self
                .broadcast
                .as_ref()
                .and_then(|s| s.resolve(DEFAULT_BROADCAST_ADDR)),
            control: self
                .control
                .as_ref()
                .and_then(|s| s.resolve(DEFAULT_CONTROL_ADDR)),
        }
    }

    /// Assemble a session config from the file, falling back to `api_key_env`
    /// for the key. The flag reports whether the file named a region; when it
    /// did not, the returned region is empty and fails validation.
    pub fn session_config(&self, api_key_env: Option<String>) -> (SessionConfig, bool) {
        let sec = self.session.as_ref();
        let api_key = sec
            .and_then(|s| s.api_key.clone())
            .or(api_key_env)
            .unwrap_or_default();
        let frame_rate_hz = sec
            .and_then(|s| s.frame_rate_hz)
            .unwrap_or(DEFAULT_FRAME_RATE_HZ);
        let prompt = sec.and_then(|s| s.prompt.clone()).unwrap_or_default();
        let region = sec.and_then(|s| s.region);
        let has_region = region.is_some();
        (
            SessionConfig::new(
                api_key,
                frame_rate_hz,
                region.unwrap_or(Region::new(0, 0, 0, 0)),
                prompt,
            ),
            has_region,
        )
    }
}
