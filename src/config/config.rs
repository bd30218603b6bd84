//! # Session Configuration
//!
//! The four values a user supplies before monitoring starts: API key, frame
//! rate, screen region and prompt. They are validated once by
//! `Orchestrator::start` and never mutated while a session is active.
//!
//! ## Configuration Parameters
//!
//! | Parameter | Type | Range | Description |
//! |-----------|------|-------|-------------|
//! | `api_key` | `String` | non-empty | Credential for the live endpoint |
//! | `frame_rate_hz` | `u32` | 1-10 | Snapshots per second |
//! | `region` | `Region` | width, height > 0 | Screen rectangle in pixels |
//! | `prompt` | `Arc<str>` | non-empty | Instruction re-sent with every frame |
//!
//! ## Examples
//!
//! ```rust
//! use region_watch::config::{Region, SessionConfig};
//!
//! let region: Region = "0,0,100,100".parse().unwrap();
//! let config = SessionConfig::new("key", 2, region, "describe");
//! assert!(config.validate().is_ok());
//!
//! let bad = SessionConfig::new("key", 0, region, "describe");
//! assert!(bad.validate().is_err());
//! ```

// Standard library imports
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

// External crate imports
use serde::{Deserialize, Serialize};

// Internal module imports
use crate::error::{WatchError, WatchResult};

/// Lowest accepted frame rate.
pub const MIN_FRAME_RATE_HZ: u32 = 1;
/// Highest accepted frame rate.
pub const MAX_FRAME_RATE_HZ: u32 = 10;
/// Frame rate used when none is given.
pub const DEFAULT_FRAME_RATE_HZ: u32 = 2;
/// Environment variable the API key may be read from.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Rectangular screen area in absolute screen pixels.
///
/// `x`/`y` may be negative on multi-monitor layouts where a display sits
/// left of or above the primary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when either side is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Whether the region lies entirely inside a `width` x `height` screen
    /// anchored at the origin.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0 && self.y >= 0 && self.right() <= width as i64 && self.bottom() <= height as i64
    }

    /// Build a region from two opposite corners in any order, the way a
    /// drag-to-select overlay reports them.
    pub fn from_corners(a: (i32, i32), b: (i32, i32)) -> Self {
        let (x0, x1) = (a.0.min(b.0), a.0.max(b.0));
        let (y0, y1) = (a.1.min(b.1), a.1.max(b.1));
        Self::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

impl FromStr for Region {
    type Err = String;

    /// Parse `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(format!(
                "Invalid region '{}': expected x,y,width,height",
                s
            ));
        }
        let x = parts[0]
            .parse::<i32>()
            .map_err(|_| format!("Invalid region x: '{}'", parts[0]))?;
        let y = parts[1]
            .parse::<i32>()
            .map_err(|_| format!("Invalid region y: '{}'", parts[1]))?;
        let width = parts[2]
            .parse::<u32>()
            .map_err(|_| format!("Invalid region width: '{}'", parts[2]))?;
        let height = parts[3]
            .parse::<u32>()
            .map_err(|_| format!("Invalid region height: '{}'", parts[3]))?;
        Ok(Region::new(x, y, width, height))
    }
}

/// Everything a monitoring session needs from the user.
#[derive(Clone)]
pub struct SessionConfig {
    /// Credential for the remote service. Never logged.
    pub api_key: String,

    /// Snapshots per second, 1 to 10 inclusive.
    ///
    /// At 10 Hz each tick has 100 ms for capture, encode and upload; the
    /// encoder's byte budget is divided by this rate.
    pub frame_rate_hz: u32,

    /// Screen area to watch.
    pub region: Region,

    /// Natural-language instruction sent alongside every frame.
    pub prompt: Arc<str>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("api_key", &"<redacted>")
            .field("frame_rate_hz", &self.frame_rate_hz)
            .field("region", &self.region)
            .field("prompt", &self.prompt)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(
        api_key: impl Into<String>,
        frame_rate_hz: u32,
        region: Region,
        prompt: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            frame_rate_hz,
            region,
            prompt: prompt.into(),
        }
    }

    /// Validates the configuration parameters.
    ///
    /// # Validation Rules
    ///
    /// - `frame_rate_hz` must be between 1 and 10 (inclusive)
    /// - `region` must have non-zero width and height
    /// - `api_key` must not be blank
    /// - `prompt` must not be blank
    pub fn validate(&self) -> WatchResult<()> {
        if !(MIN_FRAME_RATE_HZ..=MAX_FRAME_RATE_HZ).contains(&self.frame_rate_hz) {
            return Err(WatchError::validation(
                "frame_rate_hz",
                format!(
                    "must be between {} and {}",
                    MIN_FRAME_RATE_HZ, MAX_FRAME_RATE_HZ
                ),
                self.frame_rate_hz.to_string(),
            ));
        }
        if self.region.is_empty() {
            return Err(WatchError::validation(
                "region",
                "width and height must be greater than 0",
                self.region.to_string(),
            )
            .with_recovery_suggestion("select a region by dragging across the screen"));
        }
        if self.api_key.trim().is_empty() {
            return Err(WatchError::validation("api_key", "must not be empty", "")
                .with_recovery_suggestion(format!(
                    "pass --api-key or set {}",
                    API_KEY_ENV
                )));
        }
        if self.prompt.trim().is_empty() {
            return Err(WatchError::validation("prompt", "must not be empty", ""));
        }
        Ok(())
    }

    /// Time between tick starts.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate_hz.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchError;

    fn valid() -> SessionConfig {
        SessionConfig::new("valid", 2, Region::new(0, 0, 100, 100), "describe")
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid();
        assert!(config.validate().is_ok());

        config.frame_rate_hz = 0;
        assert!(config.validate().is_err());
        config.frame_rate_hz = 11;
        assert!(config.validate().is_err());
        config.frame_rate_hz = 10;
        assert!(config.validate().is_ok());

        config.region.width = 0;
        assert!(config.validate().is_err());
        config.region.width = 100;

        config.api_key = "   ".to_string();
        assert!(config.validate().is_err());
        config.api_key = "valid".to_string();

        config.prompt = Arc::from("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_names_field() {
        let mut config = valid();
        config.frame_rate_hz = 0;
        match config.validate() {
            Err(WatchError::Validation { field, .. }) => assert_eq!(field, "frame_rate_hz"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_region_parse() {
        let region: Region = "10, -20, 300,200".parse().unwrap();
        assert_eq!(region, Region::new(10, -20, 300, 200));
        assert!("1,2,3".parse::<Region>().is_err());
        assert!("a,2,3,4".parse::<Region>().is_err());
        assert!("1,2,-3,4".parse::<Region>().is_err());
    }

    #[test]
    fn test_region_geometry() {
        let region = Region::from_corners((300, 250), (100, 50));
        assert_eq!(region, Region::new(100, 50, 200, 200));
        assert!(region.fits_within(1920, 1080));
        assert!(!Region::new(1800, 0, 200, 10).fits_within(1920, 1080));
        assert!(!Region::new(-1, 0, 10, 10).fits_within(1920, 1080));
        assert_eq!(region.to_string(), "200x200+100+50");
    }

    #[test]
    fn test_tick_period() {
        assert_eq!(valid().tick_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("valid\""));
        assert!(rendered.contains("<redacted>"));
    }
}
