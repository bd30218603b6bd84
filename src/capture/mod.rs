//! # Capture Module
//!
//! Platform screen-region capture behind the [`RegionCapturer`] trait.
//!
//! | Platform | Backend | Crate |
//! |----------|---------|-------|
//! | Linux (X11) | `GetImage` on the root window | `x11rb` |
//! | Windows / macOS | primary display frame, cropped | `scrap` |
//!
//! Every backend opens and releases its OS handle inside a single
//! [`RegionCapturer::capture`] call, so a 10 Hz session does not accumulate
//! connections or capture objects.

use crate::config::Region;
use crate::error::{CaptureFailure, WatchError, WatchResult};

#[cfg(all(feature = "screen-capture", any(target_os = "windows", target_os = "macos")))]
pub mod scrap;
#[cfg(all(feature = "screen-capture", target_os = "linux"))]
pub mod x11;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, B G R A
    Bgra8,
    /// 4 bytes per pixel, B G R and an unused padding byte
    Bgrx8,
    /// 2 bytes per pixel, little-endian 5-6-5
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Bgrx8 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }
}

/// One raw snapshot of a region. Moved into the encoder and dropped there.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, padding included.
    pub stride: usize,
    pub format: PixelFormat,
}

impl Frame {
    /// Tightly packed BGRA frame, mostly useful in tests.
    pub fn bgra(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * 4,
            format: PixelFormat::Bgra8,
        }
    }

    /// Bytes a buffer of these dimensions must hold at minimum.
    pub fn required_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.stride * (self.height as usize - 1)
            + self.width as usize * self.format.bytes_per_pixel()
    }
}

/// Captures a rectangle of the screen.
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait RegionCapturer: Send + Sync {
    fn capture(&self, region: &Region) -> WatchResult<Frame>;
}

/// Capturer used when no OS backend is compiled in.
#[derive(Debug, Default)]
pub struct UnavailableCapturer;

impl RegionCapturer for UnavailableCapturer {
    fn capture(&self, _region: &Region) -> WatchResult<Frame> {
        Err(WatchError::capture(
            CaptureFailure::DisplayUnavailable,
            "no screen capture backend for this platform",
        )
        .with_recovery_suggestion("build with the `screen-capture` feature on Linux/X11, Windows or macOS"))
    }
}

/// Pick the capture backend for the current platform.
pub fn default_capturer() -> Box<dyn RegionCapturer> {
    platform_capturer()
}

#[cfg(all(feature = "screen-capture", target_os = "linux"))]
fn platform_capturer() -> Box<dyn RegionCapturer> {
    Box::new(x11::X11Capturer::new())
}

#[cfg(all(feature = "screen-capture", any(target_os = "windows", target_os = "macos")))]
fn platform_capturer() -> Box<dyn RegionCapturer> {
    Box::new(scrap::ScrapCapturer::new())
}

#[cfg(not(all(
    feature = "screen-capture",
    any(target_os = "linux", target_os = "windows", target_os = "macos")
)))]
fn platform_capturer() -> Box<dyn RegionCapturer> {
    Box::new(UnavailableCapturer)
}

/// Reject regions that fall outside a `screen_w` x `screen_h` display.
pub(crate) fn check_bounds(region: &Region, screen_w: u32, screen_h: u32) -> WatchResult<()> {
    if region.is_empty() {
        return Err(WatchError::capture(
            CaptureFailure::OffScreen,
            format!("region {} has no area", region),
        ));
    }
    if !region.fits_within(screen_w, screen_h) {
        return Err(WatchError::capture(
            CaptureFailure::OffScreen,
            format!(
                "region {} exceeds display {}x{}",
                region, screen_w, screen_h
            ),
        )
        .with_recovery_suggestion("reselect the region on the current display layout"));
    }
    Ok(())
}
