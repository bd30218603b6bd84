//! X11 region capture through `x11rb`.

use tracing::debug;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat};

use super::{Frame, PixelFormat, RegionCapturer, check_bounds};
use crate::config::Region;
use crate::error::{CaptureFailure, WatchError, WatchResult};

/// Grabs the region from the root window of the default screen.
///
/// A display connection is opened per call and dropped when the call
/// returns.
#[derive(Debug, Default)]
pub struct X11Capturer {
    display: Option<String>,
}

impl X11Capturer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit display name instead of `$DISPLAY`.
    pub fn with_display(display: impl Into<String>) -> Self {
        Self {
            display: Some(display.into()),
        }
    }
}

fn pixel_format_for_depth(depth: u8) -> WatchResult<PixelFormat> {
    match depth {
        24 | 32 => Ok(PixelFormat::Bgrx8),
        16 => Ok(PixelFormat::Rgb565),
        other => Err(WatchError::capture(
            CaptureFailure::Backend,
            format!("unsupported X11 visual depth {}", other),
        )),
    }
}

/// Origin of `region` as the signed 16-bit coordinates GetImage takes.
fn request_origin(region: &Region) -> WatchResult<(i16, i16)> {
    match (i16::try_from(region.x), i16::try_from(region.y)) {
        (Ok(x), Ok(y)) => Ok((x, y)),
        _ => Err(WatchError::capture(
            CaptureFailure::OffScreen,
            format!(
                "region origin {},{} is beyond the X11 coordinate range",
                region.x, region.y
            ),
        )),
    }
}

impl RegionCapturer for X11Capturer {
    fn capture(&self, region: &Region) -> WatchResult<Frame> {
        let (conn, screen_num) = x11rb::connect(self.display.as_deref()).map_err(|e| {
            WatchError::capture(CaptureFailure::DisplayUnavailable, e.to_string())
                .with_recovery_suggestion("check that DISPLAY points at a running X server")
        })?;
        let screen = conn.setup().roots.get(screen_num).ok_or_else(|| {
            WatchError::capture(
                CaptureFailure::DisplayUnavailable,
                format!("X server reports no screen {}", screen_num),
            )
        })?;

        check_bounds(
            region,
            screen.width_in_pixels as u32,
            screen.height_in_pixels as u32,
        )?;

        let (x, y) = request_origin(region)?;
        // Width and height fit u16 once they are inside the screen.
        let reply = conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                screen.root,
                x,
                y,
                region.width as u16,
                region.height as u16,
                !0,
            )
            .map_err(|e| WatchError::capture(CaptureFailure::Backend, e.to_string()))?
            .reply()
            .map_err(|e| WatchError::capture(CaptureFailure::Backend, e.to_string()))?;

        let format = pixel_format_for_depth(reply.depth)?;
        let stride = reply.data.len() / region.height as usize;
        debug!(
            depth = reply.depth,
            stride,
            bytes = reply.data.len(),
            "x11 get_image"
        );

        let frame = Frame {
            data: reply.data,
            width: region.width,
            height: region.height,
            stride,
            format,
        };
        if frame.data.len() < frame.required_len() {
            return Err(WatchError::capture(
                CaptureFailure::Backend,
                format!(
                    "short image from X server: {} bytes, expected {}",
                    frame.data.len(),
                    frame.required_len()
                ),
            ));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_mapping() {
        assert_eq!(pixel_format_for_depth(24).unwrap(), PixelFormat::Bgrx8);
        assert_eq!(pixel_format_for_depth(32).unwrap(), PixelFormat::Bgrx8);
        assert_eq!(pixel_format_for_depth(16).unwrap(), PixelFormat::Rgb565);
        assert!(pixel_format_for_depth(8).is_err());
    }

    #[test]
    fn test_origin_beyond_i16_is_off_screen() {
        assert_eq!(request_origin(&Region::new(10, 32767, 5, 5)).unwrap(), (10, 32767));
        let err = request_origin(&Region::new(40000, 0, 5, 5)).unwrap_err();
        assert!(matches!(
            err,
            WatchError::Capture {
                kind: CaptureFailure::OffScreen,
                ..
            }
        ));
        assert!(request_origin(&Region::new(0, 32768, 5, 5)).is_err());
    }

    #[test]
    fn test_missing_display_is_capture_error() {
        let capturer = X11Capturer::with_display(":4242");
        let err = capturer.capture(&Region::new(0, 0, 10, 10)).unwrap_err();
        assert!(matches!(
            err,
            WatchError::Capture {
                kind: CaptureFailure::DisplayUnavailable,
                ..
            }
        ));
    }
}
