//! Windows/macOS region capture through `scrap`.
//!
//! scrap only exposes whole-display frames, so the region is cropped out of
//! the primary display's frame row by row.

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use scrap::{Capturer, Display};
use tracing::debug;

use super::{Frame, PixelFormat, RegionCapturer, check_bounds};
use crate::config::Region;
use crate::error::{CaptureFailure, WatchError, WatchResult};

/// Primary-display capturer. A fresh `scrap::Capturer` is built per call.
#[derive(Debug)]
pub struct ScrapCapturer {
    /// How long to keep polling while the OS has no frame ready.
    frame_wait: Duration,
}

impl Default for ScrapCapturer {
    fn default() -> Self {
        Self {
            frame_wait: Duration::from_millis(250),
        }
    }
}

impl ScrapCapturer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn map_io(e: std::io::Error) -> WatchError {
    let kind = match e.kind() {
        ErrorKind::PermissionDenied => CaptureFailure::PermissionDenied,
        ErrorKind::NotFound | ErrorKind::ConnectionAborted => CaptureFailure::DisplayUnavailable,
        _ => CaptureFailure::Backend,
    };
    let err = WatchError::capture(kind, e.to_string());
    if kind == CaptureFailure::PermissionDenied {
        err.with_recovery_suggestion("grant screen recording permission to this terminal")
    } else {
        err
    }
}

/// Copy `region` out of a full-display BGRA frame.
fn crop(display: &[u8], display_stride: usize, region: &Region) -> Vec<u8> {
    let row_bytes = region.width as usize * 4;
    let mut out = Vec::with_capacity(row_bytes * region.height as usize);
    for row in 0..region.height as usize {
        let start = (region.y as usize + row) * display_stride + region.x as usize * 4;
        out.extend_from_slice(&display[start..start + row_bytes]);
    }
    out
}

impl RegionCapturer for ScrapCapturer {
    fn capture(&self, region: &Region) -> WatchResult<Frame> {
        let display = Display::primary().map_err(map_io)?;
        let (w, h) = (display.width() as u32, display.height() as u32);
        check_bounds(region, w, h)?;

        let mut capturer = Capturer::new(display).map_err(map_io)?;
        let deadline = Instant::now() + self.frame_wait;
        loop {
            match capturer.frame() {
                Ok(frame) => {
                    let stride = frame.len() / h as usize;
                    if stride < w as usize * 4 {
                        return Err(WatchError::capture(
                            CaptureFailure::Backend,
                            format!("display frame too short: {} bytes", frame.len()),
                        ));
                    }
                    debug!(stride, bytes = frame.len(), "scrap frame");
                    return Ok(Frame {
                        data: crop(&frame, stride, region),
                        width: region.width,
                        height: region.height,
                        stride: region.width as usize * 4,
                        format: PixelFormat::Bgra8,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(WatchError::capture(
                            CaptureFailure::DisplayUnavailable,
                            format!("no display frame within {:?}", self.frame_wait),
                        ));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(map_io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop() {
        // 4x2 display with 4 bytes of padding per row.
        let stride = 20;
        let mut display = vec![0u8; stride * 2];
        for row in 0..2 {
            for col in 0..4 {
                let v = (row * 4 + col) as u8;
                display[row * stride + col * 4..row * stride + col * 4 + 4].fill(v);
            }
        }
        let out = crop(&display, stride, &Region::new(1, 1, 2, 1));
        assert_eq!(out, vec![5, 5, 5, 5, 6, 6, 6, 6]);
    }

    #[test]
    fn test_permission_mapping() {
        let err = map_io(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(matches!(
            err,
            WatchError::Capture {
                kind: CaptureFailure::PermissionDenied,
                ..
            }
        ));
    }
}
