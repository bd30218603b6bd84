//! # Frame Encoder
//!
//! Downscale, convert and JPEG-encode one captured frame, staying inside a
//! per-frame byte budget.
//!
//! ## Pipeline
//!
//! 1. Validate dimensions, stride and buffer length.
//! 2. Expand `Rgb565` to 4-byte pixels; 4-byte formats are used in place.
//! 3. Plan the output size with `region-scale` (aspect preserved, never
//!    upscaled) and resample with Lanczos3.
//! 4. Drop the fourth channel and encode JPEG.
//!
//! ## Budget Loop
//!
//! When the result exceeds `per_frame_budget`, quality is lowered by
//! `quality_step` until `min_quality`, then the long side is shrunk to 3/4
//! (never below `min_long_side`). The loop is bounded by `max_passes`; the
//! last attempt is returned even if it is still over budget. The encoder
//! holds no state between calls, so the same frame and hint always produce
//! the same bytes.

use base64::{Engine as _, engine::general_purpose};
use fast_image_resize::Resizer;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use region_scale::cpu::{Staging, compact_rows, scale_bgra_cpu};
use region_scale::presets::{ScalePlan, ScaleTarget, Size, build_plan};
use tracing::debug;

use crate::capture::{Frame, PixelFormat};
use crate::config::EncoderSettings;
use crate::error::{WatchError, WatchResult};

pub const JPEG_MIME: &str = "image/jpeg";

/// Per-call encoding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityHint {
    /// Starting JPEG quality, 1-100.
    pub quality: u8,
    /// Byte cap for this frame, `None` for unbounded.
    pub per_frame_budget: Option<usize>,
}

impl Default for QualityHint {
    fn default() -> Self {
        Self {
            quality: 85,
            per_frame_budget: None,
        }
    }
}

impl QualityHint {
    /// Hint derived from encoder settings at a given frame rate.
    pub fn for_rate(settings: &EncoderSettings, frame_rate_hz: u32) -> Self {
        Self {
            quality: settings.quality,
            per_frame_budget: settings.per_frame_budget(frame_rate_hz),
        }
    }
}

/// Compressed frame ready for the wire.
#[derive(Clone)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    /// Monotonic per session; diagnostics only.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Quality the bytes were produced at.
    pub quality: u8,
}

impl std::fmt::Debug for EncodedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedPayload")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("quality", &self.quality)
            .finish()
    }
}

impl EncodedPayload {
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Stateless JPEG encoder.
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {
    settings: EncoderSettings,
}

impl FrameEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Encode `frame`. Consumes the frame; its pixel buffer is dropped here.
    pub fn encode(&self, frame: Frame, hint: QualityHint, sequence: u64) -> WatchResult<EncodedPayload> {
        validate_frame(&frame)?;

        let (pixels, stride) = match frame.format {
            PixelFormat::Bgra8 | PixelFormat::Bgrx8 => (frame.data, frame.stride),
            PixelFormat::Rgb565 => (
                rgb565_to_bgrx(&frame.data, frame.width, frame.height, frame.stride),
                frame.width as usize * 4,
            ),
        };
        let input = Size {
            w: frame.width,
            h: frame.height,
        };

        let target = match self.settings.max_long_side {
            Some(n) => ScaleTarget::MaxLongSide(n),
            None => ScaleTarget::Native,
        };
        let mut plan = build_plan(input, target);
        let mut quality = hint.quality.clamp(1, 100);
        let min_quality = self.settings.min_quality.clamp(1, quality);
        let step = self.settings.quality_step.max(1);
        let max_passes = self.settings.max_passes.max(1);

        let mut resizer = Resizer::new();
        let mut staging = Staging::default();
        let mut rgb = resample_rgb(&mut resizer, &pixels, input, stride, &plan, &mut staging)?;

        let mut pass = 0;
        loop {
            let bytes = encode_jpeg(&rgb, plan.out, quality)?;
            pass += 1;

            let over = hint.per_frame_budget.filter(|budget| bytes.len() > *budget);
            let Some(budget) = over else {
                return Ok(self.payload(bytes, &plan, quality, sequence));
            };
            if pass >= max_passes {
                debug!(sequence, len = bytes.len(), budget, "budget passes exhausted");
                return Ok(self.payload(bytes, &plan, quality, sequence));
            }

            if quality > min_quality {
                quality = quality.saturating_sub(step).max(min_quality);
            } else {
                let smaller = plan.shrink(3, 4, self.settings.min_long_side);
                if smaller == plan {
                    debug!(sequence, len = bytes.len(), budget, "at quality and size floor");
                    return Ok(self.payload(bytes, &plan, quality, sequence));
                }
                plan = smaller;
                rgb = resample_rgb(&mut resizer, &pixels, input, stride, &plan, &mut staging)?;
            }
            debug!(
                sequence,
                len = bytes.len(),
                budget,
                quality,
                long_side = plan.out.long_side(),
                "re-encoding over budget frame"
            );
        }
    }

    fn payload(&self, bytes: Vec<u8>, plan: &ScalePlan, quality: u8, sequence: u64) -> EncodedPayload {
        EncodedPayload {
            bytes,
            mime_type: JPEG_MIME,
            sequence,
            width: plan.out.w,
            height: plan.out.h,
            quality,
        }
    }
}

fn validate_frame(frame: &Frame) -> WatchResult<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(WatchError::encode(format!(
            "frame has zero dimension {}x{}",
            frame.width, frame.height
        )));
    }
    let row_bytes = frame.width as usize * frame.format.bytes_per_pixel();
    if frame.stride < row_bytes {
        return Err(WatchError::encode(format!(
            "stride {} shorter than row of {} bytes",
            frame.stride, row_bytes
        )));
    }
    if frame.data.len() < frame.required_len() {
        return Err(WatchError::encode(format!(
            "buffer holds {} bytes, {}x{} {:?} needs {}",
            frame.data.len(),
            frame.width,
            frame.height,
            frame.format,
            frame.required_len()
        )));
    }
    Ok(())
}

/// Resample 4-byte pixels to `plan.out` and strip them to packed RGB.
fn resample_rgb(
    resizer: &mut Resizer,
    pixels: &[u8],
    input: Size,
    stride: usize,
    plan: &ScalePlan,
    staging: &mut Staging,
) -> WatchResult<Vec<u8>> {
    let out_len = plan.out.w as usize * plan.out.h as usize * 4;
    let mut bgra = vec![0u8; out_len];
    if plan.is_identity() {
        compact_rows(pixels, stride, &mut bgra, input.w as usize * 4, input.h as usize);
    } else {
        scale_bgra_cpu(resizer, pixels, input, stride, plan, &mut bgra, staging)
            .map_err(|e| WatchError::encode(e.to_string()).with_operation("resample"))?;
    }
    Ok(bgra_to_rgb(&bgra))
}

/// Packed BGRA/BGRX to packed RGB.
fn bgra_to_rgb(bgra: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgra.len() / 4 * 3);
    for px in bgra.chunks_exact(4) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

/// Expand little-endian RGB565 rows into packed BGRX.
fn rgb565_to_bgrx(data: &[u8], width: u32, height: u32, stride: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width as usize * height as usize * 4);
    for row in 0..height as usize {
        let line = &data[row * stride..row * stride + width as usize * 2];
        for px in line.chunks_exact(2) {
            let v = u16::from_le_bytes([px[0], px[1]]);
            let r = ((v >> 11) & 0x1f) as u8;
            let g = ((v >> 5) & 0x3f) as u8;
            let b = (v & 0x1f) as u8;
            out.extend_from_slice(&[
                (b << 3) | (b >> 2),
                (g << 2) | (g >> 4),
                (r << 3) | (r >> 2),
                0xff,
            ]);
        }
    }
    out
}

fn encode_jpeg(rgb: &[u8], size: Size, quality: u8) -> WatchResult<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb, size.w, size.h, ExtendedColorType::Rgb8)
        .map_err(|e| WatchError::external("image", e).with_operation("jpeg encode"))?;
    Ok(out)
}
