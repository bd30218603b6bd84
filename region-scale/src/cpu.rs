// SPDX-License-Identifier: MIT
// CPU scaler built on fast_image_resize (SIMD-accelerated).
// 4-byte BGRA/BGRX in, tightly packed 4-byte out, written into a caller buffer.

use fast_image_resize as fir;
use fir::images::{TypedImage, TypedImageRef};
use fir::pixels::U8x4;
use fir::{ResizeOptions, Resizer};

use crate::presets::{ScalePlan, Size};

#[derive(Debug)]
pub enum ScaleError {
    BufferTooSmall { needed: usize, got: usize },
    SourceTooShort { needed: usize, got: usize },
    StrideTooSmall { stride: usize, row_bytes: usize },
    Fir(fir::ResizeError),
    ImageBuf(fir::ImageBufferError),
}

impl From<fir::ResizeError> for ScaleError {
    fn from(e: fir::ResizeError) -> Self {
        Self::Fir(e)
    }
}

impl From<fir::ImageBufferError> for ScaleError {
    fn from(e: fir::ImageBufferError) -> Self {
        Self::ImageBuf(e)
    }
}

impl std::fmt::Display for ScaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleError::BufferTooSmall { needed, got } => {
                write!(f, "output buffer too small: need {} bytes, got {}", needed, got)
            }
            ScaleError::SourceTooShort { needed, got } => {
                write!(f, "source buffer too short: need {} bytes, got {}", needed, got)
            }
            ScaleError::StrideTooSmall { stride, row_bytes } => {
                write!(f, "stride {} is smaller than a row ({} bytes)", stride, row_bytes)
            }
            ScaleError::Fir(e) => write!(f, "fast image resize error: {}", e),
            ScaleError::ImageBuf(e) => write!(f, "image buffer error: {}", e),
        }
    }
}

impl std::error::Error for ScaleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScaleError::Fir(e) => Some(e),
            ScaleError::ImageBuf(e) => Some(e),
            _ => None,
        }
    }
}

/// Scratch space used to compact strided rows into a tight buffer.
#[derive(Debug, Default)]
pub struct Staging {
    buf: Vec<u8>,
}

impl Staging {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }
}

/// Copy `rows` rows of `row_bytes` out of a strided buffer into `dst`.
pub fn compact_rows(src: &[u8], src_stride: usize, dst: &mut [u8], row_bytes: usize, rows: usize) {
    for r in 0..rows {
        let s = &src[r * src_stride..r * src_stride + row_bytes];
        dst[r * row_bytes..(r + 1) * row_bytes].copy_from_slice(s);
    }
}

/// Scale a 4-byte-per-pixel image according to `plan`.
///
/// `src_stride` is the byte length of one source row. Rows wider than
/// `src.w * 4` (padded captures, cropped display frames) are compacted into
/// `staging` first. `dst` must hold at least `plan.out.w * plan.out.h * 4`
/// bytes; only that prefix is written.
pub fn scale_bgra_cpu(
    resizer: &mut Resizer,
    src_bgra: &[u8],
    src: Size,
    src_stride: usize,
    plan: &ScalePlan,
    dst: &mut [u8],
    staging: &mut Staging,
) -> Result<(), ScaleError> {
    let row_bytes = src.w as usize * 4;
    if src_stride < row_bytes {
        return Err(ScaleError::StrideTooSmall {
            stride: src_stride,
            row_bytes,
        });
    }
    let needed_src = src_stride * (src.h as usize).saturating_sub(1) + row_bytes;
    if src_bgra.len() < needed_src {
        return Err(ScaleError::SourceTooShort {
            needed: needed_src,
            got: src_bgra.len(),
        });
    }
    let dst_len = plan.out.w as usize * plan.out.h as usize * 4;
    if dst.len() < dst_len {
        return Err(ScaleError::BufferTooSmall {
            needed: dst_len,
            got: dst.len(),
        });
    }

    let tight_len = row_bytes * src.h as usize;
    let src_view = if src_stride == row_bytes {
        TypedImageRef::<U8x4>::from_buffer(src.w, src.h, &src_bgra[..tight_len])?
    } else {
        staging.ensure_len(tight_len);
        compact_rows(src_bgra, src_stride, &mut staging.buf, row_bytes, src.h as usize);
        TypedImageRef::<U8x4>::from_buffer(src.w, src.h, &staging.buf[..tight_len])?
    };

    let mut dst_image = TypedImage::<U8x4>::from_buffer(plan.out.w, plan.out.h, &mut dst[..dst_len])?;

    // The fourth channel is padding on most captures.
    let opts = ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3))
        .use_alpha(false);
    resizer.resize_typed::<U8x4>(&src_view, &mut dst_image, &opts)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::{build_plan, ScaleTarget};

    fn solid(w: u32, h: u32, px: [u8; 4]) -> Vec<u8> {
        px.iter().copied().cycle().take((w * h * 4) as usize).collect()
    }

    #[test]
    fn downscales_solid_colour() {
        let src = solid(64, 32, [10, 20, 30, 255]);
        let plan = build_plan(Size { w: 64, h: 32 }, ScaleTarget::MaxLongSide(16));
        let mut dst = vec![0u8; (plan.out.w * plan.out.h * 4) as usize];
        let mut staging = Staging::default();
        scale_bgra_cpu(
            &mut Resizer::new(),
            &src,
            plan.input,
            64 * 4,
            &plan,
            &mut dst,
            &mut staging,
        )
        .unwrap();
        assert_eq!(plan.out, Size { w: 16, h: 8 });
        for px in dst.chunks_exact(4) {
            for (got, want) in px[..3].iter().zip([10u8, 20, 30]) {
                assert!(got.abs_diff(want) <= 1, "channel {} vs {}", got, want);
            }
        }
    }

    #[test]
    fn compacts_strided_rows() {
        // 2x2 image with 4 bytes of padding per row.
        let src = vec![
            1, 1, 1, 255, 2, 2, 2, 255, 9, 9, 9, 9, //
            3, 3, 3, 255, 4, 4, 4, 255, 9, 9, 9, 9,
        ];
        let mut dst = vec![0u8; 16];
        compact_rows(&src, 12, &mut dst, 8, 2);
        assert_eq!(&dst[..4], &[1, 1, 1, 255]);
        assert_eq!(&dst[12..], &[4, 4, 4, 255]);
    }

    #[test]
    fn rejects_short_output() {
        let src = solid(8, 8, [0, 0, 0, 255]);
        let plan = build_plan(Size { w: 8, h: 8 }, ScaleTarget::MaxLongSide(4));
        let mut dst = vec![0u8; 4];
        let err = scale_bgra_cpu(
            &mut Resizer::new(),
            &src,
            plan.input,
            32,
            &plan,
            &mut dst,
            &mut Staging::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ScaleError::BufferTooSmall { needed: 64, got: 4 }));
    }

    #[test]
    fn rejects_stride_smaller_than_row() {
        let src = solid(8, 8, [0, 0, 0, 255]);
        let plan = build_plan(Size { w: 8, h: 8 }, ScaleTarget::Native);
        let mut dst = vec![0u8; 256];
        let err = scale_bgra_cpu(
            &mut Resizer::new(),
            &src,
            plan.input,
            16,
            &plan,
            &mut dst,
            &mut Staging::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ScaleError::StrideTooSmall { .. }));
    }
}
