// SPDX-License-Identifier: MIT
//! # Scaling Plans and Long-Side Presets
//!
//! A [`ScalePlan`] pairs the captured region size with the size the encoder
//! should actually compress. Plans always preserve aspect ratio and never
//! upscale: a region already smaller than the target is passed through.
//!
//! The encoder walks plans downwards with [`ScalePlan::shrink`] when a frame
//! does not fit the per-frame byte budget, so shrinking must be monotonic
//! and bounded by a floor.

/// Represents a 2D size with width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

impl Size {
    /// Length of the longest side.
    pub fn long_side(self) -> u32 {
        self.w.max(self.h)
    }

    /// Number of pixels covered.
    pub fn area(self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

/// Size constraint applied when planning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleTarget {
    /// Keep the native size.
    Native,
    /// Clamp the longest side, derive the other side proportionally.
    MaxLongSide(u32),
}

/// Computed scaling plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalePlan {
    /// Captured dimensions
    pub input: Size,
    /// Constraint the plan was built from
    pub target: ScaleTarget,
    /// Dimensions handed to the codec
    pub out: Size,
}

impl ScalePlan {
    /// True when no resampling is needed.
    pub fn is_identity(&self) -> bool {
        self.input == self.out
    }

    /// Re-plan with the long side reduced to `num/den` of the current one,
    /// but never below `floor` (or the input's own long side, whichever is
    /// smaller). Returns `self` unchanged when already at the floor.
    pub fn shrink(&self, num: u32, den: u32, floor: u32) -> ScalePlan {
        let current = self.out.long_side();
        let floor = floor.min(self.input.long_side()).max(1);
        if current <= floor || den == 0 {
            return *self;
        }
        let reduced = ((current as u64 * num as u64) / den as u64) as u32;
        build_plan(self.input, ScaleTarget::MaxLongSide(reduced.max(floor)))
    }
}

/// Compute a scaling plan for `input` under `target`.
pub fn build_plan(input: Size, target: ScaleTarget) -> ScalePlan {
    let out = match target {
        ScaleTarget::Native => input,
        ScaleTarget::MaxLongSide(max_long) => fit_preserve(input, max_long),
    };
    ScalePlan { input, target, out }
}

/// Clamp the longest side to `max_long`, keeping aspect ratio; never upscales
/// and never produces a zero-sized side.
fn fit_preserve(input: Size, max_long: u32) -> Size {
    let (w, h) = (input.w as f64, input.h as f64);
    let long = w.max(h).max(1.0);
    let s = (max_long.max(1) as f64 / long).min(1.0);
    Size {
        w: ((w * s).round() as u32).max(1),
        h: ((h * s).round() as u32).max(1),
    }
}

/// Long-side presets exposed on the command line.
///
/// `Long800` matches what the watcher has always sent: large enough for
/// on-screen text to stay legible, small enough for a few frames a second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DownscalePreset {
    /// Send the region at native resolution (subject to the byte budget)
    #[value(name = "native")]
    Native,
    /// Longest side 1024px
    #[value(name = "1024")]
    Long1024,
    /// Longest side 800px
    #[default]
    #[value(name = "800")]
    Long800,
    /// Longest side 640px
    #[value(name = "640")]
    Long640,
    /// Longest side 512px, for dense text at high frame rates
    #[value(name = "512")]
    Long512,
}

impl DownscalePreset {
    /// Convert preset to the corresponding target.
    pub fn to_target(self) -> ScaleTarget {
        match self {
            DownscalePreset::Native => ScaleTarget::Native,
            DownscalePreset::Long1024 => ScaleTarget::MaxLongSide(1024),
            DownscalePreset::Long800 => ScaleTarget::MaxLongSide(800),
            DownscalePreset::Long640 => ScaleTarget::MaxLongSide(640),
            DownscalePreset::Long512 => ScaleTarget::MaxLongSide(512),
        }
    }

    /// Long side limit, `None` for native.
    pub fn long_side(self) -> Option<u32> {
        match self.to_target() {
            ScaleTarget::Native => None,
            ScaleTarget::MaxLongSide(n) => Some(n),
        }
    }
}
