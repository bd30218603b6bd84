// SPDX-License-Identifier: MIT
//! # region-scale: Bandwidth-Bounded Snapshot Scaling
//!
//! Downscaling for screen-region snapshots that are shipped to a remote
//! multimodal model several times per second. The model does not need the
//! native resolution of a monitor region; it needs a frame small enough to
//! encode and upload inside one tick.
//!
//! ## Key Components
//!
//! - [`presets`]: scaling plan computation and long-side presets
//! - [`cpu`]: SIMD CPU scaler built on `fast_image_resize`
//!
//! ## Usage Example
//!
//! ```rust
//! use region_scale::presets::{build_plan, ScaleTarget, Size};
//!
//! let plan = build_plan(Size { w: 1222, h: 685 }, ScaleTarget::MaxLongSide(800));
//! assert_eq!(plan.out.w, 800);
//! assert_eq!(plan.out.h, 448);
//!
//! // Shrinking a plan never goes below the floor and never upscales.
//! let smaller = plan.shrink(3, 4, 160);
//! assert_eq!(smaller.out.w, 600);
//! ```

pub mod cpu;
pub mod presets;
