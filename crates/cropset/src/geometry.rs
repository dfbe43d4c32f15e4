// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Detection to crop geometry.
//!
//! ## Coordinate Systems
//!
//! - **Detector**: `[ymin, xmin, ymax, xmax]`, normalized `[0, 1]`
//! - **Pixel box**: same layout scaled by `(height, width, height, width)`
//! - **Crop box**: integer pixel edges, `top`/`left` inclusive and
//!   `bottom`/`right` exclusive

use crate::{Error, detection::DetectionResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

// =============================================================================
// Boxes
// =============================================================================

/// Detection box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub ymin: f64,
    pub xmin: f64,
    pub ymax: f64,
    pub xmax: f64,
}

impl PixelBox {
    /// Scale a normalized detector box to an image of `width` x `height`.
    ///
    /// Coordinates are clamped into `[0, 1]` first.
    pub fn from_normalized(normalized: &[f32; 4], width: u32, height: u32) -> Self {
        let [ymin, xmin, ymax, xmax] = normalized.map(|v| (v as f64).clamp(0.0, 1.0));
        let w = width as f64;
        let h = height as f64;
        PixelBox {
            ymin: ymin * h,
            xmin: xmin * w,
            ymax: ymax * h,
            xmax: xmax * w,
        }
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }
}

/// Integer crop rectangle. May extend past the image on the high side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropBox {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl CropBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Part of the crop that lies inside a `width` x `height` image, or
    /// `None` when nothing does.
    pub fn within(&self, width: u32, height: u32) -> Option<CropBox> {
        let region = CropBox {
            top: self.top,
            left: self.left,
            bottom: self.bottom.min(height),
            right: self.right.min(width),
        };
        (!region.is_empty()).then_some(region)
    }
}

impl fmt::Display for CropBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.top, self.left, self.bottom, self.right
        )
    }
}

// =============================================================================
// Clamping
// =============================================================================

/// How crop boxes are clamped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampMode {
    /// Clamp only at zero. High edges may exceed the image and the crop is
    /// truncated when cut.
    #[default]
    LowerOnly,
    /// Clamp every edge to the image.
    ImageBounds,
}

impl ClampMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClampMode::LowerOnly => "lower_only",
            ClampMode::ImageBounds => "image_bounds",
        }
    }
}

impl fmt::Display for ClampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClampMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower_only" | "lower-only" => Ok(ClampMode::LowerOnly),
            "image_bounds" | "image-bounds" => Ok(ClampMode::ImageBounds),
            other => Err(Error::InvalidParameters(format!(
                "Unknown clamp mode {:?}, expected lower_only or image_bounds",
                other
            ))),
        }
    }
}

// =============================================================================
// Selection and padding
// =============================================================================

/// One accepted detection and the crop derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct CropCandidate {
    /// Position in the detector's arrays.
    pub index: usize,
    pub detection: PixelBox,
    pub crop: CropBox,
    pub score: f32,
    pub class: u32,
}

/// Parameters of [`select_and_pad`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropParams {
    /// Minimum score, exclusive.
    pub threshold: f32,
    /// Side of the square crop relative to the longer box side; `>= 1`.
    pub padding_factor: f64,
    pub clamp: ClampMode,
}

/// Keep the detections scoring strictly above the threshold and turn each
/// into a square, padded crop centred on the box.
///
/// Low edges are floored and high edges ceiled, so the crop always covers
/// the detection. Boxes with non-finite or inverted coordinates are
/// dropped.
pub fn select_and_pad(
    detection: &DetectionResult,
    width: u32,
    height: u32,
    params: &CropParams,
) -> Vec<CropCandidate> {
    let count = detection.num_detections.min(detection.len());
    let mut candidates = Vec::new();

    for index in 0..count {
        let score = detection.scores[index];
        if score.is_nan() || score <= params.threshold {
            continue;
        }

        let normalized = &detection.boxes[index];
        if normalized.iter().any(|v| !v.is_finite()) {
            debug!("Dropping non-finite box {:?}", normalized);
            continue;
        }

        let pixel = PixelBox::from_normalized(normalized, width, height);
        if pixel.height() < 0.0 || pixel.width() < 0.0 {
            debug!("Dropping inverted box {:?}", normalized);
            continue;
        }

        candidates.push(CropCandidate {
            index,
            detection: pixel,
            crop: pad_box(&pixel, width, height, params),
            score,
            class: detection.classes[index],
        });
    }

    candidates
}

fn pad_box(pixel: &PixelBox, width: u32, height: u32, params: &CropParams) -> CropBox {
    let side = params.padding_factor * pixel.height().max(pixel.width());
    let offset_y = (side - pixel.height()) / 2.0;
    let offset_x = (side - pixel.width()) / 2.0;

    let top = (pixel.ymin - offset_y).floor().max(0.0);
    let left = (pixel.xmin - offset_x).floor().max(0.0);
    let mut bottom = (pixel.ymax + offset_y).ceil().max(0.0);
    let mut right = (pixel.xmax + offset_x).ceil().max(0.0);

    if params.clamp == ClampMode::ImageBounds {
        bottom = bottom.min(height as f64);
        right = right.min(width as f64);
    }

    CropBox {
        top: top as u32,
        left: left as u32,
        bottom: bottom as u32,
        right: right as u32,
    }
}
