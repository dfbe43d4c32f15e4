// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Detector interface and detector output.
//!
//! The object detector is a black box: given an 8-bit RGB image it returns
//! boxes, scores and classes. [`DetectionResult`] is the concrete,
//! serializable form of that output that the detection cache persists.
//!
//! Two backends ship with the crate:
//!
//! - [`BatchResultsDetector`] answers from a MegaDetector-style batch
//!   results file produced offline.
//! - [`NoDetector`] answers nothing, for runs served entirely from a
//!   detection cache.

use crate::{Error, coco::ImageId};
use image::{ColorType, RgbImage};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path};

/// Raw detector output for one image.
///
/// Boxes are `[ymin, xmin, ymax, xmax]` normalized to `[0, 1]`. The three
/// arrays are parallel; backends may pad them beyond `num_detections`
/// with zero-score entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Number of meaningful detections reported by the backend.
    pub num_detections: usize,
    /// Normalized boxes.
    pub boxes: Vec<[f32; 4]>,
    /// Confidence per box.
    pub scores: Vec<f32>,
    /// Detector class per box.
    pub classes: Vec<u32>,
    /// Instance masks, for backends that produce them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masks: Option<Vec<DetectionMask>>,
}

/// Box-relative instance mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMask {
    pub height: u32,
    pub width: u32,
    /// Row-major mask probabilities, `height * width` values.
    pub data: Vec<f32>,
}

impl DetectionResult {
    /// Check the arrays are parallel and `num_detections` fits within them.
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.boxes.len();
        if self.scores.len() != n || self.classes.len() != n {
            return Err(Error::InvalidDetection(format!(
                "{} boxes, {} scores, {} classes",
                n,
                self.scores.len(),
                self.classes.len()
            )));
        }
        if self.num_detections > n {
            return Err(Error::InvalidDetection(format!(
                "num_detections {} exceeds {} boxes",
                self.num_detections, n
            )));
        }
        if let Some(masks) = &self.masks {
            if masks.len() != n {
                return Err(Error::InvalidDetection(format!(
                    "{} masks for {} boxes",
                    masks.len(),
                    n
                )));
            }
            if let Some(mask) = masks
                .iter()
                .find(|m| m.data.len() != (m.height as usize) * (m.width as usize))
            {
                return Err(Error::InvalidDetection(format!(
                    "mask of {}x{} holds {} values",
                    mask.height,
                    mask.width,
                    mask.data.len()
                )));
            }
        }
        Ok(())
    }

    /// Number of entries in the parallel arrays.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// What a detector receives for one image.
#[derive(Debug, Clone, Copy)]
pub struct InferenceInput<'a> {
    /// Source image id.
    pub image_id: &'a ImageId,
    /// File name relative to the image root, as listed in the dataset.
    pub file_name: &'a str,
    /// Decoded pixels.
    pub pixels: &'a RgbImage,
}

/// Black-box object detector.
///
/// Called at most once per image per process; results are cached by the
/// caller. Returning [`Error::DetectionUnavailable`] skips the image
/// without caching anything, any other error aborts the run.
pub trait Detector {
    fn infer(&mut self, input: &InferenceInput<'_>) -> Result<DetectionResult, Error>;
}

impl<D: Detector + ?Sized> Detector for &mut D {
    fn infer(&mut self, input: &InferenceInput<'_>) -> Result<DetectionResult, Error> {
        (**self).infer(input)
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(&mut self, input: &InferenceInput<'_>) -> Result<DetectionResult, Error> {
        (**self).infer(input)
    }
}

/// Detector that never has a result.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDetector;

impl Detector for NoDetector {
    fn infer(&mut self, input: &InferenceInput<'_>) -> Result<DetectionResult, Error> {
        Err(Error::DetectionUnavailable(format!(
            "no detector configured for {}",
            input.file_name
        )))
    }
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    images: Vec<BatchImage>,
}

#[derive(Debug, Deserialize)]
struct BatchImage {
    file: String,
    #[serde(default)]
    detections: Option<Vec<BatchDetection>>,
    #[serde(default)]
    failure: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchDetection {
    category: String,
    conf: f32,
    /// `[x, y, width, height]`, normalized.
    bbox: [f32; 4],
}

/// Detector backed by a MegaDetector-style batch results file.
///
/// Entries are matched on the image file name relative to the image root
/// (separators normalized to `/`).
#[derive(Debug, Clone, Default)]
pub struct BatchResultsDetector {
    results: HashMap<String, Result<DetectionResult, String>>,
}

impl BatchResultsDetector {
    /// Parse a batch results file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref())?;
        let batch: BatchFile = serde_json::from_reader(BufReader::new(file))?;

        let mut results = HashMap::with_capacity(batch.images.len());
        for image in batch.images {
            let key = normalize_file_name(&image.file);
            let entry = match (image.failure, image.detections) {
                (Some(failure), _) => Err(failure),
                (None, detections) => Ok(convert_batch(detections.unwrap_or_default())?),
            };
            results.insert(key, entry);
        }
        debug!(
            "Loaded batch results for {} images from {}",
            results.len(),
            path.as_ref().display()
        );

        Ok(Self { results })
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Detector for BatchResultsDetector {
    fn infer(&mut self, input: &InferenceInput<'_>) -> Result<DetectionResult, Error> {
        match self.results.get(&normalize_file_name(input.file_name)) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(failure)) => Err(Error::DetectionUnavailable(format!(
                "{}: batch failure {}",
                input.file_name, failure
            ))),
            None => Err(Error::DetectionUnavailable(format!(
                "{} is not in the batch results",
                input.file_name
            ))),
        }
    }
}

fn normalize_file_name(name: &str) -> String {
    name.replace('\\', "/")
}

fn convert_batch(detections: Vec<BatchDetection>) -> Result<DetectionResult, Error> {
    let mut result = DetectionResult {
        num_detections: detections.len(),
        ..Default::default()
    };
    for det in detections {
        let class = det.category.parse::<u32>().map_err(|_| {
            Error::InvalidDetection(format!("non-numeric category {:?}", det.category))
        })?;
        let [x, y, w, h] = det.bbox;
        result.boxes.push([y, x, y + h, x + w]);
        result.scores.push(det.conf);
        result.classes.push(class);
    }
    Ok(result)
}

/// Decode an image as 8-bit RGB.
///
/// Returns `Ok(None)` when the file decodes to anything other than 8 bits
/// per channel; such images are not fed to the detector.
pub fn load_rgb8(path: &Path) -> Result<Option<RgbImage>, Error> {
    let image = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    match image.color() {
        ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
            Ok(Some(image.to_rgb8()))
        }
        other => {
            debug!("{} decodes to {:?}", path.display(), other);
            Ok(None)
        }
    }
}
