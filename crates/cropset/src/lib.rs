// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! # Cropset
//!
//! Cropset turns a camera-trap image collection annotated in COCO-style
//! JSON into a cropped, per-animal classification dataset, using the boxes
//! of an external object detector.
//!
//! ## Features
//!
//! - **Location split**: whole camera locations go to either train or
//!   test, drawn with a fixed seed so re-runs agree
//! - **Resumable detection**: detector output is cached per image and
//!   persisted, so a re-run only infers what is new
//! - **Square padded crops**: each confident detection becomes a square
//!   crop around the animal
//! - **Two output modes**: a COCO-style crop tree with `train.json` /
//!   `test.json`, and/or JSON Lines shards with a label map
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cropset::{BatchResultsDetector, Error, Pipeline, PipelineConfig};
//!
//! fn main() -> Result<(), Error> {
//!     let mut config = PipelineConfig::new("CaltechCameraTraps.json", "cct_images");
//!     config.coco_output = Some("cct_crops".into());
//!
//!     let detector = BatchResultsDetector::from_file("md_results.json")?;
//!     let summary = Pipeline::new(config, detector)?.run()?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `profiling`: `tracing` spans around the pipeline stages

pub mod cache;
pub mod coco;
pub mod config;
pub mod detection;
pub mod emitter;
mod error;
pub mod geometry;
mod instrument;
pub mod pipeline;
pub mod shard;
pub mod split;
pub mod store;

pub use crate::{
    cache::DetectionCache,
    config::PipelineConfig,
    detection::{BatchResultsDetector, DetectionResult, Detector, InferenceInput, NoDetector},
    error::Error,
    geometry::ClampMode,
    pipeline::{ImageOutcome, Pipeline, RunSummary, SkipReason},
};

/// Progress of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Number of completed items.
    pub current: usize,
    /// Total number of items to process.
    pub total: usize,
}
