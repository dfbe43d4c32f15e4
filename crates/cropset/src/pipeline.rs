// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! The per-image loop.
//!
//! [`Pipeline::new`] does all startup work (validation, dataset load,
//! location split, cache hydration) so configuration problems surface
//! before the first image. [`Pipeline::run`] then visits every image in id
//! order:
//!
//! ```text
//! labeling -> exclusion -> cache | (file -> decode -> detector)
//!          -> select_and_pad -> emit -> checkpoint
//! ```
//!
//! Any per-image problem ends that image's visit and the loop moves on.
//! Only configuration, persistence and output errors abort the run.

use crate::{
    Error, Progress,
    cache::{CacheLookup, DetectionCache},
    coco::ImageId,
    config::PipelineConfig,
    detection::{Detector, InferenceInput, load_rgb8},
    emitter::{DatasetEmitter, EmitCounts, EmitRequest, SourcePixels},
    geometry::select_and_pad,
    split::{LocationSplit, SPLIT_SEED, log_split, split_locations},
    store::{AnnotationStore, Labeling},
};
use image::RgbImage;
use log::{debug, info, warn};
use std::{collections::HashSet, fmt, path::Path};

/// Why an image produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// No annotations.
    Unlabeled,
    /// Annotations with more than one category.
    MixedCategories,
    /// Labelled with an excluded category.
    Excluded,
    /// Not cached and the file is not on disk.
    MissingFile,
    /// The file does not decode to 8-bit RGB.
    Unreadable,
    /// The detector had no result.
    DetectionUnavailable,
    /// No detection above the threshold.
    NoDetections,
}

/// Result of visiting one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    Emitted(EmitCounts),
    Skipped(SkipReason),
}

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Images visited.
    pub images: usize,
    /// Images that produced at least one crop.
    pub images_emitted: usize,
    pub cache_hits: usize,
    pub inferences: usize,
    pub crops_written: usize,
    pub crops_reused: usize,
    /// Accepted detections that yielded no crop.
    pub boxes_skipped: usize,
    pub skipped_unlabeled: usize,
    pub skipped_mixed: usize,
    pub skipped_excluded: usize,
    pub skipped_missing: usize,
    pub skipped_unreadable: usize,
    pub skipped_unavailable: usize,
    pub skipped_no_detections: usize,
    pub train_records: usize,
    pub test_records: usize,
    pub train_shards: usize,
    pub test_shards: usize,
    /// Cache checkpoints written during the loop.
    pub checkpoints: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &ImageOutcome) {
        self.images += 1;
        match outcome {
            ImageOutcome::Emitted(counts) => {
                if counts.emitted() > 0 {
                    self.images_emitted += 1;
                }
                self.crops_written += counts.written;
                self.crops_reused += counts.reused;
                self.boxes_skipped += counts.skipped;
            }
            ImageOutcome::Skipped(reason) => {
                let counter = match reason {
                    SkipReason::Unlabeled => &mut self.skipped_unlabeled,
                    SkipReason::MixedCategories => &mut self.skipped_mixed,
                    SkipReason::Excluded => &mut self.skipped_excluded,
                    SkipReason::MissingFile => &mut self.skipped_missing,
                    SkipReason::Unreadable => &mut self.skipped_unreadable,
                    SkipReason::DetectionUnavailable => &mut self.skipped_unavailable,
                    SkipReason::NoDetections => &mut self.skipped_no_detections,
                };
                *counter += 1;
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Images:      {} visited, {} cropped",
            self.images, self.images_emitted
        )?;
        writeln!(
            f,
            "Detections:  {} cached, {} inferred",
            self.cache_hits, self.inferences
        )?;
        writeln!(
            f,
            "Crops:       {} written, {} reused, {} skipped",
            self.crops_written, self.crops_reused, self.boxes_skipped
        )?;
        writeln!(
            f,
            "Skipped:     {} unlabeled, {} mixed, {} excluded, {} missing, {} unreadable, {} unavailable, {} without detections",
            self.skipped_unlabeled,
            self.skipped_mixed,
            self.skipped_excluded,
            self.skipped_missing,
            self.skipped_unreadable,
            self.skipped_unavailable,
            self.skipped_no_detections
        )?;
        write!(
            f,
            "Records:     {} train ({} shards), {} test ({} shards)",
            self.train_records, self.train_shards, self.test_records, self.test_shards
        )
    }
}

/// Dataset construction run.
pub struct Pipeline<D: Detector> {
    config: PipelineConfig,
    detector: D,
    store: AnnotationStore,
    split: LocationSplit,
    excluded: HashSet<u32>,
    cache: DetectionCache,
    emitter: DatasetEmitter,
    missing_reported: bool,
    summary: RunSummary,
}

impl<D: Detector> Pipeline<D> {
    /// Validate the configuration and do every startup step.
    #[cfg_attr(feature = "profiling", tracing::instrument(skip_all))]
    pub fn new(config: PipelineConfig, detector: D) -> Result<Self, Error> {
        config.validate()?;

        let store = AnnotationStore::load(&config.dataset)?;
        store.check_exclusions(&config.exclude_categories)?;
        let excluded = store
            .categories()
            .entries()
            .iter()
            .filter(|c| config.exclude_categories.contains(&c.name))
            .map(|c| c.old_id)
            .collect();

        let locations = store.locations(&config.split_key)?;
        let split = split_locations(&locations, config.test_fraction, SPLIT_SEED);
        log_split(&split);

        let cache = DetectionCache::open(config.detection_cache.as_deref())?;
        config.create_output_dirs()?;
        let emitter = DatasetEmitter::new(config.emitter_options(), store.categories())?;

        Ok(Self {
            config,
            detector,
            store,
            split,
            excluded,
            cache,
            emitter,
            missing_reported: false,
            summary: RunSummary::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn split(&self) -> &LocationSplit {
        &self.split
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    /// Process every image and write the outputs.
    pub fn run(self) -> Result<RunSummary, Error> {
        self.run_with_progress(|_| {})
    }

    /// [`run`](Self::run), reporting progress after each image.
    #[cfg_attr(feature = "profiling", tracing::instrument(skip_all))]
    pub fn run_with_progress<F: FnMut(Progress)>(
        mut self,
        mut progress: F,
    ) -> Result<RunSummary, Error> {
        let image_ids: Vec<ImageId> = self.store.image_ids().cloned().collect();
        let total = image_ids.len();
        info!("Processing {} images", total);

        for (current, image_id) in image_ids.iter().enumerate() {
            let outcome = self.process_image(image_id)?;
            debug!("Image {}: {:?}", image_id, outcome);
            self.summary.record(&outcome);
            progress(Progress {
                current: current + 1,
                total,
            });
            self.checkpoint_if_due()?;
        }

        self.finalize()
    }

    fn process_image(&mut self, image_id: &ImageId) -> Result<ImageOutcome, Error> {
        #[cfg(feature = "profiling")]
        let _span = crate::instrument::debug_span!("image", id = %image_id).entered();

        let image = self
            .store
            .image(image_id)
            .ok_or_else(|| Error::CocoError(format!("Image {} vanished", image_id)))?;

        let category = match self.store.labeling(image_id) {
            Labeling::Single(category) => category,
            Labeling::Unlabeled => return Ok(ImageOutcome::Skipped(SkipReason::Unlabeled)),
            Labeling::Mixed(_) => return Ok(ImageOutcome::Skipped(SkipReason::MixedCategories)),
        };
        if self.excluded.contains(&category.old_id) {
            return Ok(ImageOutcome::Skipped(SkipReason::Excluded));
        }

        let location = self.store.location(image, &self.config.split_key)?;
        let split = self.split.side(&location);
        let path = self.config.image_root.join(&image.file_name);

        let mut pixels = if self.cache.contains(image_id) {
            self.summary.cache_hits += 1;
            SourcePixels::Pending(path)
        } else {
            let source = match read_source(&path, &mut self.missing_reported) {
                Ok(source) => source,
                Err(reason) => return Ok(ImageOutcome::Skipped(reason)),
            };

            let input = InferenceInput {
                image_id,
                file_name: &image.file_name,
                pixels: &source,
            };
            let detector = &mut self.detector;
            match self.cache.get_or_compute(image_id, || detector.infer(&input)) {
                Ok((_, CacheLookup::Miss)) => self.summary.inferences += 1,
                Ok((_, CacheLookup::Hit)) => self.summary.cache_hits += 1,
                Err(Error::DetectionUnavailable(reason)) => {
                    debug!("No detection for {}: {}", image.file_name, reason);
                    return Ok(ImageOutcome::Skipped(SkipReason::DetectionUnavailable));
                }
                Err(err) => return Err(err),
            }
            SourcePixels::Loaded(source)
        };

        let (width, height) = if image.width > 0 && image.height > 0 {
            (image.width, image.height)
        } else {
            match pixels.get() {
                Some(source) => source.dimensions(),
                None => return Ok(ImageOutcome::Skipped(SkipReason::Unreadable)),
            }
        };

        let detection = self.cache.get(image_id).ok_or_else(|| {
            Error::CacheError(format!("Detection for {} missing after insert", image_id))
        })?;
        let candidates = select_and_pad(detection, width, height, &self.config.crop_params());
        if candidates.is_empty() {
            return Ok(ImageOutcome::Skipped(SkipReason::NoDetections));
        }

        let counts = self.emitter.emit(
            &EmitRequest {
                image,
                category,
                split,
                candidates: &candidates,
            },
            &mut pixels,
        )?;
        Ok(ImageOutcome::Emitted(counts))
    }

    fn checkpoint_if_due(&mut self) -> Result<(), Error> {
        let Some(interval) = self.config.checkpoint_interval else {
            return Ok(());
        };
        if self.cache.unsaved() < interval {
            return Ok(());
        }
        if let Some(path) = self.config.cache_output_path() {
            self.cache.persist(&path)?;
            self.summary.checkpoints += 1;
            info!(
                "Checkpointed {} detections to {}",
                self.cache.len(),
                path.display()
            );
        }
        Ok(())
    }

    #[cfg_attr(feature = "profiling", tracing::instrument(skip_all))]
    fn finalize(mut self) -> Result<RunSummary, Error> {
        if let Some(path) = self.config.cache_output_path() {
            self.cache.persist(&path)?;
            info!(
                "Saved {} detections to {}",
                self.cache.len(),
                path.display()
            );
        }

        let emitted = self.emitter.finish()?;
        self.summary.train_records = emitted.train_records;
        self.summary.test_records = emitted.test_records;
        self.summary.train_shards = emitted.train_shards.shards;
        self.summary.test_shards = emitted.test_shards.shards;

        if self.missing_reported {
            warn!(
                "{} images were missing from {}",
                self.summary.skipped_missing,
                self.config.image_root.display()
            );
        }
        Ok(self.summary)
    }
}

/// Decode a source image for inference, reporting the first missing file
/// only.
fn read_source(path: &Path, missing_reported: &mut bool) -> Result<RgbImage, SkipReason> {
    if !path.is_file() {
        if !*missing_reported {
            warn!("Could not find {}", path.display());
            warn!("Suppressing further warnings about missing files");
            *missing_reported = true;
        }
        return Err(SkipReason::MissingFile);
    }

    match load_rgb8(path) {
        Ok(Some(pixels)) => Ok(pixels),
        Ok(None) => {
            warn!("Failed to load image {}: not 8-bit", path.display());
            Err(SkipReason::Unreadable)
        }
        Err(err) => {
            warn!("Failed to load image {}: {}", path.display(), err);
            Err(SkipReason::Unreadable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_record() {
        let mut summary = RunSummary::default();
        summary.record(&ImageOutcome::Emitted(EmitCounts {
            written: 2,
            reused: 1,
            skipped: 1,
        }));
        summary.record(&ImageOutcome::Emitted(EmitCounts {
            skipped: 1,
            ..Default::default()
        }));
        summary.record(&ImageOutcome::Skipped(SkipReason::MixedCategories));
        summary.record(&ImageOutcome::Skipped(SkipReason::MissingFile));
        summary.record(&ImageOutcome::Skipped(SkipReason::MissingFile));

        assert_eq!(summary.images, 5);
        assert_eq!(summary.images_emitted, 1);
        assert_eq!(summary.crops_written, 2);
        assert_eq!(summary.crops_reused, 1);
        assert_eq!(summary.boxes_skipped, 2);
        assert_eq!(summary.skipped_mixed, 1);
        assert_eq!(summary.skipped_missing, 2);

        let text = summary.to_string();
        assert!(text.contains("2 written, 1 reused, 2 skipped"));
        assert!(text.contains("2 missing"));
    }

    #[test]
    fn test_missing_file_reported_once() {
        let mut reported = false;
        let path = Path::new("/nonexistent/a.jpg");
        assert_eq!(
            read_source(path, &mut reported).unwrap_err(),
            SkipReason::MissingFile
        );
        assert!(reported);
        assert_eq!(
            read_source(path, &mut reported).unwrap_err(),
            SkipReason::MissingFile
        );
    }
}
