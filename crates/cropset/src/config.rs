// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Run configuration.
//!
//! Settings are layered with the `config` crate, lowest precedence first:
//!
//! 1. an optional settings file (TOML, JSON or YAML by extension)
//! 2. environment variables prefixed with `CROPSET_`, e.g.
//!    `CROPSET_TEST_FRACTION=0.3` or `CROPSET_EXCLUDE_CATEGORIES=empty,car`
//! 3. explicit overrides set on the builder (the CLI flags)
//!
//! ```rust,no_run
//! use cropset::PipelineConfig;
//!
//! let builder = PipelineConfig::builder(None)?
//!     .set_override("dataset", "cct.json")?
//!     .set_override("image_root", "images")?
//!     .set_override("coco_output", "out")?;
//! let config = PipelineConfig::from_builder(builder)?;
//! config.validate()?;
//! # Ok::<(), cropset::Error>(())
//! ```

use crate::{
    Error,
    emitter::EmitterOptions,
    geometry::{ClampMode, CropParams},
};
use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of the environment variables read by [`PipelineConfig::builder`].
pub const ENV_PREFIX: &str = "CROPSET";

/// File name of the detection cache written into the output directory.
pub const CACHE_FILE_NAME: &str = "detections_final.json";

fn default_split_key() -> String {
    "location".to_string()
}

fn default_detection_threshold() -> f32 {
    0.5
}

fn default_padding_factor() -> f64 {
    1.3 * 1.3
}

fn default_test_fraction() -> f64 {
    0.2
}

fn default_images_per_shard() -> usize {
    200
}

/// Everything a run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// COCO JSON document, or a ZIP archive holding one.
    pub dataset: PathBuf,
    /// Directory the image `file_name`s are relative to.
    pub image_root: PathBuf,
    /// Output directory for crops and `train.json` / `test.json`.
    #[serde(default)]
    pub coco_output: Option<PathBuf>,
    /// Output directory for shard files and `label_map.pbtxt`.
    #[serde(default)]
    pub shard_output: Option<PathBuf>,
    /// Image field whose values are the split locations.
    #[serde(default = "default_split_key")]
    pub split_key: String,
    /// Category names whose images are skipped.
    #[serde(default)]
    pub exclude_categories: Vec<String>,
    /// Detections must score strictly above this to be cropped.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,
    /// Crop side relative to the longer detection side.
    #[serde(default = "default_padding_factor")]
    pub padding_factor: f64,
    /// Share of locations drawn for the test split.
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    /// Records per shard file.
    #[serde(default = "default_images_per_shard")]
    pub images_per_shard: usize,
    /// Detection cache of a previous run to start from.
    #[serde(default)]
    pub detection_cache: Option<PathBuf>,
    #[serde(default)]
    pub clamp: ClampMode,
    /// Persist the detection cache after this many new inferences.
    #[serde(default)]
    pub checkpoint_interval: Option<usize>,
    /// Indent the output JSON documents.
    #[serde(default)]
    pub pretty_json: bool,
}

impl PipelineConfig {
    /// Configuration with every optional setting at its default.
    pub fn new(dataset: impl Into<PathBuf>, image_root: impl Into<PathBuf>) -> Self {
        Self {
            dataset: dataset.into(),
            image_root: image_root.into(),
            coco_output: None,
            shard_output: None,
            split_key: default_split_key(),
            exclude_categories: Vec::new(),
            detection_threshold: default_detection_threshold(),
            padding_factor: default_padding_factor(),
            test_fraction: default_test_fraction(),
            images_per_shard: default_images_per_shard(),
            detection_cache: None,
            clamp: ClampMode::default(),
            checkpoint_interval: None,
            pretty_json: false,
        }
    }

    /// Builder with the settings file (if any) and the environment layered
    /// in. Add overrides, then pass it to [`from_builder`](Self::from_builder).
    pub fn builder(file: Option<&Path>) -> Result<ConfigBuilder<DefaultState>, Error> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            if !file.exists() {
                return Err(Error::MissingPath(file.to_path_buf()));
            }
            builder = builder.add_source(File::from(file));
        }
        Ok(builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("exclude_categories"),
        ))
    }

    /// Resolve the layered sources into a configuration. Does not validate.
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, Error> {
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Reject every configuration problem that can be found before the
    /// dataset is loaded.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.dataset.is_file() {
            return Err(Error::MissingPath(self.dataset.clone()));
        }
        if !self.image_root.is_dir() {
            return Err(Error::MissingPath(self.image_root.clone()));
        }
        if let Some(cache) = &self.detection_cache
            && !cache.is_file()
        {
            return Err(Error::MissingPath(cache.clone()));
        }

        if self.coco_output.is_none() && self.shard_output.is_none() {
            return Err(Error::InvalidParameters(
                "Please specify at least one of coco_output or shard_output".to_string(),
            ));
        }
        if self.split_key.is_empty() {
            return Err(Error::InvalidParameters(
                "split_key must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(Error::InvalidParameters(format!(
                "detection_threshold must be in [0, 1], got {}",
                self.detection_threshold
            )));
        }
        if !self.padding_factor.is_finite() || self.padding_factor < 1.0 {
            return Err(Error::InvalidParameters(format!(
                "padding_factor must be at least 1, got {}",
                self.padding_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.test_fraction) {
            return Err(Error::InvalidParameters(format!(
                "test_fraction must be in [0, 1], got {}",
                self.test_fraction
            )));
        }
        if self.images_per_shard == 0 {
            return Err(Error::InvalidParameters(
                "images_per_shard must be positive".to_string(),
            ));
        }
        if self.checkpoint_interval == Some(0) {
            return Err(Error::InvalidParameters(
                "checkpoint_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Where the detection cache is written at the end of the run.
    pub fn cache_output_path(&self) -> Option<PathBuf> {
        self.coco_output
            .as_ref()
            .or(self.shard_output.as_ref())
            .map(|dir| dir.join(CACHE_FILE_NAME))
    }

    /// Create the requested output directories.
    pub fn create_output_dirs(&self) -> Result<(), Error> {
        for dir in [&self.coco_output, &self.shard_output].into_iter().flatten() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn crop_params(&self) -> CropParams {
        CropParams {
            threshold: self.detection_threshold,
            padding_factor: self.padding_factor,
            clamp: self.clamp,
        }
    }

    pub fn emitter_options(&self) -> EmitterOptions {
        EmitterOptions {
            coco_output: self.coco_output.clone(),
            shard_output: self.shard_output.clone(),
            images_per_shard: self.images_per_shard,
            pretty_json: self.pretty_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PipelineConfig) {
        let temp_dir = TempDir::new().unwrap();
        let dataset = temp_dir.path().join("dataset.json");
        std::fs::write(&dataset, "{}").unwrap();
        let images = temp_dir.path().join("images");
        std::fs::create_dir(&images).unwrap();

        let mut config = PipelineConfig::new(dataset, images);
        config.coco_output = Some(temp_dir.path().join("out"));
        (temp_dir, config)
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new("a.json", "images");
        assert_eq!(config.split_key, "location");
        assert_eq!(config.detection_threshold, 0.5);
        assert!((config.padding_factor - 1.69).abs() < 1e-12);
        assert_eq!(config.test_fraction, 0.2);
        assert_eq!(config.images_per_shard, 200);
        assert_eq!(config.clamp, ClampMode::LowerOnly);
        assert_eq!(config.cache_output_path(), None);
    }

    #[test]
    fn test_validate() {
        let (_temp_dir, config) = fixture();
        config.validate().unwrap();

        let mut no_output = config.clone();
        no_output.coco_output = None;
        assert!(matches!(
            no_output.validate(),
            Err(Error::InvalidParameters(_))
        ));

        let mut bad = config.clone();
        bad.padding_factor = 0.9;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.test_fraction = 1.5;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.detection_threshold = -0.1;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.images_per_shard = 0;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.checkpoint_interval = Some(0);
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.detection_cache = Some(PathBuf::from("/nonexistent/cache.json"));
        assert!(matches!(bad.validate(), Err(Error::MissingPath(_))));

        let mut bad = config;
        bad.image_root = PathBuf::from("/nonexistent/images");
        assert!(matches!(bad.validate(), Err(Error::MissingPath(_))));
    }

    #[test]
    fn test_cache_output_path() {
        let mut config = PipelineConfig::new("a.json", "images");
        config.shard_output = Some(PathBuf::from("shards"));
        assert_eq!(
            config.cache_output_path(),
            Some(PathBuf::from("shards/detections_final.json"))
        );
        config.coco_output = Some(PathBuf::from("coco"));
        assert_eq!(
            config.cache_output_path(),
            Some(PathBuf::from("coco/detections_final.json"))
        );
    }

    #[test]
    fn test_file_and_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cropset.toml");
        std::fs::write(
            &path,
            r#"
dataset = "cct.json"
image_root = "images"
shard_output = "shards"
exclude_categories = ["empty", "car"]
test_fraction = 0.3
clamp = "image_bounds"
"#,
        )
        .unwrap();

        let builder = PipelineConfig::builder(Some(&path))
            .unwrap()
            .set_override("test_fraction", 0.4)
            .unwrap()
            .set_override_option("images_per_shard", Some(50i64))
            .unwrap()
            .set_override_option("coco_output", None::<String>)
            .unwrap();
        let config = PipelineConfig::from_builder(builder).unwrap();

        assert_eq!(config.dataset, PathBuf::from("cct.json"));
        assert_eq!(config.shard_output, Some(PathBuf::from("shards")));
        assert_eq!(config.coco_output, None);
        assert_eq!(config.exclude_categories, vec!["empty", "car"]);
        assert_eq!(config.test_fraction, 0.4);
        assert_eq!(config.images_per_shard, 50);
        assert_eq!(config.clamp, ClampMode::ImageBounds);
        assert_eq!(config.split_key, "location");
    }

    #[test]
    fn test_missing_settings_file() {
        assert!(matches!(
            PipelineConfig::builder(Some(Path::new("/nonexistent/cropset.toml"))),
            Err(Error::MissingPath(_))
        ));
    }

    #[test]
    fn test_create_output_dirs() {
        let (temp_dir, mut config) = fixture();
        config.shard_output = Some(temp_dir.path().join("nested/shards"));
        config.create_output_dirs().unwrap();
        assert!(temp_dir.path().join("out").is_dir());
        assert!(temp_dir.path().join("nested/shards").is_dir());
    }
}
