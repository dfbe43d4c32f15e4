// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, Subcommand};
use cropset::{
    BatchResultsDetector, ClampMode, Detector, Error, NoDetector, Pipeline, PipelineConfig,
    Progress,
    split::{SPLIT_SEED, split_locations},
    store::AnnotationStore,
};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML, JSON or YAML). Flags override it, and
    /// CROPSET_* environment variables sit in between.
    #[clap(long, env = "CROPSET_CONFIG_FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Build the cropped classification dataset.
    Build(BuildArgs),
    /// Print the train/test location split of a dataset without building.
    Split {
        /// COCO JSON document or ZIP archive holding one
        dataset: PathBuf,

        /// Image field to split by
        #[clap(long, default_value = "location")]
        split_key: String,

        /// Share of locations drawn for testing
        #[clap(long, default_value_t = 0.2)]
        test_fraction: f64,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct BuildArgs {
    /// COCO JSON document or ZIP archive holding one
    #[clap(long)]
    dataset: Option<PathBuf>,

    /// Directory the image file names are relative to
    #[clap(long)]
    image_root: Option<PathBuf>,

    /// Output directory for crops and train.json / test.json
    #[clap(long)]
    coco_output: Option<PathBuf>,

    /// Output directory for shard files and label_map.pbtxt
    #[clap(long)]
    shard_output: Option<PathBuf>,

    /// Image field to split by [default: location]
    #[clap(long)]
    split_key: Option<String>,

    /// Category names to leave out
    #[clap(long, value_delimiter = ',')]
    exclude_categories: Vec<String>,

    /// Minimum detection score, exclusive [default: 0.5]
    #[clap(long)]
    detection_threshold: Option<f64>,

    /// Crop side relative to the longer box side [default: 1.69]
    #[clap(long)]
    padding_factor: Option<f64>,

    /// Share of locations drawn for testing [default: 0.2]
    #[clap(long)]
    test_fraction: Option<f64>,

    /// Records per shard file [default: 200]
    #[clap(long)]
    images_per_shard: Option<u32>,

    /// Detection cache of a previous run
    #[clap(long)]
    detection_cache: Option<PathBuf>,

    /// MegaDetector batch results used as the detector. Without it only
    /// cached detections are used.
    #[clap(long)]
    detector_results: Option<PathBuf>,

    /// Crop clamping: lower_only or image_bounds [default: lower_only]
    #[clap(long)]
    clamp: Option<ClampMode>,

    /// Persist the detection cache after this many new detections
    #[clap(long)]
    checkpoint_interval: Option<u32>,

    /// Indent the output JSON
    #[clap(long)]
    pretty: bool,
}

fn path_value(path: Option<PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

fn build_config(config_file: Option<PathBuf>, args: &BuildArgs) -> Result<PipelineConfig, Error> {
    let mut builder = PipelineConfig::builder(config_file.as_deref())?
        .set_override_option("dataset", path_value(args.dataset.clone()))?
        .set_override_option("image_root", path_value(args.image_root.clone()))?
        .set_override_option("coco_output", path_value(args.coco_output.clone()))?
        .set_override_option("shard_output", path_value(args.shard_output.clone()))?
        .set_override_option("split_key", args.split_key.clone())?
        .set_override_option("detection_threshold", args.detection_threshold)?
        .set_override_option("padding_factor", args.padding_factor)?
        .set_override_option("test_fraction", args.test_fraction)?
        .set_override_option("images_per_shard", args.images_per_shard.map(i64::from))?
        .set_override_option("detection_cache", path_value(args.detection_cache.clone()))?
        .set_override_option("clamp", args.clamp.map(|c| c.as_str()))?
        .set_override_option(
            "checkpoint_interval",
            args.checkpoint_interval.map(i64::from),
        )?;
    if !args.exclude_categories.is_empty() {
        builder = builder.set_override("exclude_categories", args.exclude_categories.clone())?;
    }
    if args.pretty {
        builder = builder.set_override("pretty_json", true)?;
    }
    PipelineConfig::from_builder(builder)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise} ETA: {eta}] Cropping: {wide_bar:.yellow} {human_pos}/{human_len}",
    ) {
        bar.set_style(style.progress_chars("█▇▆▅▄▃▂▁  "));
    }
    bar
}

fn handle_build(config_file: Option<PathBuf>, args: BuildArgs) -> Result<(), Error> {
    let config = build_config(config_file, &args)?;

    let detector: Box<dyn Detector> = match &args.detector_results {
        Some(path) => {
            let detector = BatchResultsDetector::from_file(path)?;
            log::info!(
                "Using batch results for {} images from {}",
                detector.len(),
                path.display()
            );
            Box::new(detector)
        }
        None => {
            log::info!("No detector results given, using cached detections only");
            Box::new(NoDetector)
        }
    };

    let pipeline = Pipeline::new(config, detector)?;
    let bar = progress_bar();
    let summary = pipeline.run_with_progress(|progress: Progress| {
        if progress.total > 0 {
            bar.set_length(progress.total as u64);
            bar.set_position(progress.current as u64);
        }
    })?;
    bar.finish_and_clear();

    println!("{}", summary);
    Ok(())
}

fn handle_split(dataset: PathBuf, split_key: String, test_fraction: f64) -> Result<(), Error> {
    if !(0.0..=1.0).contains(&test_fraction) {
        return Err(Error::InvalidParameters(format!(
            "test_fraction must be in [0, 1], got {}",
            test_fraction
        )));
    }

    let store = AnnotationStore::load(&dataset)?;
    let locations = store.locations(&split_key)?;
    let split = split_locations(&locations, test_fraction, SPLIT_SEED);

    println!("Locations: {}", locations.len());
    println!("Train ({}): {}", split.train.len(), split.train.iter().join(", "));
    println!("Test ({}): {}", split.test.len(), split.test.iter().join(", "));
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    #[cfg(feature = "profiling")]
    let _tracing = {
        use tracing_subscriber::util::SubscriberInitExt as _;
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish()
            .set_default()
    };

    let args = Args::parse();
    match args.cmd {
        Command::Build(build) => handle_build(args.config, build),
        Command::Split {
            dataset,
            split_key,
            test_fraction,
        } => handle_split(dataset, split_key, test_fraction),
    }
}
