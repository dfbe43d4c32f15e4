// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Crop writing and output accumulation.
//!
//! [`DatasetEmitter`] owns everything the run produces: the id counters,
//! the growing train/test classification documents, the crop tree under
//! the COCO output directory and the per-split shard writers.
//!
//! Crops land at `<coco_output>/<category>/<file_name>`. When one source
//! image yields several crops the box index is inserted before the
//! extension (`img_0.jpg`, `img_1.jpg`). A crop file that already exists
//! is reused as is and only probed for its size.

use crate::{
    Error,
    coco::{
        ClassificationAnnotation, ClassificationDataset, ClassificationImage, CocoImage,
        CocoWriteOptions, CocoWriter,
    },
    detection::load_rgb8,
    geometry::CropCandidate,
    shard::{
        JsonLinesShardWriter, LABEL_MAP_FILE, ShardClass, ShardRecord, ShardStats, ShardWriter,
        write_label_map,
    },
    split::Split,
    store::{CategoryEntry, CategoryMap},
};
use image::{ImageFormat, RgbImage};
use log::{debug, info, warn};
use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Process-wide id counters shared by the train and test outputs.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next_image_id: u64,
    next_annotation_id: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_image_id(&mut self) -> u64 {
        let id = self.next_image_id;
        self.next_image_id += 1;
        id
    }

    pub fn next_annotation_id(&mut self) -> u64 {
        let id = self.next_annotation_id;
        self.next_annotation_id += 1;
        id
    }
}

/// Where and how the emitter writes.
#[derive(Debug, Clone, Default)]
pub struct EmitterOptions {
    /// Root of the crop tree and of `train.json` / `test.json`.
    pub coco_output: Option<PathBuf>,
    /// Directory of the shard files and the label map.
    pub shard_output: Option<PathBuf>,
    pub images_per_shard: usize,
    pub pretty_json: bool,
}

/// Source pixels of the image being emitted, decoded on first use.
#[derive(Debug)]
pub enum SourcePixels {
    Loaded(RgbImage),
    Pending(PathBuf),
    Unavailable,
}

impl SourcePixels {
    /// Decoded pixels, or `None` if the source cannot be read as 8-bit RGB.
    pub fn get(&mut self) -> Option<&RgbImage> {
        if let SourcePixels::Pending(path) = self {
            let next = match load_rgb8(path) {
                Ok(Some(pixels)) => SourcePixels::Loaded(pixels),
                Ok(None) => {
                    warn!("Failed to load image {}: not 8-bit", path.display());
                    SourcePixels::Unavailable
                }
                Err(err) => {
                    warn!("Failed to load image {}: {}", path.display(), err);
                    SourcePixels::Unavailable
                }
            };
            *self = next;
        }
        match &*self {
            SourcePixels::Loaded(pixels) => Some(pixels),
            _ => None,
        }
    }
}

/// One labelled source image and its accepted detections.
#[derive(Debug, Clone, Copy)]
pub struct EmitRequest<'a> {
    pub image: &'a CocoImage,
    pub category: &'a CategoryEntry,
    pub split: Split,
    pub candidates: &'a [CropCandidate],
}

/// Per-image crop counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitCounts {
    /// Crops cut and encoded in this run.
    pub written: usize,
    /// Crops already on disk from an earlier run.
    pub reused: usize,
    /// Boxes dropped because no crop could be produced.
    pub skipped: usize,
}

impl EmitCounts {
    pub fn emitted(&self) -> usize {
        self.written + self.reused
    }
}

/// Totals reported by [`DatasetEmitter::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub train_records: usize,
    pub test_records: usize,
    pub train_shards: ShardStats,
    pub test_shards: ShardStats,
}

struct SplitShards {
    train: Box<dyn ShardWriter>,
    test: Box<dyn ShardWriter>,
}

impl SplitShards {
    fn writer(&mut self, split: Split) -> &mut dyn ShardWriter {
        match split {
            Split::Train => self.train.as_mut(),
            Split::Test => self.test.as_mut(),
        }
    }
}

struct Crop {
    width: u32,
    height: u32,
    format: ImageFormat,
    encoded: Option<Vec<u8>>,
    reused: bool,
}

/// Writes crops and accumulates the classification outputs.
pub struct DatasetEmitter {
    options: EmitterOptions,
    categories: CategoryMap,
    ids: IdAllocator,
    train: ClassificationDataset,
    test: ClassificationDataset,
    shards: Option<SplitShards>,
}

impl DatasetEmitter {
    /// Emitter for the given outputs. Shard files are opened lazily.
    pub fn new(options: EmitterOptions, categories: &CategoryMap) -> Result<Self, Error> {
        let shards = match &options.shard_output {
            Some(dir) => Some(SplitShards {
                train: Box::new(JsonLinesShardWriter::new(
                    dir,
                    Split::Train.as_str(),
                    options.images_per_shard,
                )?),
                test: Box::new(JsonLinesShardWriter::new(
                    dir,
                    Split::Test.as_str(),
                    options.images_per_shard,
                )?),
            }),
            None => None,
        };

        let output_categories = categories.output_categories();
        Ok(Self {
            options,
            categories: categories.clone(),
            ids: IdAllocator::new(),
            train: ClassificationDataset {
                categories: output_categories.clone(),
                ..Default::default()
            },
            test: ClassificationDataset {
                categories: output_categories,
                ..Default::default()
            },
            shards,
        })
    }

    pub fn train(&self) -> &ClassificationDataset {
        &self.train
    }

    pub fn test(&self) -> &ClassificationDataset {
        &self.test
    }

    /// Cut, write and record every candidate of one source image.
    ///
    /// A box that yields no crop is skipped with a warning; ids are only
    /// consumed by boxes that produce a record.
    pub fn emit(
        &mut self,
        request: &EmitRequest<'_>,
        pixels: &mut SourcePixels,
    ) -> Result<EmitCounts, Error> {
        let mut counts = EmitCounts::default();
        let total = request.candidates.len();

        for (index, candidate) in request.candidates.iter().enumerate() {
            let box_index = (total > 1).then_some(index);
            let file_name =
                crop_file_name(&request.category.name, &request.image.file_name, box_index);

            let Some(crop) = self.produce_crop(&file_name, candidate, pixels)? else {
                counts.skipped += 1;
                continue;
            };
            if crop.reused {
                counts.reused += 1;
            } else {
                counts.written += 1;
            }

            self.record(request, file_name, crop)?;
        }

        Ok(counts)
    }

    fn produce_crop(
        &self,
        file_name: &str,
        candidate: &CropCandidate,
        pixels: &mut SourcePixels,
    ) -> Result<Option<Crop>, Error> {
        let destination = self
            .options
            .coco_output
            .as_ref()
            .map(|root| root.join(file_name));
        let need_bytes = self.shards.is_some();

        if let Some(dest) = &destination
            && dest.exists()
        {
            match reuse_crop(dest, need_bytes) {
                Ok(Some(crop)) => {
                    debug!("Reusing {}", dest.display());
                    return Ok(Some(crop));
                }
                Ok(None) => warn!("Rewriting truncated crop {}", dest.display()),
                Err(err) => warn!("Rewriting unreadable crop {}: {}", dest.display(), err),
            }
        }

        let Some(source) = pixels.get() else {
            return Ok(None);
        };
        let Some(region) = candidate.crop.within(source.width(), source.height()) else {
            warn!(
                "Skipping empty crop {} for {}",
                candidate.crop, file_name
            );
            return Ok(None);
        };

        let cropped = image::imageops::crop_imm(
            source,
            region.left,
            region.top,
            region.width(),
            region.height(),
        )
        .to_image();

        let format = encoding_for(file_name);
        let mut encoded = Vec::new();
        if let Err(err) = cropped.write_to(&mut Cursor::new(&mut encoded), format) {
            warn!("Failed to encode crop {}: {}", file_name, err);
            return Ok(None);
        }

        if let Some(dest) = &destination {
            let dir = match dest.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir)?;
            if let Err(err) = write_atomic(dest, dir, &encoded) {
                warn!("Failed to write crop {}: {}", dest.display(), err);
                return Ok(None);
            }
        }

        Ok(Some(Crop {
            width: region.width(),
            height: region.height(),
            format,
            encoded: need_bytes.then_some(encoded),
            reused: false,
        }))
    }

    fn record(&mut self, request: &EmitRequest<'_>, file_name: String, crop: Crop) -> Result<(), Error> {
        let image_id = self.ids.next_image_id();
        let annotation_id = self.ids.next_annotation_id();
        debug!(
            "{} crop {} -> {} ({}x{})",
            request.split, image_id, file_name, crop.width, crop.height
        );

        if let Some(shards) = self.shards.as_mut() {
            shards.writer(request.split).add(&ShardRecord {
                id: image_id,
                class: ShardClass {
                    label: request.category.new_id,
                    text: request.category.name.clone(),
                },
                height: crop.height,
                width: crop.width,
                filename: file_name.clone(),
                format: format_name(crop.format).to_string(),
                encoded: crop.encoded.unwrap_or_default(),
            })?;
        }

        let dataset = match request.split {
            Split::Train => &mut self.train,
            Split::Test => &mut self.test,
        };
        dataset.images.push(ClassificationImage {
            id: image_id,
            width: crop.width,
            height: crop.height,
            file_name,
            original_image_id: request.image.id.clone(),
        });
        dataset.annotations.push(ClassificationAnnotation {
            id: annotation_id,
            image_id,
            category_id: request.category.new_id,
        });
        Ok(())
    }

    /// Close the shards and write the label map and JSON documents.
    pub fn finish(&mut self) -> Result<EmitSummary, Error> {
        let mut summary = EmitSummary {
            train_records: self.train.images.len(),
            test_records: self.test.images.len(),
            ..Default::default()
        };

        if let Some(shards) = self.shards.as_mut() {
            summary.train_shards = shards.train.close()?;
            summary.test_shards = shards.test.close()?;
        }
        if let Some(dir) = &self.options.shard_output {
            write_label_map(dir.join(LABEL_MAP_FILE), &self.categories)?;
        }

        if let Some(dir) = &self.options.coco_output {
            let writer = CocoWriter::with_options(CocoWriteOptions {
                pretty: self.options.pretty_json,
            });
            writer.write_json(&self.train, dir.join("train.json"))?;
            writer.write_json(&self.test, dir.join("test.json"))?;
            info!(
                "Wrote {} training and {} testing crops to {}",
                summary.train_records,
                summary.test_records,
                dir.display()
            );
        }

        Ok(summary)
    }
}

/// Relative crop path: `category/file_name`, with `_<box_index>` before the
/// extension when the image yields several crops.
pub fn crop_file_name(category: &str, file_name: &str, box_index: Option<usize>) -> String {
    let relative = format!("{}/{}", category, file_name);
    let Some(index) = box_index else {
        return relative;
    };

    let base_start = relative.rfind('/').map_or(0, |i| i + 1);
    match relative[base_start..].rfind('.') {
        Some(dot) if !relative[base_start..base_start + dot].trim_start_matches('.').is_empty() => {
            let split_at = base_start + dot;
            format!("{}_{}{}", &relative[..split_at], index, &relative[split_at..])
        }
        _ => format!("{}_{}", relative, index),
    }
}

/// Encoding of a crop. PNG sources stay PNG; every other extension,
/// including `.tif` and `.bmp`, is written as JPEG under its original name.
fn encoding_for(file_name: &str) -> ImageFormat {
    match ImageFormat::from_path(file_name) {
        Ok(ImageFormat::Png) => ImageFormat::Png,
        _ => ImageFormat::Jpeg,
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        _ => "jpeg",
    }
}

/// Write a crop through a temporary file in the destination directory so an
/// interrupted run never leaves a partial crop behind.
fn write_atomic(dest: &Path, dir: &Path, bytes: &[u8]) -> Result<(), Error> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.persist(dest)?;
    Ok(())
}

/// Whether `bytes` hold a complete encoded image, not just a valid header.
fn is_complete(bytes: &[u8], format: ImageFormat) -> bool {
    const JPEG_EOI: [u8; 2] = [0xff, 0xd9];
    const PNG_IEND: [u8; 8] = [0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82];
    match format {
        ImageFormat::Jpeg => bytes.ends_with(&JPEG_EOI),
        ImageFormat::Png => bytes.ends_with(&PNG_IEND),
        _ => image::load_from_memory(bytes).is_ok(),
    }
}

/// Size of an existing crop, or `None` if the file is truncated.
fn reuse_crop(path: &Path, need_bytes: bool) -> Result<Option<Crop>, Error> {
    let bytes = std::fs::read(path)?;
    let size = imagesize::blob_size(&bytes)?;
    let format = image::guess_format(&bytes)
        .unwrap_or_else(|_| encoding_for(&path.to_string_lossy()));
    if !is_complete(&bytes, format) {
        return Ok(None);
    }

    Ok(Some(Crop {
        width: size.width as u32,
        height: size.height as u32,
        format,
        encoded: need_bytes.then_some(bytes),
        reused: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coco::{CocoCategory, RecordId},
        geometry::{CropBox, PixelBox},
    };
    use image::Rgb;
    use tempfile::TempDir;

    fn categories() -> CategoryMap {
        CategoryMap::from_categories(&[
            CocoCategory {
                id: 7,
                name: "deer".to_string(),
                supercategory: None,
            },
            CocoCategory {
                id: 3,
                name: "fox".to_string(),
                supercategory: None,
            },
        ])
    }

    fn source_image() -> CocoImage {
        CocoImage {
            id: RecordId::from("cam1_001"),
            width: 40,
            height: 30,
            file_name: "cam1/001.jpg".to_string(),
            ..Default::default()
        }
    }

    fn candidate(index: usize, crop: CropBox) -> CropCandidate {
        CropCandidate {
            index,
            detection: PixelBox {
                ymin: crop.top as f64,
                xmin: crop.left as f64,
                ymax: crop.bottom as f64,
                xmax: crop.right as f64,
            },
            crop,
            score: 0.9,
            class: 1,
        }
    }

    fn crop(top: u32, left: u32, bottom: u32, right: u32) -> CropBox {
        CropBox {
            top,
            left,
            bottom,
            right,
        }
    }

    fn pixels() -> SourcePixels {
        SourcePixels::Loaded(RgbImage::from_pixel(40, 30, Rgb([90, 120, 30])))
    }

    #[test]
    fn test_id_allocator_is_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next_image_id(), 0);
        assert_eq!(ids.next_image_id(), 1);
        assert_eq!(ids.next_annotation_id(), 0);
        assert_eq!(ids.next_image_id(), 2);
    }

    #[test]
    fn test_crop_file_name() {
        assert_eq!(crop_file_name("deer", "a/b.jpg", None), "deer/a/b.jpg");
        assert_eq!(crop_file_name("deer", "a/b.jpg", Some(0)), "deer/a/b_0.jpg");
        assert_eq!(
            crop_file_name("deer", "a.dir/b.tar.jpg", Some(2)),
            "deer/a.dir/b.tar_2.jpg"
        );
        assert_eq!(crop_file_name("deer", "a.dir/noext", Some(1)), "deer/a.dir/noext_1");
        assert_eq!(crop_file_name("deer", ".hidden", Some(1)), "deer/.hidden_1");
    }

    #[test]
    fn test_emit_coco_records() {
        let temp_dir = TempDir::new().unwrap();
        let categories = categories();
        let mut emitter = DatasetEmitter::new(
            EmitterOptions {
                coco_output: Some(temp_dir.path().to_path_buf()),
                images_per_shard: 10,
                ..Default::default()
            },
            &categories,
        )
        .unwrap();

        let image = source_image();
        let fox = categories.get(3).unwrap();
        let candidates = [candidate(0, crop(0, 0, 10, 20)), candidate(3, crop(5, 30, 50, 50))];
        let counts = emitter
            .emit(
                &EmitRequest {
                    image: &image,
                    category: fox,
                    split: Split::Test,
                    candidates: &candidates,
                },
                &mut pixels(),
            )
            .unwrap();
        assert_eq!(counts.written, 2);

        let test = emitter.test();
        assert!(emitter.train().images.is_empty());
        assert_eq!(test.categories.len(), 2);
        assert_eq!(test.images[0].file_name, "fox/cam1/001_0.jpg");
        assert_eq!(test.images[1].file_name, "fox/cam1/001_1.jpg");
        assert_eq!((test.images[0].width, test.images[0].height), (20, 10));
        // Truncated at the image edge
        assert_eq!((test.images[1].width, test.images[1].height), (10, 25));
        assert_eq!(test.annotations[1].category_id, 1);
        assert_eq!(test.annotations[1].image_id, test.images[1].id);
        assert_eq!(test.images[1].original_image_id, image.id);

        let written = temp_dir.path().join("fox/cam1/001_1.jpg");
        assert_eq!(imagesize::size(&written).unwrap().width, 10);

        emitter.finish().unwrap();
        let restored: ClassificationDataset =
            serde_json::from_str(&std::fs::read_to_string(temp_dir.path().join("test.json")).unwrap())
                .unwrap();
        assert_eq!(&restored, emitter.test());
        assert!(temp_dir.path().join("train.json").exists());
    }

    #[test]
    fn test_existing_crop_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let categories = categories();
        let existing = temp_dir.path().join("deer/cam1/001.jpg");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        RgbImage::new(13, 17).save(&existing).unwrap();

        let mut emitter = DatasetEmitter::new(
            EmitterOptions {
                coco_output: Some(temp_dir.path().to_path_buf()),
                images_per_shard: 10,
                ..Default::default()
            },
            &categories,
        )
        .unwrap();

        let image = source_image();
        let candidates = [candidate(0, crop(0, 0, 10, 10))];
        let mut unavailable = SourcePixels::Unavailable;
        let counts = emitter
            .emit(
                &EmitRequest {
                    image: &image,
                    category: categories.get(7).unwrap(),
                    split: Split::Train,
                    candidates: &candidates,
                },
                &mut unavailable,
            )
            .unwrap();

        assert_eq!(counts.reused, 1);
        let train = emitter.train();
        assert_eq!(train.images[0].file_name, "deer/cam1/001.jpg");
        assert_eq!((train.images[0].width, train.images[0].height), (13, 17));
    }

    #[test]
    fn test_truncated_crop_is_rewritten() {
        let temp_dir = TempDir::new().unwrap();
        let categories = categories();
        let existing = temp_dir.path().join("deer/cam1/001.jpg");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();

        let mut full = Vec::new();
        RgbImage::from_pixel(64, 48, Rgb([10, 200, 10]))
            .write_to(&mut Cursor::new(&mut full), ImageFormat::Jpeg)
            .unwrap();
        std::fs::write(&existing, &full[..full.len() / 3]).unwrap();

        let mut emitter = DatasetEmitter::new(
            EmitterOptions {
                coco_output: Some(temp_dir.path().to_path_buf()),
                images_per_shard: 10,
                ..Default::default()
            },
            &categories,
        )
        .unwrap();

        let image = source_image();
        let candidates = [candidate(0, crop(0, 0, 10, 20))];
        let counts = emitter
            .emit(
                &EmitRequest {
                    image: &image,
                    category: categories.get(7).unwrap(),
                    split: Split::Train,
                    candidates: &candidates,
                },
                &mut pixels(),
            )
            .unwrap();

        assert_eq!(counts.written, 1);
        assert_eq!(counts.reused, 0);
        assert_eq!(image::open(&existing).unwrap().to_rgb8().dimensions(), (20, 10));
        let train = emitter.train();
        assert_eq!((train.images[0].width, train.images[0].height), (20, 10));

        // No temporary files left next to the crop
        let siblings = std::fs::read_dir(existing.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1);
    }

    #[test]
    fn test_encoding_follows_extension() {
        assert_eq!(encoding_for("deer/a.png"), ImageFormat::Png);
        assert_eq!(encoding_for("deer/a.PNG"), ImageFormat::Png);
        assert_eq!(encoding_for("deer/a.jpg"), ImageFormat::Jpeg);
        assert_eq!(encoding_for("deer/a.tif"), ImageFormat::Jpeg);
        assert_eq!(encoding_for("deer/noext"), ImageFormat::Jpeg);
    }

    #[test]
    fn test_unusable_boxes_skip_without_consuming_ids() {
        let categories = categories();
        let mut emitter = DatasetEmitter::new(
            EmitterOptions {
                images_per_shard: 10,
                ..Default::default()
            },
            &categories,
        )
        .unwrap();
        let image = source_image();
        let deer = categories.get(7).unwrap();

        let empty = [candidate(0, crop(40, 0, 60, 10))];
        let counts = emitter
            .emit(
                &EmitRequest {
                    image: &image,
                    category: deer,
                    split: Split::Train,
                    candidates: &empty,
                },
                &mut pixels(),
            )
            .unwrap();
        assert_eq!(counts.skipped, 1);

        let good = [candidate(0, crop(0, 0, 5, 5))];
        let mut missing = SourcePixels::Pending(PathBuf::from("/nonexistent/001.jpg"));
        let request = EmitRequest {
            image: &image,
            category: deer,
            split: Split::Train,
            candidates: &good,
        };
        assert_eq!(emitter.emit(&request, &mut missing).unwrap().skipped, 1);
        assert!(matches!(missing, SourcePixels::Unavailable));

        assert_eq!(emitter.emit(&request, &mut pixels()).unwrap().written, 1);
        assert_eq!(emitter.train().images[0].id, 0);
        assert_eq!(emitter.train().images[0].file_name, "deer/cam1/001.jpg");
    }

    #[test]
    fn test_shard_only_output() {
        let temp_dir = TempDir::new().unwrap();
        let categories = categories();
        let mut emitter = DatasetEmitter::new(
            EmitterOptions {
                shard_output: Some(temp_dir.path().to_path_buf()),
                images_per_shard: 1,
                ..Default::default()
            },
            &categories,
        )
        .unwrap();

        let image = source_image();
        let candidates = [candidate(0, crop(0, 0, 8, 8)), candidate(1, crop(8, 8, 16, 16))];
        emitter
            .emit(
                &EmitRequest {
                    image: &image,
                    category: categories.get(7).unwrap(),
                    split: Split::Train,
                    candidates: &candidates,
                },
                &mut pixels(),
            )
            .unwrap();

        let summary = emitter.finish().unwrap();
        assert_eq!(summary.train_records, 2);
        assert_eq!(summary.train_shards.shards, 2);
        assert_eq!(summary.test_shards, ShardStats::default());
        assert!(temp_dir.path().join("train-00001").exists());
        assert!(!temp_dir.path().join("test-00000").exists());
        assert!(!temp_dir.path().join("train.json").exists());
        assert!(!temp_dir.path().join("deer").exists());

        let line = std::fs::read_to_string(temp_dir.path().join("train-00000")).unwrap();
        let record: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(record["class"]["label"], 0);
        assert_eq!(record["filename"], "deer/cam1/001_0.jpg");
        assert_eq!(record["format"], "jpeg");

        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join(LABEL_MAP_FILE)).unwrap(),
            "item {name: \"deer\" id: 0}\nitem {name: \"fox\" id: 1}\n"
        );
    }
}
