// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! COCO JSON/ZIP readers.
//!
//! Camera-trap metadata is distributed either as a bare JSON document or
//! as a ZIP archive holding one, so both are accepted.

use super::types::*;
use crate::Error;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Options for COCO reading.
#[derive(Debug, Clone, Default)]
pub struct CocoReadOptions {
    /// If true, validate cross references after reading.
    pub validate: bool,
}

/// COCO reader for source datasets.
///
/// # Example
///
/// ```rust,no_run
/// use cropset::coco::CocoReader;
///
/// let reader = CocoReader::new();
/// let dataset = reader.read("metadata/caltech_images.json")?;
/// println!("Loaded {} images", dataset.images.len());
/// # Ok::<(), cropset::Error>(())
/// ```
pub struct CocoReader {
    options: CocoReadOptions,
}

impl CocoReader {
    /// Create a new COCO reader with default options.
    pub fn new() -> Self {
        Self {
            options: CocoReadOptions::default(),
        }
    }

    /// Create a new COCO reader with custom options.
    pub fn with_options(options: CocoReadOptions) -> Self {
        Self { options }
    }

    /// Read a dataset from a JSON file or a ZIP archive, chosen by extension.
    pub fn read<P: AsRef<Path>>(&self, path: P) -> Result<CocoDataset, Error> {
        let path = path.as_ref();
        let is_zip = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if is_zip {
            self.read_annotations_zip(path)
        } else {
            self.read_json(path)
        }
    }

    /// Read COCO dataset from a JSON file.
    pub fn read_json<P: AsRef<Path>>(&self, path: P) -> Result<CocoDataset, Error> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::with_capacity(64 * 1024, file);
        let dataset: CocoDataset = serde_json::from_reader(reader)?;

        if self.options.validate {
            validate_dataset(&dataset)?;
        }

        Ok(dataset)
    }

    /// Read COCO annotations from a ZIP file.
    ///
    /// The first `*.json` entry in the archive is used.
    pub fn read_annotations_zip<P: AsRef<Path>>(&self, path: P) -> Result<CocoDataset, Error> {
        let file = File::open(path.as_ref())?;
        let mut archive = zip::ZipArchive::new(file)?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_lowercase();

            if !entry.is_dir() && name.ends_with(".json") {
                let mut contents = String::new();
                entry.read_to_string(&mut contents)?;

                let dataset: CocoDataset = serde_json::from_str(&contents)?;
                if self.options.validate {
                    validate_dataset(&dataset)?;
                }
                return Ok(dataset);
            }
        }

        Err(Error::CocoError(format!(
            "No JSON annotation file found in {}",
            path.as_ref().display()
        )))
    }
}

impl Default for CocoReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a COCO dataset for consistency.
///
/// Image ids must be unique and every annotation must reference a known
/// image and category.
pub(crate) fn validate_dataset(dataset: &CocoDataset) -> Result<(), Error> {
    let mut image_ids = HashSet::with_capacity(dataset.images.len());
    for image in &dataset.images {
        if !image_ids.insert(&image.id) {
            return Err(Error::CocoError(format!(
                "Duplicate image id {}",
                image.id
            )));
        }
    }
    let category_ids: HashSet<_> = dataset.categories.iter().map(|c| c.id).collect();

    for ann in &dataset.annotations {
        let ann_id = ann
            .id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<none>".to_string());

        if !image_ids.contains(&ann.image_id) {
            return Err(Error::CocoError(format!(
                "Annotation {} references non-existent image_id {}",
                ann_id, ann.image_id
            )));
        }

        if !category_ids.contains(&ann.category_id) {
            return Err(Error::CocoError(format!(
                "Annotation {} references non-existent category_id {}",
                ann_id, ann.category_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_dataset() -> CocoDataset {
        CocoDataset {
            images: vec![CocoImage {
                id: RecordId::Int(1),
                width: 640,
                height: 480,
                file_name: "test.jpg".to_string(),
                ..Default::default()
            }],
            categories: vec![CocoCategory {
                id: 1,
                name: "deer".to_string(),
                supercategory: None,
            }],
            annotations: vec![CocoAnnotation {
                id: Some(RecordId::Int(1)),
                image_id: RecordId::Int(1),
                category_id: 1,
                bbox: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_reader_default() {
        let reader = CocoReader::new();
        assert!(!reader.options.validate);
    }

    #[test]
    fn test_validate_dataset_valid() {
        assert!(validate_dataset(&sample_dataset()).is_ok());
    }

    #[test]
    fn test_validate_dataset_missing_image() {
        let mut dataset = sample_dataset();
        dataset.annotations[0].image_id = RecordId::Int(999);
        assert!(matches!(
            validate_dataset(&dataset),
            Err(Error::CocoError(_))
        ));
    }

    #[test]
    fn test_validate_dataset_missing_category() {
        let mut dataset = sample_dataset();
        dataset.annotations[0].category_id = 42;
        assert!(validate_dataset(&dataset).is_err());
    }

    #[test]
    fn test_validate_dataset_duplicate_image() {
        let mut dataset = sample_dataset();
        let duplicate = dataset.images[0].clone();
        dataset.images.push(duplicate);
        assert!(validate_dataset(&dataset).is_err());
    }

    #[test]
    fn test_read_json_and_zip() {
        let temp_dir = TempDir::new().unwrap();
        let json = serde_json::to_string(&sample_dataset()).unwrap();

        let json_path = temp_dir.path().join("meta.json");
        std::fs::write(&json_path, &json).unwrap();

        let zip_path = temp_dir.path().join("meta.json.zip");
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        zip.start_file("meta.json", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(json.as_bytes()).unwrap();
        zip.finish().unwrap();

        let reader = CocoReader::with_options(CocoReadOptions { validate: true });
        let from_json = reader.read(&json_path).unwrap();
        let from_zip = reader.read(&zip_path).unwrap();

        assert_eq!(from_json.images.len(), 1);
        assert_eq!(from_zip.images.len(), 1);
        assert_eq!(from_zip.categories[0].name, "deer");
    }

    #[test]
    fn test_read_zip_without_json() {
        let temp_dir = TempDir::new().unwrap();
        let zip_path = temp_dir.path().join("empty.zip");
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        zip.start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"nothing").unwrap();
        zip.finish().unwrap();

        let result = CocoReader::new().read(&zip_path);
        assert!(matches!(result, Err(Error::CocoError(_))));
    }
}
