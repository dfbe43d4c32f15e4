// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! COCO JSON writer for the generated classification datasets.

use crate::Error;
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

/// Options for COCO writing.
#[derive(Debug, Clone, Default)]
pub struct CocoWriteOptions {
    /// Pretty-print JSON with indentation.
    pub pretty: bool,
}

/// COCO writer for generating JSON files.
///
/// # Example
///
/// ```rust,no_run
/// use cropset::coco::{ClassificationDataset, CocoWriter};
///
/// let writer = CocoWriter::new();
/// let dataset = ClassificationDataset::default();
/// writer.write_json(&dataset, "train.json")?;
/// # Ok::<(), cropset::Error>(())
/// ```
pub struct CocoWriter {
    options: CocoWriteOptions,
}

impl CocoWriter {
    /// Create a new COCO writer with default options.
    pub fn new() -> Self {
        Self {
            options: CocoWriteOptions::default(),
        }
    }

    /// Create a new COCO writer with custom options.
    pub fn with_options(options: CocoWriteOptions) -> Self {
        Self { options }
    }

    /// Write a COCO document to a JSON file.
    ///
    /// # Arguments
    /// * `dataset` - The document to write
    /// * `path` - Output file path
    pub fn write_json<T: Serialize, P: AsRef<Path>>(
        &self,
        dataset: &T,
        path: P,
    ) -> Result<(), Error> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        if self.options.pretty {
            serde_json::to_writer_pretty(&mut writer, dataset)?;
        } else {
            serde_json::to_writer(&mut writer, dataset)?;
        }
        writer.flush()?;

        Ok(())
    }
}

impl Default for CocoWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coco::{
        ClassificationAnnotation, ClassificationDataset, ClassificationImage, CocoCategory,
        RecordId,
    };
    use tempfile::TempDir;

    fn sample() -> ClassificationDataset {
        ClassificationDataset {
            images: vec![ClassificationImage {
                id: 0,
                width: 64,
                height: 64,
                file_name: "fox/a.jpg".to_string(),
                original_image_id: RecordId::Int(9),
            }],
            categories: vec![CocoCategory {
                id: 0,
                name: "fox".to_string(),
                supercategory: Some("entity".to_string()),
            }],
            annotations: vec![ClassificationAnnotation {
                id: 0,
                image_id: 0,
                category_id: 0,
            }],
        }
    }

    #[test]
    fn test_writer_default() {
        let writer = CocoWriter::new();
        assert!(!writer.options.pretty);
    }

    #[test]
    fn test_write_json() {
        let temp_dir = TempDir::new().unwrap();
        let output_path = temp_dir.path().join("nested/train.json");

        let writer = CocoWriter::new();
        writer.write_json(&sample(), &output_path).unwrap();

        let contents = std::fs::read_to_string(&output_path).unwrap();
        let restored: ClassificationDataset = serde_json::from_str(&contents).unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_write_json_pretty() {
        let temp_dir = TempDir::new().unwrap();
        let output_path = temp_dir.path().join("test_pretty.json");

        let writer = CocoWriter::with_options(CocoWriteOptions { pretty: true });
        writer.write_json(&sample(), &output_path).unwrap();

        let contents = std::fs::read_to_string(&output_path).unwrap();
        assert!(contents.contains('\n'));
    }
}
