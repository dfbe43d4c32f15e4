// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! # COCO Dataset Format Support
//!
//! Reading of camera-trap COCO documents (JSON or zipped JSON) and writing
//! of the classification datasets produced from detector crops.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cropset::coco::{CocoReadOptions, CocoReader};
//!
//! let reader = CocoReader::with_options(CocoReadOptions { validate: true });
//! let dataset = reader.read("CaltechCameraTraps.json")?;
//! println!("Found {} images and {} annotations",
//!          dataset.images.len(), dataset.annotations.len());
//! # Ok::<(), cropset::Error>(())
//! ```

mod reader;
mod types;
mod writer;

pub use types::{
    ClassificationAnnotation, ClassificationDataset, ClassificationImage, CocoAnnotation,
    CocoCategory, CocoDataset, CocoImage, CocoInfo, ImageId, RecordId,
};

pub(crate) use reader::validate_dataset;
pub use reader::{CocoReadOptions, CocoReader};
pub use writer::{CocoWriteOptions, CocoWriter};
