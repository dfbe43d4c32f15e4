// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! COCO JSON data structures for serde serialization/deserialization.
//!
//! The source side models the camera-trap flavour of COCO: image-level
//! labels (annotations may carry no bbox), string or integer ids, and
//! arbitrary extra image fields such as `location` or `datetime`.
//! The output side models the per-crop classification dataset.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of a source image or annotation.
///
/// Camera-trap datasets use both integer ids and UUID strings. Integer
/// ids order before string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Numeric id.
    Int(u64),
    /// String id.
    Str(String),
}

/// Source image id.
pub type ImageId = RecordId;

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Str(id) => f.write_str(id),
        }
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        RecordId::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Str(id.to_string())
    }
}

/// Top-level source COCO dataset structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoDataset {
    /// Dataset metadata (optional but commonly present).
    #[serde(default)]
    pub info: CocoInfo,
    /// List of images in the dataset.
    pub images: Vec<CocoImage>,
    /// List of annotations.
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    /// List of object categories/classes.
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

/// Dataset metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoInfo {
    /// Year the dataset was created.
    #[serde(default)]
    pub year: Option<u32>,
    /// Version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Dataset description.
    #[serde(default)]
    pub description: Option<String>,
    /// Dataset contributor.
    #[serde(default)]
    pub contributor: Option<String>,
}

/// Source image metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    /// Unique image ID.
    pub id: ImageId,
    /// Image width in pixels, 0 when the source omits it.
    #[serde(default)]
    pub width: u32,
    /// Image height in pixels, 0 when the source omits it.
    #[serde(default)]
    pub height: u32,
    /// Filename relative to the image root.
    pub file_name: String,
    /// Every other image-level field (`location`, `datetime`, `seq_id`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CocoImage {
    fn default() -> Self {
        Self {
            id: RecordId::Int(0),
            width: 0,
            height: 0,
            file_name: String::new(),
            extra: Map::new(),
        }
    }
}

impl CocoImage {
    /// Look up an image-level field by name, including the typed ones.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            "id" => serde_json::to_value(&self.id).ok(),
            "width" => Some(Value::from(self.width)),
            "height" => Some(Value::from(self.height)),
            "file_name" => Some(Value::from(self.file_name.as_str())),
            _ => self.extra.get(key).cloned(),
        }
    }
}

/// Category definition.
///
/// Used on both sides: source categories carry the original ids, output
/// categories carry the remapped zero-based ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoCategory {
    /// Category ID.
    pub id: u32,
    /// Category name (e.g., "deer", "empty").
    pub name: String,
    /// Parent category name.
    #[serde(default)]
    pub supercategory: Option<String>,
}

impl Default for CocoCategory {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            supercategory: None,
        }
    }
}

/// Source annotation.
///
/// Camera-trap annotations are frequently image-level labels, so the
/// bounding box is optional and unused by the crop pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoAnnotation {
    /// Annotation ID.
    #[serde(default)]
    pub id: Option<RecordId>,
    /// ID of the annotated image.
    pub image_id: ImageId,
    /// Category ID of this annotation.
    pub category_id: u32,
    /// Bounding box: `[x, y, width, height]` in pixels, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

impl Default for RecordId {
    fn default() -> Self {
        RecordId::Int(0)
    }
}

/// Classification dataset written as `train.json` / `test.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDataset {
    /// One record per crop.
    pub images: Vec<ClassificationImage>,
    /// Remapped categories.
    pub categories: Vec<CocoCategory>,
    /// One label per crop.
    pub annotations: Vec<ClassificationAnnotation>,
}

/// A cropped image derived from one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationImage {
    /// Process-wide crop id.
    pub id: u64,
    /// Crop width in pixels.
    pub width: u32,
    /// Crop height in pixels.
    pub height: u32,
    /// `category_name/original_file_name[_<box_index>].<ext>`
    pub file_name: String,
    /// Id of the source image the crop was cut from.
    pub original_image_id: ImageId,
}

/// Label of a cropped image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationAnnotation {
    /// Process-wide annotation id.
    pub id: u64,
    /// Id of the [`ClassificationImage`].
    pub image_id: u64,
    /// Remapped category id.
    pub category_id: u32,
}
