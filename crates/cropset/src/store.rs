// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Indexed view of the source camera-trap dataset.
//!
//! [`AnnotationStore`] owns the source images and annotations for the
//! whole run. It answers three questions for the pipeline: which images
//! exist (in id order), which single category an image is labelled with,
//! and which location an image belongs to.

use crate::{
    Error,
    coco::{CocoCategory, CocoDataset, CocoImage, CocoReader, ImageId, validate_dataset},
};
use itertools::Itertools;
use log::{debug, info, warn};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::Path,
};

/// Supercategory attached to every output category.
pub const OUTPUT_SUPERCATEGORY: &str = "entity";

/// A source category with its remapped zero-based id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryEntry {
    /// Id in the source dataset.
    pub old_id: u32,
    /// Zero-based id in the generated dataset.
    pub new_id: u32,
    /// Category name, also used as the crop directory name.
    pub name: String,
}

/// Ordered bijection between source category ids and `0..n`.
///
/// New ids follow the order in which categories are listed in the source
/// document. Repeated ids keep their first occurrence.
#[derive(Debug, Clone, Default)]
pub struct CategoryMap {
    entries: Vec<CategoryEntry>,
    by_old_id: HashMap<u32, usize>,
}

impl CategoryMap {
    /// Build the remap from the source category list.
    pub fn from_categories(categories: &[CocoCategory]) -> Self {
        let mut map = CategoryMap::default();
        for category in categories {
            if map.by_old_id.contains_key(&category.id) {
                warn!(
                    "Category id {} listed twice, keeping \"{}\"",
                    category.id,
                    map.get(category.id).map_or("", |c| c.name.as_str())
                );
                continue;
            }
            let new_id = map.entries.len() as u32;
            map.by_old_id.insert(category.id, map.entries.len());
            map.entries.push(CategoryEntry {
                old_id: category.id,
                new_id,
                name: category.name.clone(),
            });
        }
        map
    }

    /// Look up a category by its source id.
    pub fn get(&self, old_id: u32) -> Option<&CategoryEntry> {
        self.by_old_id.get(&old_id).map(|&idx| &self.entries[idx])
    }

    /// Remapped id for a source category id.
    pub fn new_id(&self, old_id: u32) -> Option<u32> {
        self.get(old_id).map(|c| c.new_id)
    }

    /// Look up a category by name.
    pub fn by_name(&self, name: &str) -> Option<&CategoryEntry> {
        self.entries.iter().find(|c| c.name == name)
    }

    /// All categories in new-id order.
    pub fn entries(&self) -> &[CategoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Categories as written to the output documents, in new-id order.
    pub fn output_categories(&self) -> Vec<CocoCategory> {
        self.entries
            .iter()
            .map(|c| CocoCategory {
                id: c.new_id,
                name: c.name.clone(),
                supercategory: Some(OUTPUT_SUPERCATEGORY.to_string()),
            })
            .collect()
    }
}

/// How an image is labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Labeling<'a> {
    /// Every annotation carries the same category.
    Single(&'a CategoryEntry),
    /// No annotations at all.
    Unlabeled,
    /// Annotations with this many distinct categories.
    Mixed(usize),
}

/// Value of the split key for one image.
///
/// String values are used verbatim, numbers by their decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(String);

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Location(name.into())
    }

    /// Canonicalize a JSON value. Returns `None` for null, arrays and objects.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Location(s.clone())),
            Value::Number(n) => Some(Location(n.to_string())),
            Value::Bool(b) => Some(Location(b.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source dataset indexed for the per-image loop.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    images: BTreeMap<ImageId, CocoImage>,
    categories: CategoryMap,
    labels: HashMap<ImageId, BTreeSet<u32>>,
}

impl AnnotationStore {
    /// Load and index a COCO JSON file or zipped JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let dataset = CocoReader::new().read(path.as_ref())?;
        if let Some(description) = &dataset.info.description {
            info!("Loaded dataset \"{}\"", description);
        }
        Self::from_dataset(dataset)
    }

    /// Index an in-memory dataset after validating its cross references.
    pub fn from_dataset(dataset: CocoDataset) -> Result<Self, Error> {
        validate_dataset(&dataset)?;

        let categories = CategoryMap::from_categories(&dataset.categories);
        info!(
            "All categories: \"{}\"",
            categories.entries().iter().map(|c| &c.name).join("\", \"")
        );

        let mut labels: HashMap<ImageId, BTreeSet<u32>> = HashMap::new();
        for ann in &dataset.annotations {
            labels
                .entry(ann.image_id.clone())
                .or_default()
                .insert(ann.category_id);
        }

        if let Some(first) = dataset.images.first() {
            let first_labels = dataset
                .annotations
                .iter()
                .filter(|a| a.image_id == first.id)
                .collect::<Vec<_>>();
            debug!("Example image record: {:?}", first);
            debug!("Its annotations: {:?}", first_labels);
        }

        let images = dataset
            .images
            .into_iter()
            .map(|image| (image.id.clone(), image))
            .collect();

        Ok(Self {
            images,
            categories,
            labels,
        })
    }

    /// Image ids in ascending order.
    pub fn image_ids(&self) -> impl Iterator<Item = &ImageId> {
        self.images.keys()
    }

    /// Images in ascending id order.
    pub fn images(&self) -> impl Iterator<Item = &CocoImage> {
        self.images.values()
    }

    pub fn image(&self, image_id: &ImageId) -> Option<&CocoImage> {
        self.images.get(image_id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn categories(&self) -> &CategoryMap {
        &self.categories
    }

    /// Classify the labels of an image.
    pub fn labeling(&self, image_id: &ImageId) -> Labeling<'_> {
        let Some(ids) = self.labels.get(image_id) else {
            return Labeling::Unlabeled;
        };
        match ids.len() {
            0 => Labeling::Unlabeled,
            1 => match ids.first().and_then(|&id| self.categories.get(id)) {
                Some(entry) => Labeling::Single(entry),
                None => Labeling::Unlabeled,
            },
            n => Labeling::Mixed(n),
        }
    }

    /// Location of a single image under `split_key`.
    pub fn location(&self, image: &CocoImage, split_key: &str) -> Result<Location, Error> {
        let value = image.attribute(split_key).ok_or_else(|| {
            Error::CocoError(format!(
                "Image {} has no \"{}\" field to split by",
                image.id, split_key
            ))
        })?;
        Location::from_value(&value).ok_or_else(|| {
            Error::CocoError(format!(
                "Image {} has an unusable \"{}\" value: {}",
                image.id, split_key, value
            ))
        })
    }

    /// Every distinct location, sorted.
    pub fn locations(&self, split_key: &str) -> Result<BTreeSet<Location>, Error> {
        self.images
            .values()
            .map(|image| self.location(image, split_key))
            .collect()
    }

    /// Ensure every excluded category name exists in the dataset.
    pub fn check_exclusions(&self, excluded: &[String]) -> Result<(), Error> {
        for name in excluded {
            if self.categories.by_name(name).is_none() {
                return Err(Error::InvalidParameters(format!(
                    "Category {} does not exist in dataset",
                    name
                )));
            }
        }
        Ok(())
    }
}
