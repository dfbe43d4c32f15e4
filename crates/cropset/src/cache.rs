// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Resumable per-image detection cache.
//!
//! The cache is the single source of truth consulted before any inference.
//! It is hydrated once from a previous run's file and written back
//! wholesale by [`DetectionCache::persist`]. Nothing is streamed to disk in
//! between: a run that dies before persisting loses every detection it
//! computed, and the next run starts again from the last persisted file.
//! Periodic checkpoints narrow that window.

use crate::{Error, coco::ImageId, detection::DetectionResult};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, btree_map::Entry},
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Version tag of the cache file layout.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    image_id: ImageId,
    detection: DetectionResult,
}

/// Whether a lookup was answered from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
}

/// Mapping from image id to detector output.
#[derive(Debug, Clone, Default)]
pub struct DetectionCache {
    entries: BTreeMap<ImageId, DetectionResult>,
    unsaved: usize,
}

impl DetectionCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from a previously persisted file.
    ///
    /// A missing, unreadable or corrupt file is an error; silently starting
    /// empty would re-run inference on the whole collection.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::CacheError(format!("cannot open {}: {}", path.display(), e))
        })?;
        let parsed: CacheFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::CacheError(format!("cannot parse {}: {}", path.display(), e))
        })?;

        if parsed.version != CACHE_FORMAT_VERSION {
            return Err(Error::CacheError(format!(
                "{} has format version {}, expected {}",
                path.display(),
                parsed.version,
                CACHE_FORMAT_VERSION
            )));
        }

        let mut entries = BTreeMap::new();
        for entry in parsed.entries {
            entry.detection.validate()?;
            entries.insert(entry.image_id, entry.detection);
        }
        info!(
            "Loaded {} cached detections from {}",
            entries.len(),
            path.display()
        );

        Ok(Self {
            entries,
            unsaved: 0,
        })
    }

    /// Hydrate from `path` if given, otherwise start empty.
    pub fn open(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::new()),
        }
    }

    /// Return the cached detection for `image_id`, computing and storing it
    /// on a miss. `compute` is never called for an id already present.
    ///
    /// If `compute` fails nothing is stored.
    pub fn get_or_compute<F>(
        &mut self,
        image_id: &ImageId,
        compute: F,
    ) -> Result<(&DetectionResult, CacheLookup), Error>
    where
        F: FnOnce() -> Result<DetectionResult, Error>,
    {
        match self.entries.entry(image_id.clone()) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), CacheLookup::Hit)),
            Entry::Vacant(entry) => {
                let detection = compute()?;
                detection.validate()?;
                self.unsaved += 1;
                Ok((entry.insert(detection), CacheLookup::Miss))
            }
        }
    }

    pub fn get(&self, image_id: &ImageId) -> Option<&DetectionResult> {
        self.entries.get(image_id)
    }

    pub fn contains(&self, image_id: &ImageId) -> bool {
        self.entries.contains_key(image_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Detections added since the last [`persist`](Self::persist).
    pub fn unsaved(&self) -> usize {
        self.unsaved
    }

    /// Write the whole cache to `path`.
    ///
    /// The file is written to a temporary sibling and renamed into place,
    /// so a crash mid-write leaves the previous file intact. Calling this
    /// again without new detections rewrites identical content.
    pub fn persist<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(image_id, detection)| CacheEntry {
                    image_id: image_id.clone(),
                    detection: detection.clone(),
                })
                .collect(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush()?;
        }
        tmp.persist(path)?;

        debug!(
            "Persisted {} detections ({} new) to {}",
            self.entries.len(),
            self.unsaved,
            path.display()
        );
        self.unsaved = 0;
        Ok(())
    }
}
