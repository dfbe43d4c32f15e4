// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Sharded record output.
//!
//! Each split gets its own family of shard files named `<split>-00000`,
//! `<split>-00001`, ... holding at most `capacity` records each. Records
//! are newline-delimited JSON with the crop bytes base64-encoded.

use crate::{Error, store::CategoryMap};
use base64::Engine as _;
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// File name of the label map written next to the shards.
pub const LABEL_MAP_FILE: &str = "label_map.pbtxt";

/// Class of a shard record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardClass {
    /// Remapped category id.
    pub label: u32,
    /// Category name.
    pub text: String,
}

/// One cropped image as stored in a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardRecord {
    /// Derived image id, shared with the JSON output.
    pub id: u64,
    pub class: ShardClass,
    pub height: u32,
    pub width: u32,
    /// Crop path relative to the crop root.
    pub filename: String,
    /// Encoding of `encoded`, e.g. `jpeg` or `png`.
    pub format: String,
    #[serde(serialize_with = "serialize_base64")]
    pub encoded: Vec<u8>,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Totals reported by [`ShardWriter::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub records: usize,
    pub shards: usize,
}

/// Sink for the records of one split.
pub trait ShardWriter {
    /// Append a record, rolling over to a new shard when the current one
    /// is full. No file exists before the first call.
    fn add(&mut self, record: &ShardRecord) -> Result<(), Error>;

    /// Finish the open shard. Safe to call more than once.
    fn close(&mut self) -> Result<ShardStats, Error>;
}

/// [`ShardWriter`] producing JSON Lines shard files.
#[derive(Debug)]
pub struct JsonLinesShardWriter {
    dir: PathBuf,
    prefix: String,
    capacity: usize,
    current: Option<BufWriter<File>>,
    in_current: usize,
    stats: ShardStats,
    reported_empty: bool,
}

impl JsonLinesShardWriter {
    /// Writer for shards named `<prefix>-NNNNN` in `dir`.
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str, capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidParameters(
                "Shard capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
            capacity,
            current: None,
            in_current: 0,
            stats: ShardStats::default(),
            reported_empty: false,
        })
    }

    /// Path of the shard with the given sequence number.
    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}-{:05}", self.prefix, index))
    }

    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Remove shards numbered past the last one written, left behind by an
    /// earlier run that produced more records.
    fn remove_stale(&self) -> Result<usize, Error> {
        let mut removed = 0;
        loop {
            let path = self.shard_path(self.stats.shards + removed);
            if !path.is_file() {
                break;
            }
            std::fs::remove_file(&path)?;
            debug!("Removed stale shard {}", path.display());
            removed += 1;
        }
        Ok(removed)
    }

    fn finish_current(&mut self) -> Result<(), Error> {
        if let Some(mut writer) = self.current.take() {
            writer.flush()?;
            debug!(
                "Closed {} with {} records",
                self.shard_path(self.stats.shards - 1).display(),
                self.in_current
            );
        }
        self.in_current = 0;
        Ok(())
    }
}

impl ShardWriter for JsonLinesShardWriter {
    fn add(&mut self, record: &ShardRecord) -> Result<(), Error> {
        if self.current.is_none() {
            std::fs::create_dir_all(&self.dir)?;
            let path = self.shard_path(self.stats.shards);
            self.current = Some(BufWriter::new(File::create(&path)?));
            self.stats.shards += 1;
        }

        if let Some(writer) = self.current.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        self.in_current += 1;
        self.stats.records += 1;

        if self.in_current >= self.capacity {
            self.finish_current()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<ShardStats, Error> {
        self.finish_current()?;
        let removed = self.remove_stale()?;
        if removed > 0 {
            info!("Removed {} stale {} shards", removed, self.prefix);
        }
        if self.stats.records == 0 {
            if !self.reported_empty {
                warn!("No {} records were written", self.prefix);
                self.reported_empty = true;
            }
        } else {
            info!(
                "Wrote {} {} records to {} shards",
                self.stats.records, self.prefix, self.stats.shards
            );
        }
        Ok(self.stats)
    }
}

/// Write the label map listing every category in new-id order.
pub fn write_label_map<P: AsRef<Path>>(path: P, categories: &CategoryMap) -> Result<(), Error> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    for category in categories.entries() {
        writeln!(
            writer,
            "item {{name: \"{}\" id: {}}}",
            category.name.replace('\\', "\\\\").replace('"', "\\\""),
            category.new_id
        )?;
    }
    writer.flush()?;
    Ok(())
}
