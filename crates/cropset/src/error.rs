// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use std::path::PathBuf;

/// Error type for dataset construction.
///
/// Configuration and persistence problems are fatal and surface here.
/// Conditions that only affect a single image or crop (missing file,
/// unsupported pixel format, no detections above threshold) are not
/// errors; the pipeline records them as skips instead.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// Image decode or encode error.
    ImageError(image::ImageError),
    /// Image header probe error.
    ImageSizeError(imagesize::ImageError),
    /// ZIP archive error while reading zipped annotations.
    ZipError(zip::result::ZipError),
    /// Atomic replacement of an output file failed.
    PersistError(tempfile::PersistError),
    /// A required input path does not exist.
    MissingPath(PathBuf),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// The source COCO document is inconsistent.
    CocoError(String),
    /// The detection cache file could not be used.
    CacheError(String),
    /// Detector output with mismatched array lengths.
    InvalidDetection(String),
    /// The detector has no result for this image. The image is skipped
    /// and nothing is cached for it.
    DetectionUnavailable(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<imagesize::ImageError> for Error {
    fn from(err: imagesize::ImageError) -> Self {
        Error::ImageSizeError(err)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::ZipError(err)
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::PersistError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::ImageSizeError(e) => write!(f, "Image size probe error: {}", e),
            Error::ZipError(e) => write!(f, "ZIP error: {}", e),
            Error::PersistError(e) => write!(f, "Persist error: {}", e),
            Error::MissingPath(p) => write!(f, "{} does not exist", p.display()),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::CocoError(s) => write!(f, "COCO error: {}", s),
            Error::CacheError(s) => write!(f, "Detection cache error: {}", s),
            Error::InvalidDetection(s) => write!(f, "Invalid detection: {}", s),
            Error::DetectionUnavailable(s) => write!(f, "Detection unavailable: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::ImageSizeError(e) => Some(e),
            Error::ZipError(e) => Some(e),
            Error::PersistError(e) => Some(e),
            _ => None,
        }
    }
}
