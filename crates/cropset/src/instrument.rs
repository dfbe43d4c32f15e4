// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies. All Rights Reserved.

//! Conditional instrumentation support.
//!
//! With the `profiling` feature enabled the pipeline stages open `tracing`
//! spans. When disabled, instrumentation compiles to nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! #[cfg_attr(feature = "profiling", tracing::instrument(skip_all))]
//! fn process_image(&mut self, image_id: &ImageId) -> Result<ImageOutcome, Error> {
//!     // ...
//! }
//! ```
//!
//! For manual spans inside a function:
//!
//! ```rust,ignore
//! #[cfg(feature = "profiling")]
//! let _span = crate::instrument::debug_span!("image", id = %image_id).entered();
//! ```

#[cfg(feature = "profiling")]
pub use tracing::debug_span;
