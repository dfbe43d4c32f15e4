// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Location-level train/test split.
//!
//! Whole locations go to one side so that no camera site leaks images into
//! both splits. The split is a pure function of the location set, the
//! test fraction and the seed.

use crate::store::Location;
use itertools::Itertools;
use log::info;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::collections::BTreeSet;

/// Seed used for every split so repeated runs agree.
pub const SPLIT_SEED: u64 = 0;

/// Which side of the split an image lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disjoint, exhaustive partition of the locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationSplit {
    pub train: BTreeSet<Location>,
    pub test: BTreeSet<Location>,
}

impl LocationSplit {
    /// Split side of a location. Anything not drawn for testing trains.
    pub fn side(&self, location: &Location) -> Split {
        if self.train.contains(location) {
            Split::Train
        } else {
            Split::Test
        }
    }
}

/// Draw `max(1, round(test_fraction * n))` test locations without
/// replacement; the rest train.
///
/// A single location always ends up in the test split, leaving train empty.
pub fn split_locations(
    locations: &BTreeSet<Location>,
    test_fraction: f64,
    seed: u64,
) -> LocationSplit {
    if locations.is_empty() {
        return LocationSplit::default();
    }

    let pool: Vec<&Location> = locations.iter().collect();
    let wanted = ((test_fraction * pool.len() as f64).round() as usize).clamp(1, pool.len());

    let mut rng = StdRng::seed_from_u64(seed);
    let test: BTreeSet<Location> = pool
        .choose_multiple(&mut rng, wanted)
        .map(|&l| l.clone())
        .collect();
    let train = locations.difference(&test).cloned().collect();

    LocationSplit { train, test }
}

/// Log the location split.
pub fn log_split(split: &LocationSplit) {
    info!(
        "{} locations in total, {} for training, {} for testing",
        split.train.len() + split.test.len(),
        split.train.len(),
        split.test.len()
    );
    info!("Training uses locations [{}]", split.train.iter().join(", "));
    info!("Testing uses locations [{}]", split.test.iter().join(", "));
}
