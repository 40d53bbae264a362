//! Row normalization
//!
//! A [`Normalizer`] turns one [`RawRecord`] into either a
//! [`NormalizedRecord`] or a [`SkipReason`]. Normalizers are pure: no I/O,
//! no shared state, and no failure path. Malformed cells become zero
//! (numbers) or absent (text); only a missing identity skips the row.
//!
//! # Datasets
//!
//! - **MyFoodData**: curated CSV export with a three-line preamble
//! - **OpenFoodFacts**: tab-separated product dump keyed by barcode
//! - **FoodData Central**: per-nutrient CSV release, pivoted per food, plus
//!   its household portions ([`fdc`])

pub mod clean;
pub mod fdc;
pub mod myfooddata;
pub mod openfoodfacts;
pub mod units;

use crate::record::NormalizedRecord;
use crate::source::{RawRecord, SourceOptions};
use std::fmt;

pub use fdc::{FdcCatalog, FdcNormalizer, PortionNormalizer};
pub use myfooddata::MyFoodDataNormalizer;
pub use openfoodfacts::OpenFoodFactsNormalizer;

/// Result of normalizing one row
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(Box<NormalizedRecord>),
    Skip(SkipReason),
}

/// Why a row was not turned into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// No usable name column value
    MissingName,
    /// No barcode / source identifier where the dataset requires one
    MissingSourceId,
    /// The row could not be decoded at all
    Malformed,
    /// The food has no entry in the dataset's food list
    NotInCatalog,
    /// A portion without a positive gram weight
    InvalidPortion,
    /// A portion whose food has not been imported
    UnknownFood,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::MissingName => "missing_name",
            SkipReason::MissingSourceId => "missing_source_id",
            SkipReason::Malformed => "malformed",
            SkipReason::NotInCatalog => "not_in_catalog",
            SkipReason::InvalidPortion => "invalid_portion",
            SkipReason::UnknownFood => "unknown_food",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps raw rows of one dataset onto [`NormalizedRecord`]s
pub trait Normalizer: Send + Sync {
    /// Short dataset name used in logs and reports
    fn dataset(&self) -> &'static str;

    /// Columns that must be declared by the source before any row is read
    fn required_columns(&self) -> &'static [&'static str];

    /// File layout expected for this dataset
    fn source_options(&self) -> SourceOptions;

    fn normalize(&self, raw: &RawRecord) -> Normalized;
}
