//! Run outcomes.
//!
//! A run where some cells fail still produces usable data, so it is a
//! value ([`Retrieval::Partial`]) rather than an error. Only a run where
//! every cell fails becomes [`DownloadFailedError`].

use thiserror::Error;

use crate::dedup::FeatureSet;
use crate::grid::CellFailure;

/// Features from the successful cells plus the manifest of failed ones.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialFailure {
    /// Merged features; `features.failed_cells` lists the missing areas.
    pub features: FeatureSet,
    /// Whether the run stopped because it was cancelled.
    pub cancelled: bool,
}

impl PartialFailure {
    /// Areas whose features are missing, with causes.
    #[must_use]
    pub fn failed_cells(&self) -> &[CellFailure] {
        &self.features.failed_cells
    }
}

/// Successful outcome of a retrieval.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// Every cell succeeded.
    Complete(FeatureSet),
    /// Some cells failed or the run was cancelled.
    Partial(PartialFailure),
}

impl Retrieval {
    /// Borrow the merged features.
    #[must_use]
    pub const fn feature_set(&self) -> &FeatureSet {
        match self {
            Self::Complete(set) => set,
            Self::Partial(partial) => &partial.features,
        }
    }

    /// Take the merged features.
    #[must_use]
    pub fn into_feature_set(self) -> FeatureSet {
        match self {
            Self::Complete(set) => set,
            Self::Partial(partial) => partial.features,
        }
    }

    /// Whether every cell succeeded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Every cell of a run failed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("download failed: all {} cell(s) failed{}", .failures.len(), first_cause(.failures))]
pub struct DownloadFailedError {
    /// One entry per cell, sorted by index.
    pub failures: Vec<CellFailure>,
}

fn first_cause(failures: &[CellFailure]) -> String {
    failures
        .first()
        .map_or_else(String::new, |f| format!(" (first: {})", f.cause))
}
