//! Merge features from every page and cell into one keyed set.
//!
//! Neighbouring cells overlap on their shared edges, so a feature straddling
//! a boundary is returned by both queries. The deduplicator keeps the first
//! feature seen for each identifier and discards later copies. A later copy
//! whose geometry differs is logged and its id recorded, but the run goes on.

use std::collections::{BTreeMap, BTreeSet};

use crate::feature::DecodedFeature;
use crate::grid::CellFailure;

/// Result of ingesting one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First time this id was seen.
    Inserted,
    /// Same id and geometry as the retained feature; discarded.
    Duplicate,
    /// Same id but different geometry; discarded and recorded.
    Inconsistent,
}

/// Final output of a retrieval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    /// Features keyed by their unique identifier.
    pub features: BTreeMap<String, DecodedFeature>,
    /// Cells whose features are missing, sorted by cell index.
    pub failed_cells: Vec<CellFailure>,
    /// Copies discarded because their id was already present.
    pub duplicates_discarded: usize,
    /// Ids whose copies disagreed on geometry.
    pub inconsistent_ids: BTreeSet<String>,
}

impl FeatureSet {
    /// Number of distinct features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether no feature was retrieved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Look up a feature by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DecodedFeature> {
        self.features.get(id)
    }

    /// Whether every cell succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_cells.is_empty()
    }
}

/// Incremental builder of a [`FeatureSet`].
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use geofetch_core::{
///     Coord3, DecodedFeature, FeatureDeduplicator, GeometryValue, IngestOutcome, PageRef,
/// };
///
/// let feature = DecodedFeature {
///     id: "pand-1".into(),
///     geometry: GeometryValue::Point(Coord3 { x: 1.0, y: 2.0, z: 0.0 }),
///     attributes: BTreeMap::new(),
///     source_page: PageRef { cell_index: 0, page_number: 0, url: "https://example.com".into() },
/// };
/// let mut dedup = FeatureDeduplicator::new();
/// assert_eq!(dedup.ingest(feature.clone()), IngestOutcome::Inserted);
/// assert_eq!(dedup.ingest(feature), IngestOutcome::Duplicate);
/// assert_eq!(dedup.finalize().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct FeatureDeduplicator {
    features: BTreeMap<String, DecodedFeature>,
    failures: Vec<CellFailure>,
    duplicates: usize,
    inconsistent: BTreeSet<String>,
}

impl FeatureDeduplicator {
    /// Create an empty deduplicator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one feature; the first feature seen for an id wins.
    pub fn ingest(&mut self, feature: DecodedFeature) -> IngestOutcome {
        match self.features.get(&feature.id) {
            None => {
                self.features.insert(feature.id.clone(), feature);
                IngestOutcome::Inserted
            }
            Some(kept) if kept.geometry == feature.geometry => {
                self.duplicates += 1;
                IngestOutcome::Duplicate
            }
            Some(kept) => {
                log::warn!(
                    "feature {} differs between {} and {}; keeping the first",
                    feature.id,
                    kept.source_page,
                    feature.source_page
                );
                self.duplicates += 1;
                self.inconsistent.insert(feature.id);
                IngestOutcome::Inconsistent
            }
        }
    }

    /// Merge a batch of features and return how many were new.
    pub fn ingest_all<I>(&mut self, features: I) -> usize
    where
        I: IntoIterator<Item = DecodedFeature>,
    {
        features
            .into_iter()
            .map(|f| self.ingest(f))
            .filter(|outcome| *outcome == IngestOutcome::Inserted)
            .count()
    }

    /// Record a failed cell for the final report.
    pub fn record_failure(&mut self, failure: CellFailure) {
        self.failures.push(failure);
    }

    /// Distinct features merged so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether nothing has been merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Snapshot the current state. Calling it repeatedly yields equal sets.
    #[must_use]
    pub fn finalize(&self) -> FeatureSet {
        let mut failed_cells = self.failures.clone();
        failed_cells.sort_by_key(|f| f.index);
        FeatureSet {
            features: self.features.clone(),
            failed_cells,
            duplicates_discarded: self.duplicates,
            inconsistent_ids: self.inconsistent.clone(),
        }
    }
}
