//! Core domain types for the geofetch retrieval engine.
//!
//! The crate is free of I/O. It models bounding boxes, the page-local vertex
//! transform and its decoder, level-of-detail geometry selection, provider
//! compatibility profiles, grid planning, per-cell bookkeeping, and feature
//! deduplication. The HTTP side lives in `geofetch-data`.
//!
//! Constructors validate their input and return `Result` so that malformed
//! values never reach the fetch pipeline.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bbox;
pub mod dedup;
pub mod feature;
pub mod geometry;
pub mod grid;
pub mod outcome;
pub mod planner;
pub mod profile;
#[doc(hidden)]
pub mod test_support;
pub mod transform;

pub use bbox::{BoundingBox, BoundingBoxError, CrsId};
pub use dedup::{FeatureDeduplicator, FeatureSet, IngestOutcome};
pub use feature::{
    AttributeValue, Attributes, BUILDING, BUILDING_PART, CityFeature, CityObject, DecodedFeature,
    PageRef, RawFeature,
};
pub use geometry::{
    Boundaries, DecodeError, GeometryKind, GeometryValue, LevelOfDetail, LevelOfDetailError,
    LodNotAvailableError, RawGeometry, decode_geometry, resolve_geometry,
};
pub use grid::{
    CellFailure, CellStateError, CellStatus, CellTable, FailureCause, GridCell, ProgressEvent,
};
pub use outcome::{DownloadFailedError, PartialFailure, Retrieval};
pub use planner::{CellPlanner, PlanError, PlannerConfig};
pub use profile::{
    CompatibilityProfile, Interpretation, PayloadFormat, ProfileRegistry, ProtocolRequest,
    QuirkKind, RegistryError, RequestUrlError, UnknownProviderError,
};
pub use transform::{
    Coord3, IntegerVertex, RawVertices, VertexTransform, VertexTransformError, decode,
};
