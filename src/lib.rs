//! Facade crate for the geofetch retrieval engine.
//!
//! This crate re-exports the core domain types and, behind the `http`
//! feature, the network-backed retriever.

#![forbid(unsafe_code)]

pub use geofetch_core::{
    AttributeValue, Attributes, BoundingBox, BoundingBoxError, CellFailure, CellPlanner,
    CompatibilityProfile, Coord3, CrsId, DecodedFeature, DownloadFailedError, FailureCause,
    FeatureSet, GeometryValue, LevelOfDetail, PageRef, PartialFailure, PayloadFormat, PlanError,
    PlannerConfig, ProfileRegistry, ProgressEvent, QuirkKind, Retrieval, UnknownProviderError,
    VertexTransform,
};

#[cfg(feature = "http")]
pub use geofetch_data::{
    CancellationToken, ConfigError, FeatureRetriever, HttpTransport, LodPolicy, QuirkUsage,
    QuirksMonitor, RetrievalConfig, RetrievalRequest, RetrieveError, ServiceDescriptor, Transport,
    load_registry,
};
