//! Network side of the geofetch retrieval engine.
//!
//! Responsibilities:
//! - Issue OGC-style feature requests through a pluggable [`Transport`].
//! - Parse GeoJSON and CityJSON pages, keeping each page's vertex transform
//!   attached to that page only.
//! - Walk a planned grid of cells with bounded concurrency and merge the
//!   decoded features into one deduplicated set.
//!
//! Boundaries:
//! - Domain rules (profiles, planning, decoding, deduplication) live in
//!   `geofetch-core`.
//! - No reprojection; bounding boxes arrive in the service CRS.
//!
//! Invariants:
//! - One connection pool per run, dropped when the run returns.
//! - The deduplicator and cell table are owned by a single consumer task.

pub mod cell;
pub mod config;
pub mod fetch;
pub mod http;
pub mod monitor;
pub mod payload;
pub mod retrieve;
#[doc(hidden)]
pub mod test_support;
pub mod walker;

pub use cell::{CollectionCellFetcher, LodPolicy};
pub use config::{ConfigError, RetrievalConfig, load_registry};
pub use fetch::{FetchError, PageFetcher, RetryPolicy};
pub use http::{
    DEFAULT_USER_AGENT, HttpTransport, HttpTransportConfig, Transport, TransportBuildError,
    TransportError, TransportResponse,
};
pub use monitor::{QuirkUsage, QuirksMonitor};
pub use payload::{FeaturePage, PayloadError, parse_page};
pub use retrieve::{FeatureRetriever, RetrievalRequest, RetrieveError, ServiceDescriptor};
pub use tokio_util::sync::CancellationToken;
pub use walker::{CellError, CellFetch, CellFetcher, GridWalker};
