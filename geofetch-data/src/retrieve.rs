//! The engine's entry point.
//!
//! [`FeatureRetriever::retrieve_features`] resolves the provider profile and
//! base URL, plans the grid, and walks it. Only pre-flight problems and a
//! run in which every cell failed come back as errors; a run with some
//! failed cells is a [`Retrieval::Partial`].
//!
//! ```no_run
//! use geofetch_core::{BoundingBox, CrsId, Retrieval};
//! use geofetch_data::{FeatureRetriever, RetrievalRequest, ServiceDescriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! let bbox = BoundingBox::new(80_000.0, 429_000.0, 80_600.0, 429_500.0, CrsId::new("EPSG:28992"))?;
//! let request = RetrievalRequest::new(ServiceDescriptor::new("bag3d", "ogc-features", "pand"), bbox);
//! let retriever = FeatureRetriever::default();
//!
//! match retriever.retrieve_features_blocking(&request, CancellationToken::new())? {
//!     Retrieval::Complete(set) => println!("{} buildings", set.len()),
//!     Retrieval::Partial(partial) => {
//!         for failure in partial.failed_cells() {
//!             eprintln!("incomplete: {failure}");
//!         }
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::sync::Arc;

use geofetch_core::{
    BoundingBox, CellPlanner, CompatibilityProfile, CrsId, DownloadFailedError, LevelOfDetail,
    PlanError, ProfileRegistry, ProgressEvent, Retrieval, UnknownProviderError,
};
use log::info;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cell::CollectionCellFetcher;
use crate::config::RetrievalConfig;
use crate::fetch::PageFetcher;
use crate::http::{HttpTransport, Transport, TransportBuildError};
use crate::monitor::QuirksMonitor;
use crate::walker::GridWalker;

/// Which provider, protocol, and collection to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Provider id in the registry.
    pub provider: String,
    /// Protocol id in the registry.
    pub protocol: String,
    /// Collection (layer) name.
    pub collection: String,
    /// Service name used for service-level profiles and endpoints.
    pub service: Option<String>,
    /// Base URL overriding the registry endpoint.
    pub base_url: Option<String>,
}

impl ServiceDescriptor {
    /// Describe `collection` served by `provider` over `protocol`.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        protocol: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            protocol: protocol.into(),
            collection: collection.into(),
            service: None,
            base_url: None,
        }
    }

    /// Name the service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Override the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// One call to [`FeatureRetriever::retrieve_features`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    /// Target service.
    pub service: ServiceDescriptor,
    /// Area in the CRS the service expects.
    pub bbox: BoundingBox,
    /// Level of detail for multi-LOD encodings.
    pub level_of_detail: Option<LevelOfDetail>,
}

impl RetrievalRequest {
    /// Request every feature of `service` inside `bbox`.
    #[must_use]
    pub const fn new(service: ServiceDescriptor, bbox: BoundingBox) -> Self {
        Self {
            service,
            bbox,
            level_of_detail: None,
        }
    }

    /// Select a level of detail.
    #[must_use]
    pub fn with_level_of_detail(mut self, lod: LevelOfDetail) -> Self {
        self.level_of_detail = Some(lod);
        self
    }
}

/// Errors surfaced by a retrieval.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RetrieveError {
    /// The provider has no endpoint and none was given.
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProviderError),
    /// The base URL is not absolute.
    #[error("invalid base URL {url:?} for provider {provider}: {source}")]
    InvalidBaseUrl {
        /// Provider id.
        provider: String,
        /// Offending URL.
        url: String,
        /// Parse error.
        #[source]
        source: url::ParseError,
    },
    /// The bbox is not in the CRS the provider expects.
    #[error("provider {provider} expects a bbox in {expected}, got {actual}")]
    CrsMismatch {
        /// Provider id.
        provider: String,
        /// CRS named by the profile.
        expected: CrsId,
        /// CRS of the request.
        actual: CrsId,
    },
    /// The area could not be planned.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// The HTTP client could not be built.
    #[error(transparent)]
    TransportBuild(#[from] TransportBuildError),
    /// Every cell failed.
    #[error(transparent)]
    DownloadFailed(#[from] DownloadFailedError),
    /// The blocking entry point could not start a runtime.
    #[error("failed to build Tokio runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Feature retrieval engine.
///
/// Holds the provider registry and settings; each call builds its own HTTP
/// connection pool and drops it when the call returns.
#[derive(Debug)]
pub struct FeatureRetriever {
    registry: ProfileRegistry,
    config: RetrievalConfig,
    monitor: Arc<QuirksMonitor>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Default for FeatureRetriever {
    fn default() -> Self {
        Self::new(ProfileRegistry::builtin(), RetrievalConfig::default())
    }
}

impl FeatureRetriever {
    /// Create a retriever.
    #[must_use]
    pub fn new(registry: ProfileRegistry, config: RetrievalConfig) -> Self {
        Self {
            registry,
            config,
            monitor: Arc::new(QuirksMonitor::new()),
            progress: None,
        }
    }

    /// Publish per-cell progress to `sender`.
    #[must_use]
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Provider registry in use.
    #[must_use]
    pub const fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Quirk usage recorded across calls.
    #[must_use]
    pub fn quirks(&self) -> &QuirksMonitor {
        &self.monitor
    }

    /// Profile a request will run under; unknown providers get the strict
    /// profile.
    #[must_use]
    pub fn profile_for(&self, service: &ServiceDescriptor) -> CompatibilityProfile {
        self.registry.resolve_or_strict(
            &service.provider,
            &service.protocol,
            service.service.as_deref(),
            self.config.default_timeout,
        )
    }

    fn base_url(&self, service: &ServiceDescriptor) -> Result<String, RetrieveError> {
        let url = service
            .base_url
            .as_deref()
            .or_else(|| {
                self.registry
                    .endpoint(&service.provider, service.service.as_deref())
            })
            .ok_or_else(|| UnknownProviderError::Endpoint {
                provider: service.provider.clone(),
                service: service.service.clone(),
            })?;
        Url::parse(url).map_err(|source| RetrieveError::InvalidBaseUrl {
            provider: service.provider.clone(),
            url: url.to_owned(),
            source,
        })?;
        Ok(url.to_owned())
    }

    /// Retrieve every feature of the requested collection inside the bbox.
    ///
    /// # Errors
    ///
    /// Returns [`RetrieveError`] for pre-flight failures (unknown endpoint,
    /// CRS mismatch, unplannable area, client construction) and
    /// [`RetrieveError::DownloadFailed`] when every cell failed.
    pub async fn retrieve_features(
        &self,
        request: &RetrievalRequest,
        cancel: CancellationToken,
    ) -> Result<Retrieval, RetrieveError> {
        let transport = HttpTransport::new(&self.config.transport())?;
        self.retrieve_with_transport(Arc::new(transport), request, cancel)
            .await
    }

    /// As [`FeatureRetriever::retrieve_features`] over a caller-supplied
    /// transport.
    ///
    /// # Errors
    ///
    /// As [`FeatureRetriever::retrieve_features`], minus client construction.
    pub async fn retrieve_with_transport(
        &self,
        transport: Arc<dyn Transport>,
        request: &RetrievalRequest,
        cancel: CancellationToken,
    ) -> Result<Retrieval, RetrieveError> {
        let service = &request.service;
        let profile = self.profile_for(service);
        let base_url = self.base_url(service)?;
        if let Some(expected) = &profile.bbox_crs
            && expected != request.bbox.crs()
        {
            return Err(RetrieveError::CrsMismatch {
                provider: service.provider.clone(),
                expected: expected.clone(),
                actual: request.bbox.crs().clone(),
            });
        }

        let cells = CellPlanner::new(self.config.planner)?.plan(&request.bbox, &profile)?;
        let concurrency = profile
            .max_concurrent_cells
            .map_or(self.config.concurrency, |cap| cap.min(self.config.concurrency));
        info!(
            "retrieving {}/{} from {} over {}: {} cell(s), concurrency {concurrency}",
            service.provider,
            service.collection,
            base_url,
            service.protocol,
            cells.len()
        );

        let pages = PageFetcher::new(transport, Arc::new(profile))
            .with_retry_policy(self.config.retry)
            .with_monitor(
                Arc::clone(&self.monitor),
                service.provider.clone(),
                service.protocol.clone(),
            );
        let fetcher = CollectionCellFetcher::new(pages, base_url, service.collection.clone())
            .with_page_size(self.config.page_size)
            .with_level_of_detail(request.level_of_detail.clone())
            .with_lod_policy(self.config.lod_policy);

        let mut walker = GridWalker::new()
            .with_concurrency(concurrency)
            .with_max_cell_attempts(self.config.max_cell_attempts)
            .with_cell_retry_delay(self.config.cell_retry_delay);
        if let Some(progress) = &self.progress {
            walker = walker.with_progress(progress.clone());
        }
        Ok(walker.run(cells, Arc::new(fetcher), cancel).await?)
    }

    /// Blocking form of [`FeatureRetriever::retrieve_features`].
    ///
    /// Inside a multi-threaded Tokio runtime the call blocks in place on that
    /// runtime. Elsewhere it drives a private current-thread runtime, on a
    /// helper thread when the caller is itself inside a current-thread
    /// runtime.
    ///
    /// # Errors
    ///
    /// As [`FeatureRetriever::retrieve_features`], plus
    /// [`RetrieveError::Runtime`] when no runtime can be built.
    pub fn retrieve_features_blocking(
        &self,
        request: &RetrievalRequest,
        cancel: CancellationToken,
    ) -> Result<Retrieval, RetrieveError> {
        let future = self.retrieve_features(request, cancel);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(future))
            }
            Ok(_) => std::thread::scope(|scope| {
                scope
                    .spawn(move || block_on_private(future))
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            }),
            Err(_) => block_on_private(future),
        }
    }
}

fn block_on_private<F>(future: F) -> Result<Retrieval, RetrieveError>
where
    F: Future<Output = Result<Retrieval, RetrieveError>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(RetrieveError::Runtime)?;
    runtime.block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RetryPolicy;
    use crate::test_support::{StubReply, StubTransport};
    use geofetch_core::test_support::rd_bbox;
    use rstest::{fixture, rstest};
    use std::time::Duration;

    #[fixture]
    fn retriever() -> FeatureRetriever {
        let config = RetrievalConfig::default()
            .with_retry(RetryPolicy::default().with_base_delay(Duration::from_millis(1)))
            .with_cell_retry_delay(Duration::from_millis(1));
        FeatureRetriever::new(ProfileRegistry::builtin(), config)
    }

    fn empty_transport() -> Arc<StubTransport> {
        Arc::new(StubTransport::from_fn(|_| {
            StubReply::json(r#"{"type": "FeatureCollection", "features": []}"#)
        }))
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_bbox_in_the_wrong_crs(retriever: FeatureRetriever) {
        let bbox = BoundingBox::new(4.0, 52.0, 4.01, 52.01, CrsId::wgs84()).expect("valid bbox");
        let request =
            RetrievalRequest::new(ServiceDescriptor::new("bag3d", "ogc-features", "pand"), bbox);

        let err = retriever
            .retrieve_with_transport(empty_transport(), &request, CancellationToken::new())
            .await
            .expect_err("bag3d expects RD New");

        assert!(matches!(err, RetrieveError::CrsMismatch { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_provider_without_base_url_fails_preflight(retriever: FeatureRetriever) {
        let bbox = rd_bbox(0.0, 0.0, 10.0, 10.0).expect("valid bbox");
        let request =
            RetrievalRequest::new(ServiceDescriptor::new("acme", "ogc-features", "roads"), bbox);

        let err = retriever
            .retrieve_with_transport(empty_transport(), &request, CancellationToken::new())
            .await
            .expect_err("no endpoint");

        assert!(matches!(
            err,
            RetrieveError::UnknownProvider(UnknownProviderError::Endpoint { .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_provider_with_base_url_uses_strict_profile(retriever: FeatureRetriever) {
        let transport = empty_transport();
        let bbox = rd_bbox(0.0, 0.0, 10.0, 10.0).expect("valid bbox");
        let request = RetrievalRequest::new(
            ServiceDescriptor::new("acme", "ogc-features", "roads")
                .with_base_url("https://ogc.acme.test/v2/"),
            bbox,
        );

        let retrieval = retriever
            .retrieve_with_transport(transport.clone(), &request, CancellationToken::new())
            .await
            .expect("strict profile works");

        assert!(retrieval.is_complete());
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path(), "/v2/collections/roads/items");
        assert!(requests[0].query_pairs().any(|(k, _)| k == "bbox-crs"));
    }

    #[rstest]
    #[tokio::test]
    async fn pdok_service_endpoint_gets_format_param(retriever: FeatureRetriever) {
        let transport = empty_transport();
        let bbox = rd_bbox(0.0, 0.0, 10.0, 10.0).expect("valid bbox");
        let request = RetrievalRequest::new(
            ServiceDescriptor::new("pdok", "ogc-features", "pand").with_service("bag"),
            bbox,
        );

        retriever
            .retrieve_with_transport(transport.clone(), &request, CancellationToken::new())
            .await
            .expect("run succeeds");

        let requests = transport.requests();
        assert_eq!(requests[0].path(), "/lv/bag/ogc/v1_0/collections/pand/items");
        assert!(requests[0].query_pairs().any(|(k, v)| k == "f" && v == "json"));
        assert!(
            retriever
                .quirks()
                .usage("pdok", "ogc-features", geofetch_core::QuirkKind::RequiredQueryParams)
                .is_some()
        );
    }

    #[rstest]
    fn blocking_entry_point_runs_without_a_runtime() {
        let retriever = FeatureRetriever::default();
        let bbox = rd_bbox(0.0, 0.0, 10.0, 10.0).expect("valid bbox");
        let request =
            RetrievalRequest::new(ServiceDescriptor::new("acme", "ogc-features", "roads"), bbox);

        let err = retriever
            .retrieve_features_blocking(&request, CancellationToken::new())
            .expect_err("no endpoint, no network");

        assert!(matches!(err, RetrieveError::UnknownProvider(_)));
    }
}
