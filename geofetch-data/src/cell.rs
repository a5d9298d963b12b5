//! Cell fetcher for OGC API Features collections.

use std::pin::pin;

use async_trait::async_trait;
use futures_util::StreamExt;
use geofetch_core::{BoundingBox, DecodeError, FailureCause, LevelOfDetail};
use log::{debug, warn};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::fetch::{DEFAULT_PAGE_SIZE, PageFetcher, items_request};
use crate::walker::{CellError, CellFetch, CellFetcher};

/// What a missing level of detail does to the owning cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LodPolicy {
    /// Drop the feature and keep the cell.
    #[default]
    SkipFeature,
    /// Fail the whole cell.
    FailCell,
}

/// Fetches `{base}/collections/{collection}/items` for each cell.
#[derive(Debug)]
pub struct CollectionCellFetcher {
    pages: PageFetcher,
    base_url: String,
    collection: String,
    page_size: u32,
    lod: Option<LevelOfDetail>,
    lod_policy: LodPolicy,
}

impl CollectionCellFetcher {
    /// Create a fetcher for `collection` under `base_url`.
    #[must_use]
    pub fn new(
        pages: PageFetcher,
        base_url: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            pages,
            base_url: base_url.into(),
            collection: collection.into(),
            page_size: DEFAULT_PAGE_SIZE,
            lod: None,
            lod_policy: LodPolicy::default(),
        }
    }

    /// Request pages of `page_size` features.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Decode compressed features at `lod`.
    #[must_use]
    pub fn with_level_of_detail(mut self, lod: Option<LevelOfDetail>) -> Self {
        self.lod = lod;
        self
    }

    /// Set the missing-LOD policy.
    #[must_use]
    pub const fn with_lod_policy(mut self, lod_policy: LodPolicy) -> Self {
        self.lod_policy = lod_policy;
        self
    }
}

#[async_trait]
impl CellFetcher for CollectionCellFetcher {
    async fn fetch_cell(
        &self,
        index: usize,
        bbox: &BoundingBox,
        cancel: &CancellationToken,
    ) -> Result<CellFetch, CellError> {
        let first = items_request(&self.base_url, &self.collection, bbox, self.page_size);
        let mut pages = pin!(self.pages.fetch_all_pages(first, index));
        let mut features = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page?;
            let has_next = page.next_page_link.is_some();
            for decoded in page.decode(self.lod.as_ref()) {
                match decoded {
                    Ok(feature) => features.push(feature),
                    Err(DecodeError::LodNotAvailable(err)) => match self.lod_policy {
                        LodPolicy::SkipFeature => debug!("cell {index}: skipping {err}"),
                        LodPolicy::FailCell => {
                            return Err(CellError {
                                cause: FailureCause::LevelOfDetail {
                                    feature_id: err.feature_id,
                                    lod: err.requested,
                                },
                                transient: false,
                            });
                        }
                    },
                    Err(err) => warn!("cell {index}: skipping {err}"),
                }
            }
            if has_next && cancel.is_cancelled() {
                warn!("cell {index}: cancelled with pages remaining");
                return Ok(CellFetch {
                    features,
                    interrupted: true,
                });
            }
        }

        Ok(CellFetch {
            features,
            interrupted: false,
        })
    }
}
