//! Page fetching with compatibility profiles and bounded retries.
//!
//! A [`PageFetcher`] turns one [`ProtocolRequest`] into one [`FeaturePage`]:
//! it applies the profile, sends the request, lets the profile classify the
//! status, retries transient failures with exponential backoff, and parses
//! the body. [`PageFetcher::fetch_all_pages`] chains requests through each
//! page's `next` link as a lazy stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use futures_util::stream;
use geofetch_core::profile::{BBOX_CRS_PARAM, BBOX_PARAM, PAGE_SIZE_PARAM};
use geofetch_core::{
    BoundingBox, CompatibilityProfile, Interpretation, PageRef, ProtocolRequest, QuirkKind,
    RequestUrlError,
};
use log::{debug, warn};
use thiserror::Error;

use crate::http::{Transport, TransportError};
use crate::monitor::QuirksMonitor;
use crate::payload::{FeaturePage, PayloadError, parse_page};

/// Default number of attempts per page.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
/// Page size requested when the caller does not choose one.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Retry budget for transient page failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per page, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Set the attempt budget. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the first retry delay.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// A page could not be obtained.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// No response after exhausting the retry budget.
    #[error("{source} (after {attempts} attempt(s))")]
    Transport {
        /// Last transport error.
        #[source]
        source: TransportError,
        /// Attempts made.
        attempts: u32,
    },
    /// The server answered with an error status.
    #[error("request to {url} failed with status {status} (after {attempts} attempt(s))")]
    Http {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Attempts made.
        attempts: u32,
    },
    /// The body could not be parsed.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// The request URL could not be built.
    #[error(transparent)]
    InvalidUrl(#[from] RequestUrlError),
}

impl FetchError {
    /// Whether a later attempt could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Payload(_) | Self::InvalidUrl(_) => false,
        }
    }

    /// HTTP status, when the server answered.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct MonitorBinding {
    monitor: Arc<QuirksMonitor>,
    provider: String,
    protocol: String,
}

/// Fetches pages from one service under one compatibility profile.
pub struct PageFetcher {
    transport: Arc<dyn Transport>,
    profile: Arc<CompatibilityProfile>,
    policy: RetryPolicy,
    monitor: Option<MonitorBinding>,
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher")
            .field("transport", &"<dyn Transport>")
            .field("profile", &self.profile)
            .field("policy", &self.policy)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl PageFetcher {
    /// Create a fetcher with the default retry policy.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, profile: Arc<CompatibilityProfile>) -> Self {
        Self {
            transport,
            profile,
            policy: RetryPolicy::default(),
            monitor: None,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Report applied quirks to `monitor` under `(provider, protocol)`.
    #[must_use]
    pub fn with_monitor(
        mut self,
        monitor: Arc<QuirksMonitor>,
        provider: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        self.monitor = Some(MonitorBinding {
            monitor,
            provider: provider.into(),
            protocol: protocol.into(),
        });
        self
    }

    /// Profile applied to every request.
    #[must_use]
    pub fn profile(&self) -> &CompatibilityProfile {
        &self.profile
    }

    fn record(&self, quirks: &[QuirkKind]) {
        if let Some(binding) = &self.monitor {
            binding
                .monitor
                .record_all(&binding.provider, &binding.protocol, quirks);
        }
    }

    /// Fetch one page.
    ///
    /// An empty-result interpretation yields a terminal page with no
    /// features. Transport failures and `5xx` statuses are retried; any
    /// other status fails at once.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the retry budget is exhausted, the status
    /// is a non-transient error, or the body cannot be parsed.
    pub async fn fetch_page(
        &self,
        request: ProtocolRequest,
        cell_index: usize,
        page_number: usize,
    ) -> Result<FeaturePage, FetchError> {
        let (request, quirks) = self.profile.apply_traced(request);
        self.record(&quirks);
        let url = request.resolve()?;
        let timeout = request.timeout.unwrap_or(self.profile.request_timeout);
        let page = PageRef {
            cell_index,
            page_number,
            url: url.to_string(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.transport.get(&url, &request.headers, timeout).await {
                Ok(response) => match self.profile.interpret(response.status) {
                    Interpretation::Success => {
                        let mut body = response.body;
                        let parsed = parse_page(
                            self.profile.payload_format,
                            &mut body,
                            page,
                            &url,
                            self.profile.id_property.as_deref(),
                        )?;
                        debug!(
                            "fetched {} feature(s) from {url}{}",
                            parsed.features.len(),
                            parsed
                                .number_matched
                                .map_or_else(String::new, |n| format!(" ({n} matched)"))
                        );
                        return Ok(parsed);
                    }
                    Interpretation::EmptyResult => {
                        self.record(&[QuirkKind::NotFoundAsEmpty]);
                        debug!("{url} answered {}; treating as empty", response.status);
                        return Ok(FeaturePage::empty(page));
                    }
                    Interpretation::Error { status, transient } => {
                        let err = FetchError::Http {
                            url: url.to_string(),
                            status,
                            attempts: attempt,
                        };
                        if !transient {
                            return Err(err);
                        }
                        err
                    }
                },
                Err(source) => FetchError::Transport {
                    source,
                    attempts: attempt,
                },
            };

            if attempt >= self.policy.max_attempts {
                return Err(failure);
            }
            let delay = self.policy.delay(attempt);
            warn!(
                "attempt {attempt}/{} for {url} failed: {failure}; retrying in {delay:?}",
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fetch `first` and every page reachable through `next` links.
    ///
    /// The stream is lazy: a page is requested only when the previous one
    /// has been taken. It ends after the first error or the first page
    /// without a `next` link.
    pub fn fetch_all_pages(
        &self,
        first: ProtocolRequest,
        cell_index: usize,
    ) -> impl Stream<Item = Result<FeaturePage, FetchError>> + Send + '_ {
        stream::unfold(Some((first, 0_usize)), move |state| async move {
            let (request, page_number) = state?;
            match self.fetch_page(request, cell_index, page_number).await {
                Ok(page) => {
                    let next = next_request(&page).map(|r| (r, page_number + 1));
                    Some((Ok(page), next))
                }
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

fn next_request(page: &FeaturePage) -> Option<ProtocolRequest> {
    let link = page.next_page_link.as_ref()?;
    if link.as_str() == page.page.url {
        warn!("{} links to itself as the next page; stopping", page.page.url);
        return None;
    }
    Some(ProtocolRequest::from_link(link))
}

/// First-page request for `collection` restricted to `bbox`.
///
/// The page size is the caller's wish; the profile clamps it when sent.
#[must_use]
pub fn items_request(
    base_url: &str,
    collection: &str,
    bbox: &BoundingBox,
    page_size: u32,
) -> ProtocolRequest {
    ProtocolRequest::new(base_url)
        .with_resource(format!("collections/{collection}/items"))
        .with_query(BBOX_PARAM, bbox.to_query_param())
        .with_query(PAGE_SIZE_PARAM, page_size.to_string())
        .with_query(BBOX_CRS_PARAM, bbox.crs().ogc_uri())
}
