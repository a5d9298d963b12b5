//! Provider compatibility profiles.
//!
//! Real OGC-style services deviate from the nominal protocol in small,
//! provider-specific ways: a base URL that must end in a slash, a format
//! parameter that must always be sent, a hard page-size ceiling, a `404` that
//! really means "no features". A [`CompatibilityProfile`] names every such
//! deviation as a field so the set of supported quirks is closed and each one
//! can be tested on its own.
//!
//! Profiles are looked up by `(provider, protocol)` in a [`ProfileRegistry`]
//! and applied to an outgoing [`ProtocolRequest`] just before it is sent.

mod registry;
mod request;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use registry::{ProfileRegistry, RegistryError, UnknownProviderError};
pub use request::{ProtocolRequest, RequestUrlError};

use crate::bbox::CrsId;

/// Query parameter carrying the requested page size.
pub const PAGE_SIZE_PARAM: &str = "limit";
/// Query parameter carrying the bounding box.
pub const BBOX_PARAM: &str = "bbox";
/// Query parameter carrying the bounding box CRS URI.
pub const BBOX_CRS_PARAM: &str = "bbox-crs";
/// Timeout used by profiles that do not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Encoding of response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PayloadFormat {
    /// GeoJSON feature collections with real-world coordinates.
    #[default]
    GeoJson,
    /// CityJSON feature sequences with per-page vertex transforms.
    CityJson,
}

/// One named deviation a profile can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuirkKind {
    /// A slash was appended to the base URL.
    TrailingSlash,
    /// Required query parameters were merged in.
    RequiredQueryParams,
    /// The page size was lowered to the provider ceiling.
    PageSizeClamp,
    /// The `bbox-crs` parameter was dropped.
    OmitBboxCrs,
    /// Extra headers were merged in.
    ExtraHeaders,
    /// A not-found status was read as an empty page.
    NotFoundAsEmpty,
}

impl QuirkKind {
    /// Stable snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrailingSlash => "trailing_slash",
            Self::RequiredQueryParams => "required_query_params",
            Self::PageSizeClamp => "page_size_clamp",
            Self::OmitBboxCrs => "omit_bbox_crs",
            Self::ExtraHeaders => "extra_headers",
            Self::NotFoundAsEmpty => "not_found_as_empty",
        }
    }
}

impl fmt::Display for QuirkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a response status should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpretation {
    /// Parse the body as a page.
    Success,
    /// Treat as a terminal page with no features.
    EmptyResult,
    /// The request failed.
    Error {
        /// HTTP status code.
        status: u16,
        /// Whether retrying may help.
        transient: bool,
    },
}

/// Deviations of one `(provider, protocol)` pair from the nominal protocol.
///
/// Profiles are read-only once registered and are shared between concurrent
/// cell tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct CompatibilityProfile {
    /// Append `/` to the base URL so joining a relative resource keeps the
    /// last path segment.
    pub requires_trailing_slash: bool,
    /// Parameters injected into every request; they override caller values.
    pub required_query_params: BTreeMap<String, String>,
    /// Ceiling applied to a caller-requested page size.
    pub max_features_per_page: Option<u32>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Headers injected into every request.
    pub extra_headers: BTreeMap<String, String>,
    /// Read `404 Not Found` as an empty terminal page.
    pub treat_not_found_as_empty: bool,
    /// Response body encoding.
    pub payload_format: PayloadFormat,
    /// Whether the provider accepts the `bbox-crs` parameter.
    pub send_bbox_crs: bool,
    /// CRS the provider expects bounding boxes in, if fixed.
    pub bbox_crs: Option<CrsId>,
    /// Provider-specific cap on concurrent cell fetches.
    pub max_concurrent_cells: Option<usize>,
    /// Property holding the stable feature identifier, when it is not the
    /// feature `id`.
    pub id_property: Option<String>,
    /// Human-readable explanation of the quirks.
    pub description: Option<String>,
    /// Link to the upstream issue or documentation.
    pub issue_url: Option<String>,
}

impl CompatibilityProfile {
    /// The no-quirk profile for standards-compliant servers.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use geofetch_core::{CompatibilityProfile, ProtocolRequest};
    ///
    /// let strict = CompatibilityProfile::strict(Duration::from_secs(10));
    /// let (request, applied) =
    ///     strict.apply_traced(ProtocolRequest::new("https://example.com/ogc"));
    /// assert!(applied.is_empty());
    /// assert_eq!(request.base_url, "https://example.com/ogc");
    /// assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    /// ```
    #[must_use]
    pub const fn strict(request_timeout: Duration) -> Self {
        Self {
            requires_trailing_slash: false,
            required_query_params: BTreeMap::new(),
            max_features_per_page: None,
            request_timeout,
            extra_headers: BTreeMap::new(),
            treat_not_found_as_empty: false,
            payload_format: PayloadFormat::GeoJson,
            send_bbox_crs: true,
            bbox_crs: None,
            max_concurrent_cells: None,
            id_property: None,
            description: None,
            issue_url: None,
        }
    }

    /// Apply the profile to an outgoing request.
    #[must_use]
    pub fn apply(&self, request: ProtocolRequest) -> ProtocolRequest {
        self.apply_traced(request).0
    }

    /// Apply the profile and report which quirks changed the request.
    ///
    /// Order: trailing slash, required parameters (profile wins on key
    /// collision), page-size clamp, `bbox-crs` suppression, headers, timeout.
    /// Requests following a server-provided link keep their path untouched.
    #[must_use]
    pub fn apply_traced(&self, mut request: ProtocolRequest) -> (ProtocolRequest, Vec<QuirkKind>) {
        let mut applied = Vec::new();

        if self.requires_trailing_slash
            && !request.follows_link
            && !request.base_url.ends_with('/')
        {
            request.base_url.push('/');
            applied.push(QuirkKind::TrailingSlash);
        }

        if !self.required_query_params.is_empty() {
            request.query.extend(
                self.required_query_params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            applied.push(QuirkKind::RequiredQueryParams);
        }

        if let Some(cap) = self.max_features_per_page
            && let Some(requested) = request
                .query
                .get(PAGE_SIZE_PARAM)
                .and_then(|v| v.trim().parse::<u64>().ok())
            && requested > u64::from(cap)
        {
            request
                .query
                .insert(PAGE_SIZE_PARAM.to_owned(), cap.to_string());
            applied.push(QuirkKind::PageSizeClamp);
        }

        if !self.send_bbox_crs && request.query.remove(BBOX_CRS_PARAM).is_some() {
            applied.push(QuirkKind::OmitBboxCrs);
        }

        if !self.extra_headers.is_empty() {
            request.headers.extend(
                self.extra_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            applied.push(QuirkKind::ExtraHeaders);
        }

        request.timeout = Some(self.request_timeout);

        for quirk in &applied {
            log::debug!("applied quirk {quirk} to {}", request.base_url);
        }
        (request, applied)
    }

    /// Classify a response status.
    #[must_use]
    pub const fn interpret(&self, status: u16) -> Interpretation {
        match status {
            200..=299 => Interpretation::Success,
            404 if self.treat_not_found_as_empty => Interpretation::EmptyResult,
            _ => Interpretation::Error {
                status,
                transient: status >= 500,
            },
        }
    }

    /// Effective page size for a caller-requested size.
    #[must_use]
    pub fn page_size(&self, requested: u32) -> u32 {
        self.max_features_per_page
            .map_or(requested, |cap| requested.min(cap))
    }
}

impl Default for CompatibilityProfile {
    fn default() -> Self {
        Self::strict(DEFAULT_REQUEST_TIMEOUT)
    }
}
