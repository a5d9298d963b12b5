use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// A request URL could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid request URL {url}: {source}")]
pub struct RequestUrlError {
    /// The text that failed to parse or join.
    pub url: String,
    /// Underlying parse failure.
    #[source]
    pub source: url::ParseError,
}

/// Outgoing request before it is handed to the transport.
///
/// The base URL is kept as text so that a profile can reshape it before it is
/// joined with the relative `resource` path. Query parameters are keyed, so a
/// later insert replaces an earlier value for the same name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolRequest {
    /// Service base URL.
    pub base_url: String,
    /// Path joined onto the base URL with relative-reference semantics.
    pub resource: Option<String>,
    /// Query parameters.
    pub query: BTreeMap<String, String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request timeout, set when a profile is applied.
    pub timeout: Option<Duration>,
    /// Whether the URL came from a server-provided link.
    pub follows_link: bool,
}

impl ProtocolRequest {
    /// Start a request against `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Build a request that follows a server-provided link verbatim.
    ///
    /// The link's query parameters are kept and its path is never reshaped.
    #[must_use]
    pub fn from_link(link: &Url) -> Self {
        let query = link.query_pairs().into_owned().collect();
        let mut base = link.clone();
        base.set_query(None);
        base.set_fragment(None);
        Self {
            base_url: base.into(),
            query,
            follows_link: true,
            ..Self::default()
        }
    }

    /// Set the relative resource path.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Set a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Resolve the final URL: parse the base, join the resource, then set the
    /// query string.
    ///
    /// # Errors
    ///
    /// Returns [`RequestUrlError`] when the base URL does not parse or the
    /// resource cannot be joined onto it.
    pub fn resolve(&self) -> Result<Url, RequestUrlError> {
        let base = Url::parse(&self.base_url).map_err(|source| RequestUrlError {
            url: self.base_url.clone(),
            source,
        })?;
        let mut url = match &self.resource {
            Some(resource) => base.join(resource).map_err(|source| RequestUrlError {
                url: format!("{}{resource}", self.base_url),
                source,
            })?,
            None => base,
        };
        if self.query.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}
