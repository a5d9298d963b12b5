//! HTTP transport seam.
//!
//! The engine only needs a GET with query parameters, headers, and a
//! per-request timeout that hands back the status, headers, and body. That
//! contract is the [`Transport`] trait; [`HttpTransport`] implements it on a
//! shared `reqwest` connection pool and tests substitute
//! [`crate::test_support::StubTransport`].
//!
//! Status codes are returned rather than turned into errors so that the
//! compatibility profile can reinterpret them.

mod client;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub use client::{DEFAULT_USER_AGENT, HttpTransport, HttpTransportConfig, TransportBuildError};

/// Response returned by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lower-case names.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

/// Request failures that never produced a status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The request exceeded its timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout {
        /// Requested URL.
        url: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },
    /// Connection, TLS, or body transfer failed.
    #[error("network error contacting {url}: {message}")]
    Network {
        /// Requested URL.
        url: String,
        /// Transport message.
        message: String,
    },
}

/// GET-only HTTP client used by the page fetcher.
///
/// Implementations must be shareable across cell tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET request.
    ///
    /// `url` already carries the query string.
    async fn get(
        &self,
        url: &Url,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}
