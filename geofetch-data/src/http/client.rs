//! `reqwest`-backed [`Transport`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use super::{Transport, TransportError, TransportResponse};

/// Default user agent for feature requests.
pub const DEFAULT_USER_AGENT: &str = "geofetch/0.1";

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Failure to build the HTTP client.
#[derive(Debug, Error)]
#[error("failed to build HTTP client: {0}")]
pub struct TransportBuildError(#[from] reqwest::Error);

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    /// User agent sent with every request.
    pub user_agent: String,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl HttpTransportConfig {
    /// Set the user agent string.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// HTTP transport over a pooled `reqwest` client.
///
/// Build one per retrieval run and share it between cell tasks behind an
/// `Arc`; the pool is released when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportBuildError`] when the TLS backend or client
    /// configuration cannot be initialised.
    pub fn new(config: &HttpTransportConfig) -> Result<Self, TransportBuildError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &Url,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url.clone()).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| convert_reqwest_error(&err, url, timeout))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| convert_reqwest_error(&err, url, timeout))?
            .to_vec();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn convert_reqwest_error(error: &reqwest::Error, url: &Url, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout {
            url: url.to_string(),
            timeout_secs: timeout.as_secs(),
        };
    }
    TransportError::Network {
        url: url.to_string(),
        message: error.to_string(),
    }
}
