//! Retrieval settings and registry files.
//!
//! Settings can be built in code with the `with_*` methods or read from a
//! JSON document whose keys mirror the field names. Durations are written
//! in whole seconds (`*_secs`) or milliseconds (`*_ms`). Unknown keys are
//! rejected.

use std::io::{self, Read};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};
use geofetch_core::profile::DEFAULT_REQUEST_TIMEOUT;
use geofetch_core::{PlannerConfig, ProfileRegistry, RegistryError};
use serde::Deserialize;
use thiserror::Error;

use crate::cell::LodPolicy;
use crate::fetch::{DEFAULT_PAGE_SIZE, RetryPolicy};
use crate::http::{DEFAULT_USER_AGENT, HttpTransportConfig};
use crate::walker::{DEFAULT_CELL_RETRY_DELAY, DEFAULT_CONCURRENCY, DEFAULT_MAX_CELL_ATTEMPTS};

/// Errors raised while loading settings or registries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: Utf8PathBuf,
        /// I/O error.
        #[source]
        source: io::Error,
    },
    /// The settings document was malformed.
    #[error("invalid retrieval settings: {0}")]
    Parse(#[from] serde_json::Error),
    /// The registry document was malformed.
    #[error("invalid provider registry {path}: {source}")]
    Registry {
        /// File path.
        path: Utf8PathBuf,
        /// Registry error.
        #[source]
        source: RegistryError,
    },
    /// A setting held an unusable value.
    #[error("invalid retrieval setting {field}: {message}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Knobs of one retrieval run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Grid subdivision settings.
    pub planner: PlannerConfig,
    /// Per-page retry budget.
    pub retry: RetryPolicy,
    /// Cells fetched at once; a profile may lower it.
    pub concurrency: usize,
    /// Attempts per cell.
    pub max_cell_attempts: u32,
    /// Base delay between cell attempts.
    pub cell_retry_delay: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Request timeout of the strict fallback profile.
    pub default_timeout: Duration,
    /// Requested page size before profile clamping.
    pub page_size: u32,
    /// Handling of features missing the requested LOD.
    pub lod_policy: LodPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            max_cell_attempts: DEFAULT_MAX_CELL_ATTEMPTS,
            cell_retry_delay: DEFAULT_CELL_RETRY_DELAY,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: HttpTransportConfig::default().connect_timeout,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            lod_policy: LodPolicy::default(),
        }
    }
}

impl RetrievalConfig {
    /// Set the planner settings.
    #[must_use]
    pub const fn with_planner(mut self, planner: PlannerConfig) -> Self {
        self.planner = planner;
        self
    }

    /// Set the per-page retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the cell concurrency. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the attempts per cell. Zero is treated as one.
    #[must_use]
    pub fn with_max_cell_attempts(mut self, attempts: u32) -> Self {
        self.max_cell_attempts = attempts.max(1);
        self
    }

    /// Set the delay between cell attempts.
    #[must_use]
    pub const fn with_cell_retry_delay(mut self, delay: Duration) -> Self {
        self.cell_retry_delay = delay;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the strict-profile request timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the requested page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the missing-LOD policy.
    #[must_use]
    pub const fn with_lod_policy(mut self, lod_policy: LodPolicy) -> Self {
        self.lod_policy = lod_policy;
        self
    }

    /// Transport settings derived from this configuration.
    #[must_use]
    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig::default()
            .with_user_agent(self.user_agent.clone())
            .with_connect_timeout(self.connect_timeout)
    }

    /// Parse settings from JSON, starting from the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown keys and
    /// [`ConfigError::Invalid`] for zero-valued sizes or timeouts.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        file.overlay(Self::default())
    }

    /// Read settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, otherwise
    /// as [`RetrievalConfig::from_json_str`].
    pub fn from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        Self::from_json_str(&read_utf8(path)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    planner: Option<PlannerConfig>,
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    concurrency: Option<usize>,
    max_cell_attempts: Option<u32>,
    cell_retry_delay_ms: Option<u64>,
    user_agent: Option<String>,
    connect_timeout_secs: Option<u64>,
    default_timeout_secs: Option<u64>,
    page_size: Option<u32>,
    lod_policy: Option<LodPolicy>,
}

impl ConfigFile {
    fn overlay(self, mut config: RetrievalConfig) -> Result<RetrievalConfig, ConfigError> {
        if let Some(planner) = self.planner {
            config.planner = planner;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = positive("max_attempts", attempts)?;
        }
        if let Some(ms) = self.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = positive("concurrency", concurrency)?;
        }
        if let Some(attempts) = self.max_cell_attempts {
            config.max_cell_attempts = positive("max_cell_attempts", attempts)?;
        }
        if let Some(ms) = self.cell_retry_delay_ms {
            config.cell_retry_delay = Duration::from_millis(ms);
        }
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(positive("connect_timeout_secs", secs)?);
        }
        if let Some(secs) = self.default_timeout_secs {
            config.default_timeout = Duration::from_secs(positive("default_timeout_secs", secs)?);
        }
        if let Some(size) = self.page_size {
            config.page_size = positive("page_size", size)?;
        }
        if let Some(policy) = self.lod_policy {
            config.lod_policy = policy;
        }
        Ok(config)
    }
}

fn positive<T>(field: &'static str, value: T) -> Result<T, ConfigError>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        return Err(ConfigError::Invalid {
            field,
            message: "must be greater than zero".to_owned(),
        });
    }
    Ok(value)
}

/// Load a provider registry from a JSON file.
///
/// The result holds only the file's entries; merge it into
/// [`ProfileRegistry::builtin`] with [`ProfileRegistry::extend`] to keep the
/// shipped profiles.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] when the file cannot be read and
/// [`ConfigError::Registry`] when it is not a valid registry document.
pub fn load_registry(
    path: &Utf8Path,
    default_timeout: Duration,
) -> Result<ProfileRegistry, ConfigError> {
    let json = read_utf8(path)?;
    ProfileRegistry::from_json_str(&json, default_timeout).map_err(|source| {
        ConfigError::Registry {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn read_utf8(path: &Utf8Path) -> Result<String, ConfigError> {
    let read_error = |source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs_utf8::File::open_ambient(path, ambient_authority()).map_err(read_error)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(read_error)?;
    Ok(contents)
}
