use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use super::{CompatibilityProfile, PayloadFormat};
use crate::bbox::CrsId;

/// Lookup failed for a provider the registry does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnknownProviderError {
    /// No profile is registered for the pair.
    #[error("no compatibility profile registered for {provider}/{protocol}")]
    Profile {
        /// Provider identifier.
        provider: String,
        /// Protocol identifier.
        protocol: String,
    },
    /// No base URL is known for the provider.
    #[error("no endpoint registered for provider {provider}{}", service_suffix(.service.as_deref()))]
    Endpoint {
        /// Provider identifier.
        provider: String,
        /// Service requested, if any.
        service: Option<String>,
    },
}

fn service_suffix(service: Option<&str>) -> String {
    service.map_or_else(String::new, |s| format!(" (service {s})"))
}

/// Registry contents could not be loaded.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The document is not valid JSON or names an unknown field.
    #[cfg(feature = "serde")]
    #[error("failed to parse provider registry: {0}")]
    Parse(#[from] serde_json::Error),
    /// A profile carries an out-of-range value.
    #[error("invalid profile {provider}/{protocol}: {message}")]
    InvalidProfile {
        /// Provider identifier.
        provider: String,
        /// Protocol identifier, with the service suffix for overrides.
        protocol: String,
        /// What is wrong.
        message: String,
    },
    /// An endpoint is not an absolute URL.
    #[error("invalid endpoint {url} for provider {provider}")]
    InvalidEndpoint {
        /// Provider identifier.
        provider: String,
        /// Offending URL.
        url: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },
}

type PairKey = (String, String);
type ServiceKey = (String, String, String);
type EndpointKey = (String, Option<String>);

/// Compatibility profiles and base URLs keyed by provider.
///
/// # Examples
///
/// ```
/// use geofetch_core::ProfileRegistry;
///
/// let registry = ProfileRegistry::builtin();
/// let pdok = registry.resolve("pdok", "ogc-features").unwrap();
/// assert!(pdok.requires_trailing_slash);
/// assert!(registry.resolve("acme", "ogc-features").is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileRegistry {
    profiles: BTreeMap<PairKey, CompatibilityProfile>,
    services: BTreeMap<ServiceKey, CompatibilityProfile>,
    endpoints: BTreeMap<EndpointKey, String>,
}

impl ProfileRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the profile for a `(provider, protocol)` pair.
    pub fn register(
        &mut self,
        provider: impl Into<String>,
        protocol: impl Into<String>,
        profile: CompatibilityProfile,
    ) {
        self.profiles
            .insert((provider.into(), protocol.into()), profile);
    }

    /// Register a profile that applies to one service of a pair only.
    pub fn register_service(
        &mut self,
        provider: impl Into<String>,
        protocol: impl Into<String>,
        service: impl Into<String>,
        profile: CompatibilityProfile,
    ) {
        self.services
            .insert((provider.into(), protocol.into(), service.into()), profile);
    }

    /// Register a base URL for a provider, optionally for one service.
    pub fn register_endpoint(
        &mut self,
        provider: impl Into<String>,
        service: Option<&str>,
        url: impl Into<String>,
    ) {
        self.endpoints
            .insert((provider.into(), service.map(str::to_owned)), url.into());
    }

    /// Look up the profile of a `(provider, protocol)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownProviderError::Profile`] when nothing is registered.
    pub fn resolve(
        &self,
        provider: &str,
        protocol: &str,
    ) -> Result<&CompatibilityProfile, UnknownProviderError> {
        self.profiles
            .get(&(provider.to_owned(), protocol.to_owned()))
            .ok_or_else(|| UnknownProviderError::Profile {
                provider: provider.to_owned(),
                protocol: protocol.to_owned(),
            })
    }

    /// Look up the profile for one service, falling back to the pair.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownProviderError::Profile`] when neither the service
    /// override nor the pair is registered.
    pub fn resolve_service(
        &self,
        provider: &str,
        protocol: &str,
        service: &str,
    ) -> Result<&CompatibilityProfile, UnknownProviderError> {
        let key = (provider.to_owned(), protocol.to_owned(), service.to_owned());
        match self.services.get(&key) {
            Some(profile) => Ok(profile),
            None => self.resolve(provider, protocol),
        }
    }

    /// Resolve a profile, falling back to the strict profile for unknown
    /// providers so standards-compliant servers remain usable.
    #[must_use]
    pub fn resolve_or_strict(
        &self,
        provider: &str,
        protocol: &str,
        service: Option<&str>,
        timeout: Duration,
    ) -> CompatibilityProfile {
        let resolved = match service {
            Some(service) => self.resolve_service(provider, protocol, service),
            None => self.resolve(provider, protocol),
        };
        match resolved {
            Ok(profile) => profile.clone(),
            Err(err) => {
                log::warn!("{err}; using strict protocol profile");
                CompatibilityProfile::strict(timeout)
            }
        }
    }

    /// Base URL for a provider, preferring a service-specific entry.
    #[must_use]
    pub fn endpoint(&self, provider: &str, service: Option<&str>) -> Option<&str> {
        service
            .and_then(|s| {
                self.endpoints
                    .get(&(provider.to_owned(), Some(s.to_owned())))
            })
            .or_else(|| self.endpoints.get(&(provider.to_owned(), None)))
            .map(String::as_str)
    }

    /// Whether the registry holds no profiles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty() && self.services.is_empty()
    }

    /// Registered `(provider, protocol)` pairs in sorted order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.profiles
            .keys()
            .map(|(provider, protocol)| (provider.as_str(), protocol.as_str()))
    }

    /// Overlay `other` on top of this registry; entries in `other` win.
    pub fn extend(&mut self, other: Self) {
        self.profiles.extend(other.profiles);
        self.services.extend(other.services);
        self.endpoints.extend(other.endpoints);
    }

    /// Profiles for the providers the engine knows out of the box.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(
            "pdok",
            "ogc-features",
            CompatibilityProfile {
                requires_trailing_slash: true,
                required_query_params: BTreeMap::from([("f".to_owned(), "json".to_owned())]),
                description: Some(
                    "PDOK OGC API requires ?f=json and a trailing slash in the base URL".to_owned(),
                ),
                issue_url: Some(
                    "https://github.com/PDOK/issues/ogc-features-format-param".to_owned(),
                ),
                ..CompatibilityProfile::default()
            },
        );
        for (service, url) in [
            ("bag", "https://api.pdok.nl/lv/bag/ogc/v1_0/"),
            ("bgt", "https://api.pdok.nl/lv/bgt/ogc/v1_0/"),
            ("brk", "https://api.pdok.nl/lv/brk/ogc/v1_0/"),
            ("top10nl", "https://api.pdok.nl/brt/top10nl/ogc/v1/"),
        ] {
            registry.register_endpoint("pdok", Some(service), url);
        }

        registry.register(
            "bag3d",
            "ogc-features",
            CompatibilityProfile {
                max_features_per_page: Some(100),
                request_timeout: Duration::from_secs(60),
                payload_format: PayloadFormat::CityJson,
                send_bbox_crs: false,
                bbox_crs: Some(CrsId::new("EPSG:28992")),
                description: Some(
                    "3DBAG serves CityJSON feature sequences with a transform per page".to_owned(),
                ),
                issue_url: Some("https://api.3dbag.nl/api.html".to_owned()),
                ..CompatibilityProfile::default()
            },
        );
        registry.register_endpoint("bag3d", None, "https://api.3dbag.nl");

        registry.register(
            "cityjson",
            "format",
            CompatibilityProfile {
                request_timeout: Duration::from_secs(60),
                payload_format: PayloadFormat::CityJson,
                description: Some(
                    "CityJSON pages carry their own vertex transform; never reuse one across pages"
                        .to_owned(),
                ),
                issue_url: Some("https://www.cityjson.org/specs/2.0.0/#transform-object".to_owned()),
                ..CompatibilityProfile::default()
            },
        );

        registry
    }
}

#[cfg(feature = "serde")]
mod document {
    //! JSON registry document.
    //!
    //! Every struct denies unknown fields: a misspelt or unsupported quirk
    //! fails loading instead of silently doing nothing.

    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::Deserialize;

    use super::{ProfileRegistry, RegistryError};
    use crate::bbox::CrsId;
    use crate::profile::{CompatibilityProfile, PayloadFormat};

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct RegistryDocument {
        #[serde(default)]
        providers: BTreeMap<String, ProviderDefinition>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ProviderDefinition {
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        service_endpoints: BTreeMap<String, String>,
        #[serde(default)]
        protocols: BTreeMap<String, ProtocolDefinition>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ProtocolDefinition {
        #[serde(default)]
        quirks: ProfileDefinition,
        #[serde(default)]
        services: BTreeMap<String, ProfileDefinition>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ProfileDefinition {
        requires_trailing_slash: Option<bool>,
        required_query_params: Option<BTreeMap<String, String>>,
        max_features_per_page: Option<u32>,
        request_timeout_secs: Option<u64>,
        extra_headers: Option<BTreeMap<String, String>>,
        treat_not_found_as_empty: Option<bool>,
        payload_format: Option<PayloadFormat>,
        send_bbox_crs: Option<bool>,
        bbox_crs: Option<String>,
        max_concurrent_cells: Option<usize>,
        id_property: Option<String>,
        description: Option<String>,
        issue_url: Option<String>,
    }

    impl ProfileDefinition {
        /// Overlay this definition on `base`. Maps merge; scalars replace.
        fn overlay(self, mut base: CompatibilityProfile) -> Result<CompatibilityProfile, String> {
            if self.max_features_per_page == Some(0) {
                return Err("max_features_per_page must be positive".to_owned());
            }
            if self.request_timeout_secs == Some(0) {
                return Err("request_timeout_secs must be positive".to_owned());
            }
            if self.max_concurrent_cells == Some(0) {
                return Err("max_concurrent_cells must be positive".to_owned());
            }
            if let Some(v) = self.requires_trailing_slash {
                base.requires_trailing_slash = v;
            }
            if let Some(params) = self.required_query_params {
                base.required_query_params.extend(params);
            }
            if let Some(cap) = self.max_features_per_page {
                base.max_features_per_page = Some(cap);
            }
            if let Some(secs) = self.request_timeout_secs {
                base.request_timeout = Duration::from_secs(secs);
            }
            if let Some(headers) = self.extra_headers {
                base.extra_headers.extend(headers);
            }
            if let Some(v) = self.treat_not_found_as_empty {
                base.treat_not_found_as_empty = v;
            }
            if let Some(format) = self.payload_format {
                base.payload_format = format;
            }
            if let Some(v) = self.send_bbox_crs {
                base.send_bbox_crs = v;
            }
            if let Some(crs) = self.bbox_crs {
                base.bbox_crs = Some(CrsId::new(crs));
            }
            if let Some(n) = self.max_concurrent_cells {
                base.max_concurrent_cells = Some(n);
            }
            if let Some(prop) = self.id_property {
                base.id_property = Some(prop);
            }
            if let Some(text) = self.description {
                base.description = Some(text);
            }
            if let Some(link) = self.issue_url {
                base.issue_url = Some(link);
            }
            Ok(base)
        }
    }

    impl RegistryDocument {
        pub(super) fn into_registry(
            self,
            default_timeout: Duration,
        ) -> Result<ProfileRegistry, RegistryError> {
            let mut registry = ProfileRegistry::new();
            for (provider, definition) in self.providers {
                if let Some(url) = definition.endpoint {
                    check_endpoint(&provider, &url)?;
                    registry.register_endpoint(provider.clone(), None, url);
                }
                for (service, url) in definition.service_endpoints {
                    check_endpoint(&provider, &url)?;
                    registry.register_endpoint(provider.clone(), Some(&service), url);
                }
                for (protocol, protocol_def) in definition.protocols {
                    let invalid = |suffix: &str, message: String| RegistryError::InvalidProfile {
                        provider: provider.clone(),
                        protocol: format!("{protocol}{suffix}"),
                        message,
                    };
                    let base = protocol_def
                        .quirks
                        .overlay(CompatibilityProfile::strict(default_timeout))
                        .map_err(|m| invalid("", m))?;
                    for (service, service_def) in protocol_def.services {
                        let merged = service_def
                            .overlay(base.clone())
                            .map_err(|m| invalid(&format!(" (service {service})"), m))?;
                        registry.register_service(
                            provider.clone(),
                            protocol.clone(),
                            service,
                            merged,
                        );
                    }
                    registry.register(provider.clone(), protocol, base);
                }
            }
            Ok(registry)
        }
    }

    fn check_endpoint(provider: &str, url: &str) -> Result<(), RegistryError> {
        url::Url::parse(url)
            .map(|_| ())
            .map_err(|source| RegistryError::InvalidEndpoint {
                provider: provider.to_owned(),
                url: url.to_owned(),
                source,
            })
    }
}

#[cfg(feature = "serde")]
impl ProfileRegistry {
    /// Parse a registry from its JSON document.
    ///
    /// Protocol-level `quirks` overlay the strict profile built with
    /// `default_timeout`; service-level entries overlay their protocol.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] for malformed JSON or any unknown
    /// field, and [`RegistryError::InvalidProfile`] or
    /// [`RegistryError::InvalidEndpoint`] for out-of-range values.
    pub fn from_json_str(json: &str, default_timeout: Duration) -> Result<Self, RegistryError> {
        let document: document::RegistryDocument = serde_json::from_str(json)?;
        document.into_registry(default_timeout)
    }
}
