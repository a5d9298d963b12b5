//! Response page parsing.
//!
//! Both supported encodings share the OGC API Features envelope: a
//! `features` array, a `links` array whose `rel == "next"` entry points at
//! the following page, and an optional `numberMatched` count. CityJSON pages
//! additionally carry `metadata.transform`, the scale/translate pair for the
//! integer vertices of that page and no other.

mod cityjson;
mod ogc;

use geofetch_core::{
    DecodeError, DecodedFeature, LevelOfDetail, PageRef, PayloadFormat, RawFeature,
    VertexTransform, VertexTransformError,
};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// One response worth of features.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePage {
    /// Features in arrival order, not yet decoded.
    pub features: Vec<RawFeature>,
    /// Absolute URL of the next page.
    pub next_page_link: Option<Url>,
    /// Vertex transform of this page.
    pub page_transform: Option<VertexTransform>,
    /// Total match count reported by the server.
    pub number_matched: Option<u64>,
    /// Origin of the page.
    pub page: PageRef,
}

impl FeaturePage {
    /// Terminal page with no features.
    #[must_use]
    pub const fn empty(page: PageRef) -> Self {
        Self {
            features: Vec::new(),
            next_page_link: None,
            page_transform: None,
            number_matched: None,
            page,
        }
    }

    /// Decode every feature with this page's own transform.
    ///
    /// Consumes the page so that its transform cannot outlive it.
    #[must_use]
    pub fn decode(self, lod: Option<&LevelOfDetail>) -> Vec<Result<DecodedFeature, DecodeError>> {
        let Self {
            features,
            page_transform,
            page,
            ..
        } = self;
        features
            .into_iter()
            .map(|feature| feature.decode(page_transform.as_ref(), lod, &page))
            .collect()
    }
}

/// Errors raised while parsing a page body.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PayloadError {
    /// The body was not valid JSON of the expected shape.
    #[error("failed to parse page from {url}: {source}")]
    Json {
        /// Page URL.
        url: String,
        /// Parser error.
        #[source]
        source: simd_json::Error,
    },
    /// The page transform held a non-finite component.
    #[error("page {url} carries an invalid vertex transform: {source}")]
    InvalidTransform {
        /// Page URL.
        url: String,
        /// Validation error.
        #[source]
        source: VertexTransformError,
    },
    /// The `next` link could not be resolved against the page URL.
    #[error("page {url} has an unusable next link {href:?}: {source}")]
    InvalidLink {
        /// Page URL.
        url: String,
        /// Raw link target.
        href: String,
        /// Resolution error.
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    #[serde(default)]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<F> {
    #[serde(default = "Vec::new")]
    features: Vec<F>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default, rename = "numberMatched")]
    number_matched: Option<u64>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    transform: Option<TransformDoc>,
}

#[derive(Debug, Deserialize)]
struct TransformDoc {
    scale: [f64; 3],
    translate: [f64; 3],
}

/// Parse one response body.
///
/// `body` is parsed in place and left in an unspecified state. `current_url`
/// resolves relative `next` links. `id_property` names a property that
/// replaces the GeoJSON feature id.
///
/// # Errors
///
/// Returns [`PayloadError`] for malformed JSON, a non-finite page transform,
/// or an unresolvable next link. Individual features the engine cannot
/// represent are skipped with a warning instead.
pub fn parse_page(
    format: PayloadFormat,
    body: &mut [u8],
    page: PageRef,
    current_url: &Url,
    id_property: Option<&str>,
) -> Result<FeaturePage, PayloadError> {
    match format {
        PayloadFormat::GeoJson => {
            let envelope: Envelope<ogc::GeoJsonFeature> = from_body(body, current_url)?;
            let next_page_link = next_link(&envelope.links, current_url)?;
            let features = ogc::into_features(envelope.features, id_property, &page);
            Ok(FeaturePage {
                features,
                next_page_link,
                page_transform: None,
                number_matched: envelope.number_matched,
                page,
            })
        }
        PayloadFormat::CityJson => {
            let envelope: Envelope<cityjson::CityFeatureDoc> = from_body(body, current_url)?;
            let next_page_link = next_link(&envelope.links, current_url)?;
            let page_transform = envelope
                .metadata
                .and_then(|m| m.transform)
                .map(|t| VertexTransform::new(t.scale, t.translate))
                .transpose()
                .map_err(|source| PayloadError::InvalidTransform {
                    url: current_url.to_string(),
                    source,
                })?;
            let features = cityjson::into_features(envelope.features, &page);
            Ok(FeaturePage {
                features,
                next_page_link,
                page_transform,
                number_matched: envelope.number_matched,
                page,
            })
        }
    }
}

fn from_body<'de, F>(body: &'de mut [u8], url: &Url) -> Result<Envelope<F>, PayloadError>
where
    F: Deserialize<'de>,
{
    simd_json::serde::from_slice(body).map_err(|source| PayloadError::Json {
        url: url.to_string(),
        source,
    })
}

fn next_link(links: &[Link], current_url: &Url) -> Result<Option<Url>, PayloadError> {
    let Some(link) = links.iter().find(|l| l.rel.as_deref() == Some("next")) else {
        return Ok(None);
    };
    current_url
        .join(&link.href)
        .map(Some)
        .map_err(|source| PayloadError::InvalidLink {
            url: current_url.to_string(),
            href: link.href.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geofetch_core::{Coord3, GeometryValue};
    use rstest::{fixture, rstest};

    #[fixture]
    fn page_ref() -> PageRef {
        PageRef {
            cell_index: 0,
            page_number: 0,
            url: "https://api.example.com/collections/pand/items".to_owned(),
        }
    }

    #[fixture]
    fn current_url() -> Url {
        Url::parse("https://api.example.com/collections/pand/items?limit=10").expect("valid url")
    }

    fn parse(format: PayloadFormat, json: &str, page: PageRef, url: &Url) -> FeaturePage {
        let mut body = json.as_bytes().to_vec();
        parse_page(format, &mut body, page, url, None).expect("page should parse")
    }

    #[rstest]
    fn resolves_relative_next_link(page_ref: PageRef, current_url: Url) {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [],
            "links": [
                {"rel": "self", "href": "items?limit=10"},
                {"rel": "next", "href": "items?limit=10&offset=10"}
            ]
        }"#;

        let page = parse(PayloadFormat::GeoJson, json, page_ref, &current_url);

        assert_eq!(
            page.next_page_link.map(String::from).as_deref(),
            Some("https://api.example.com/collections/pand/items?limit=10&offset=10")
        );
    }

    #[rstest]
    fn missing_next_link_ends_pagination(page_ref: PageRef, current_url: Url) {
        let json = r#"{"features": [], "links": [{"rel": "self", "href": "items"}]}"#;

        let page = parse(PayloadFormat::GeoJson, json, page_ref, &current_url);

        assert!(page.next_page_link.is_none());
    }

    #[rstest]
    fn reports_number_matched(page_ref: PageRef, current_url: Url) {
        let json = r#"{"features": [], "numberMatched": 1234}"#;

        let page = parse(PayloadFormat::GeoJson, json, page_ref, &current_url);

        assert_eq!(page.number_matched, Some(1234));
    }

    #[rstest]
    fn malformed_body_is_a_json_error(page_ref: PageRef, current_url: Url) {
        let mut body = b"<html>busy</html>".to_vec();

        let err = parse_page(PayloadFormat::GeoJson, &mut body, page_ref, &current_url, None)
            .expect_err("html is not a page");

        assert!(matches!(err, PayloadError::Json { .. }));
    }

    #[rstest]
    fn non_finite_transform_is_rejected(page_ref: PageRef, current_url: Url) {
        let json = r#"{
            "metadata": {"transform": {"scale": [0.001, 0.001, 0.001], "translate": [1e400, 0.0, 0.0]}},
            "features": []
        }"#;
        let mut body = json.as_bytes().to_vec();

        let result = parse_page(PayloadFormat::CityJson, &mut body, page_ref, &current_url, None);

        assert!(result.is_err());
    }

    #[rstest]
    fn decode_uses_the_page_transform(page_ref: PageRef, current_url: Url) {
        let json = r#"{
            "metadata": {"transform": {
                "scale": [0.001, 0.001, 0.001],
                "translate": [80113.570, 429309.435, -1.302]
            }},
            "features": [{
                "type": "CityJSONFeature",
                "id": "NL.IMBAG.Pand.0503100000000001",
                "CityObjects": {
                    "NL.IMBAG.Pand.0503100000000001": {
                        "type": "Building",
                        "geometry": [{"type": "MultiSurface", "lod": "0", "boundaries": [[[0, 1, 2]]]}]
                    }
                },
                "vertices": [[5455, 661895, 5567], [6455, 661895, 5567], [6455, 662895, 5567]]
            }]
        }"#;

        let page = parse(PayloadFormat::CityJson, json, page_ref, &current_url);
        let decoded: Vec<DecodedFeature> = page
            .decode(None)
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("feature decodes");

        let GeometryValue::Polygon(surface) = &decoded[0].geometry else {
            panic!("expected polygon, got {:?}", decoded[0].geometry);
        };
        let Coord3 { x, y, z } = surface[0][0];
        assert!((x - 80_119.025).abs() < 1.0e-6);
        assert!((y - 429_971.330).abs() < 1.0e-6);
        assert!((z - 4.265).abs() < 1.0e-6);
    }
}
