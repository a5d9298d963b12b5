//! GeoJSON features from OGC API Features pages.

use geofetch_core::geometry::{Ring, Surface};
use geofetch_core::{AttributeValue, Attributes, Coord3, GeometryValue, PageRef, RawFeature};
use log::warn;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct GeoJsonFeature {
    #[serde(default)]
    id: Option<FeatureId>,
    #[serde(default)]
    geometry: Option<GeoJsonGeometry>,
    #[serde(default)]
    properties: Option<Attributes>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeatureId {
    Text(String),
    Integer(i64),
    Number(f64),
}

type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonGeometry {
    Point { coordinates: Position },
    LineString { coordinates: Vec<Position> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    #[serde(other)]
    Unsupported,
}

pub(super) fn into_features(
    features: Vec<GeoJsonFeature>,
    id_property: Option<&str>,
    page: &PageRef,
) -> Vec<RawFeature> {
    features
        .into_iter()
        .filter_map(|feature| into_feature(feature, id_property, page))
        .collect()
}

fn into_feature(
    feature: GeoJsonFeature,
    id_property: Option<&str>,
    page: &PageRef,
) -> Option<RawFeature> {
    let attributes = feature.properties.unwrap_or_default();
    let id = id_property
        .and_then(|key| attributes.get(key))
        .and_then(attribute_id)
        .or_else(|| feature.id.map(FeatureId::into_string));
    let Some(id) = id else {
        warn!("skipping feature without an id on {page}");
        return None;
    };
    let Some(geometry) = feature.geometry.and_then(convert_geometry) else {
        warn!("skipping feature {id} on {page}: geometry missing or unsupported");
        return None;
    };
    Some(RawFeature::Plain {
        id,
        geometry,
        attributes,
    })
}

impl FeatureId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Integer(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
        }
    }
}

fn attribute_id(value: &AttributeValue) -> Option<String> {
    match value {
        AttributeValue::Text(text) => Some(text.clone()),
        AttributeValue::Integer(value) => Some(value.to_string()),
        _ => None,
    }
}

fn convert_geometry(geometry: GeoJsonGeometry) -> Option<GeometryValue> {
    match geometry {
        GeoJsonGeometry::Point { coordinates } => coord(&coordinates).map(GeometryValue::Point),
        GeoJsonGeometry::LineString { coordinates } => ring(&coordinates).map(GeometryValue::LineString),
        GeoJsonGeometry::Polygon { coordinates } => surface(&coordinates).map(GeometryValue::Polygon),
        GeoJsonGeometry::MultiPolygon { coordinates } => coordinates
            .iter()
            .map(|polygon| surface(polygon))
            .collect::<Option<Vec<_>>>()
            .map(GeometryValue::MultiPolygon),
        GeoJsonGeometry::Unsupported => None,
    }
}

fn coord(position: &[f64]) -> Option<Coord3> {
    match *position {
        [x, y] => Some(Coord3 { x, y, z: 0.0 }),
        [x, y, z, ..] => Some(Coord3 { x, y, z }),
        _ => None,
    }
}

fn ring(positions: &[Position]) -> Option<Ring> {
    positions.iter().map(|p| coord(p)).collect()
}

fn surface(rings: &[Vec<Position>]) -> Option<Surface> {
    rings.iter().map(|r| ring(r)).collect()
}

#[cfg(test)]
mod tests {
    use super::super::{FeaturePage, parse_page};
    use geofetch_core::{AttributeValue, GeometryValue, PageRef, PayloadFormat, RawFeature};
    use rstest::rstest;
    use url::Url;

    fn parse(json: &str, id_property: Option<&str>) -> FeaturePage {
        let url = Url::parse("https://api.pdok.nl/lv/bag/ogc/v1_0/collections/pand/items")
            .expect("valid url");
        let page = PageRef {
            cell_index: 3,
            page_number: 0,
            url: url.to_string(),
        };
        let mut body = json.as_bytes().to_vec();
        parse_page(PayloadFormat::GeoJson, &mut body, page, &url, id_property)
            .expect("page should parse")
    }

    #[rstest]
    fn parses_polygon_with_properties() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "id": "b1",
                "geometry": {"type": "Polygon", "coordinates": [[[4.0, 52.0], [4.1, 52.0], [4.1, 52.1], [4.0, 52.0]]]},
                "properties": {"bouwjaar": 1932, "status": "Pand in gebruik", "hoogte": 11.5}
            }]
        }"#;

        let page = parse(json, None);

        let [RawFeature::Plain { id, geometry, attributes }] = page.features.as_slice() else {
            panic!("expected one plain feature, got {:?}", page.features);
        };
        assert_eq!(id, "b1");
        assert!(matches!(geometry, GeometryValue::Polygon(rings) if rings[0].len() == 4));
        assert_eq!(attributes.get("bouwjaar"), Some(&AttributeValue::Integer(1932)));
        assert_eq!(attributes.get("hoogte"), Some(&AttributeValue::Number(11.5)));
    }

    #[rstest]
    #[case(r#""id": 42,"#, "42")]
    #[case(r#""id": "pand.7","#, "pand.7")]
    fn accepts_string_and_numeric_ids(#[case] id_field: &str, #[case] expected: &str) {
        let json = format!(
            r#"{{"features": [{{"type": "Feature", {id_field}
                "geometry": {{"type": "Point", "coordinates": [1.0, 2.0]}},
                "properties": {{}}}}]}}"#
        );

        let page = parse(&json, None);

        assert_eq!(page.features[0].id(), expected);
    }

    #[rstest]
    fn id_property_overrides_feature_id() {
        let json = r#"{"features": [{
            "type": "Feature", "id": 1,
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
            "properties": {"identificatie": "0363100012345678"}
        }]}"#;

        let page = parse(json, Some("identificatie"));

        assert_eq!(page.features[0].id(), "0363100012345678");
    }

    #[rstest]
    fn skips_unsupported_and_missing_geometry() {
        let json = r#"{"features": [
            {"type": "Feature", "id": "a", "geometry": {"type": "GeometryCollection", "geometries": []}, "properties": {}},
            {"type": "Feature", "id": "b", "geometry": null, "properties": {}},
            {"type": "Feature", "id": "c", "geometry": {"type": "Point", "coordinates": [5.0, 6.0, 7.0]}, "properties": null}
        ]}"#;

        let page = parse(json, None);

        assert_eq!(page.features.len(), 1);
        assert_eq!(page.features[0].id(), "c");
    }

    #[rstest]
    fn skips_features_without_id() {
        let json = r#"{"features": [
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}, "properties": {}}
        ]}"#;

        assert!(parse(json, None).features.is_empty());
    }
}
