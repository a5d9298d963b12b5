//! CityJSON feature-sequence pages.
//!
//! Each feature carries its own `CityObjects` and an integer `vertices`
//! array. The vertices are only meaningful together with the transform in
//! the enclosing page's `metadata`, so nothing here decodes coordinates.

use std::collections::BTreeMap;

use geofetch_core::{
    Attributes, Boundaries, CityFeature, CityObject, Coord3, GeometryKind, IntegerVertex,
    LevelOfDetail, PageRef, RawFeature, RawGeometry, RawVertices,
};
use log::debug;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct CityFeatureDoc {
    id: String,
    #[serde(rename = "CityObjects")]
    city_objects: BTreeMap<String, CityObjectDoc>,
    #[serde(default)]
    vertices: Option<VerticesDoc>,
}

/// Integer triples when compressed, real triples otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VerticesDoc {
    Integer(Vec<IntegerVertex>),
    Real(Vec<[f64; 3]>),
}

#[derive(Debug, Deserialize)]
struct CityObjectDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    geometry: Vec<GeometryDoc>,
    #[serde(default)]
    attributes: Option<Attributes>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeometryDoc {
    Decodable(DecodableGeometry),
    Other {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        lod: Option<LodTag>,
    },
}

/// Boundary nesting follows the geometry type.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DecodableGeometry {
    MultiSurface {
        #[serde(default)]
        lod: Option<LodTag>,
        boundaries: Vec<Vec<Vec<usize>>>,
    },
    CompositeSurface {
        #[serde(default)]
        lod: Option<LodTag>,
        boundaries: Vec<Vec<Vec<usize>>>,
    },
    Solid {
        #[serde(default)]
        lod: Option<LodTag>,
        boundaries: Vec<Vec<Vec<Vec<usize>>>>,
    },
}

/// LOD tags appear both as strings and as bare numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LodTag {
    Text(String),
    Number(f64),
}

pub(super) fn into_features(features: Vec<CityFeatureDoc>, page: &PageRef) -> Vec<RawFeature> {
    features
        .into_iter()
        .map(|doc| RawFeature::City(into_city_feature(doc, page)))
        .collect()
}

fn into_city_feature(doc: CityFeatureDoc, page: &PageRef) -> CityFeature {
    let city_objects = doc
        .city_objects
        .into_iter()
        .map(|(key, object)| (key, into_city_object(object, &doc.id, page)))
        .collect();
    let vertices = match doc.vertices {
        Some(VerticesDoc::Real(real)) => RawVertices::Real(
            real.into_iter()
                .map(|[x, y, z]| Coord3 { x, y, z })
                .collect(),
        ),
        Some(VerticesDoc::Integer(integer)) => RawVertices::Integer(integer),
        None => RawVertices::Integer(Vec::new()),
    };
    CityFeature {
        id: doc.id,
        vertices,
        city_objects,
    }
}

fn into_city_object(object: CityObjectDoc, feature_id: &str, page: &PageRef) -> CityObject {
    let geometry = object
        .geometry
        .into_iter()
        .map(|g| into_raw_geometry(g, feature_id, page))
        .collect();
    CityObject {
        kind: object.kind,
        geometry,
        attributes: object.attributes.unwrap_or_default(),
    }
}

fn into_raw_geometry(doc: GeometryDoc, feature_id: &str, page: &PageRef) -> RawGeometry {
    let (kind, lod, boundaries) = match doc {
        GeometryDoc::Decodable(DecodableGeometry::MultiSurface { lod, boundaries }) => {
            (GeometryKind::MultiSurface, lod, Boundaries::Surfaces(boundaries))
        }
        GeometryDoc::Decodable(DecodableGeometry::CompositeSurface { lod, boundaries }) => {
            (GeometryKind::CompositeSurface, lod, Boundaries::Surfaces(boundaries))
        }
        GeometryDoc::Decodable(DecodableGeometry::Solid { lod, boundaries }) => {
            (GeometryKind::Solid, lod, Boundaries::Shells(boundaries))
        }
        // Never resolved: decoding reports the type as unsupported.
        GeometryDoc::Other { kind, lod } => (
            GeometryKind::Other(kind),
            lod,
            Boundaries::Surfaces(Vec::new()),
        ),
    };
    let lod = lod.and_then(|tag| {
        let text = match tag {
            LodTag::Text(text) => text,
            LodTag::Number(value) => value.to_string(),
        };
        LevelOfDetail::parse(&text)
            .inspect_err(|err| debug!("feature {feature_id} on {page}: {err}"))
            .ok()
    });
    RawGeometry {
        lod,
        kind,
        boundaries,
    }
}
