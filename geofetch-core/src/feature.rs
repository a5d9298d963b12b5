//! Raw and decoded features.
//!
//! A [`RawFeature`] is what a payload parser produces from one page. Planar
//! features already carry real-world coordinates; compressed 3D features keep
//! their integer vertices until [`RawFeature::decode`] resolves them with the
//! transform of the page that delivered them. Only [`DecodedFeature`] values
//! leave the decoding step.

use std::collections::BTreeMap;
use std::fmt;

use crate::geometry::{
    DecodeError, GeometryValue, LevelOfDetail, RawGeometry, decode_geometry, resolve_geometry,
};
use crate::transform::{Coord3, RawVertices, VertexTransform};

/// City object type holding the building footprint and attributes.
pub const BUILDING: &str = "Building";
/// City object type holding per-part 3D geometry.
pub const BUILDING_PART: &str = "BuildingPart";

/// Opaque attribute value passed through from the provider.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum AttributeValue {
    /// JSON `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integral number.
    Integer(i64),
    /// Any other number.
    Number(f64),
    /// String.
    Text(String),
    /// Array.
    List(Vec<AttributeValue>),
    /// Object.
    Map(BTreeMap<String, AttributeValue>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Attribute mapping of a feature.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Where a feature came from: cell, page within the cell, and request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageRef {
    /// Index of the grid cell that fetched the page.
    pub cell_index: usize,
    /// Zero-based position of the page within the cell's page sequence.
    pub page_number: usize,
    /// URL that produced the page.
    pub url: String,
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cell {} page {} ({})",
            self.cell_index, self.page_number, self.url
        )
    }
}

/// Feature in real-world coordinates, keyed by its provider identifier.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecodedFeature {
    /// Stable provider-assigned identifier; the deduplication key.
    pub id: String,
    /// Decoded geometry.
    pub geometry: GeometryValue,
    /// Opaque attributes.
    pub attributes: Attributes,
    /// Page the feature was decoded from.
    pub source_page: PageRef,
}

/// One object of a compressed 3D feature record.
#[derive(Debug, Clone, PartialEq)]
pub struct CityObject {
    /// Object type, e.g. `Building` or `BuildingPart`.
    pub kind: String,
    /// LOD-tagged geometries.
    pub geometry: Vec<RawGeometry>,
    /// Object attributes.
    pub attributes: Attributes,
}

/// 3D feature record: objects plus a feature-local vertex list.
#[derive(Debug, Clone, PartialEq)]
pub struct CityFeature {
    /// Identifier of the feature record.
    pub id: String,
    /// Vertices indexed by the objects' boundaries.
    pub vertices: RawVertices,
    /// Objects keyed by their identifier.
    pub city_objects: BTreeMap<String, CityObject>,
}

/// Feature as parsed from a page, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFeature {
    /// Planar feature whose geometry is already real-world.
    Plain {
        /// Provider identifier.
        id: String,
        /// Geometry.
        geometry: GeometryValue,
        /// Attributes.
        attributes: Attributes,
    },
    /// Compressed multi-LOD 3D feature.
    City(CityFeature),
}

impl RawFeature {
    /// Provider identifier of the feature.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Plain { id, .. } => id,
            Self::City(city) => &city.id,
        }
    }

    /// Decode into real-world coordinates.
    ///
    /// `transform` must be the transform of the page this feature arrived
    /// on. Integer vertices on a page without a transform are taken as real
    /// coordinates. 3D features without a requested `lod` decode their
    /// footprint.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MissingBuilding`] when the record has no
    /// `Building` object, [`DecodeError::RealVerticesWithTransform`] for
    /// real-valued vertices on a page with a transform, and any geometry
    /// decoding error.
    pub fn decode(
        self,
        transform: Option<&VertexTransform>,
        lod: Option<&LevelOfDetail>,
        page: &PageRef,
    ) -> Result<DecodedFeature, DecodeError> {
        match self {
            Self::Plain {
                id,
                geometry,
                attributes,
            } => Ok(DecodedFeature {
                id,
                geometry,
                attributes,
                source_page: page.clone(),
            }),
            Self::City(city) => decode_city(city, transform, lod, page),
        }
    }
}

fn decode_city(
    city: CityFeature,
    transform: Option<&VertexTransform>,
    lod: Option<&LevelOfDetail>,
    page: &PageRef,
) -> Result<DecodedFeature, DecodeError> {
    let footprint = LevelOfDetail::footprint();
    let lod = lod.unwrap_or(&footprint);

    let Some(building) = city.city_objects.values().find(|o| o.kind == BUILDING) else {
        return Err(DecodeError::MissingBuilding {
            feature_id: city.id,
        });
    };
    // Building geometry first, so the footprint wins over any part tagged `0`.
    let candidates: Vec<RawGeometry> = building
        .geometry
        .iter()
        .chain(
            city.city_objects
                .values()
                .filter(|o| o.kind == BUILDING_PART)
                .flat_map(|o| o.geometry.iter()),
        )
        .cloned()
        .collect();

    let geometry = match (&city.vertices, transform) {
        (RawVertices::Integer(raw), Some(transform)) => {
            decode_geometry(&city.id, &candidates, raw, transform, lod)?
        }
        (RawVertices::Integer(raw), None) => {
            let coords: Vec<Coord3> = raw.iter().copied().map(Coord3::from).collect();
            resolve_geometry(&city.id, &candidates, &coords, lod)?
        }
        (RawVertices::Real(coords), None) => resolve_geometry(&city.id, &candidates, coords, lod)?,
        (RawVertices::Real(_), Some(_)) => {
            return Err(DecodeError::RealVerticesWithTransform {
                feature_id: city.id,
            });
        }
    };
    let attributes = building.attributes.clone();
    Ok(DecodedFeature {
        id: city.id,
        geometry,
        attributes,
        source_page: page.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Boundaries, GeometryKind};
    use rstest::{fixture, rstest};

    fn lod(tag: &str) -> LevelOfDetail {
        LevelOfDetail::parse(tag).expect("valid lod")
    }

    #[fixture]
    fn page() -> PageRef {
        PageRef {
            cell_index: 2,
            page_number: 1,
            url: "https://example.com/collections/pand/items?page=2".to_owned(),
        }
    }

    #[fixture]
    fn city() -> CityFeature {
        let mut objects = BTreeMap::new();
        objects.insert(
            "NL.IMBAG.Pand.1".to_owned(),
            CityObject {
                kind: BUILDING.to_owned(),
                geometry: vec![RawGeometry {
                    lod: Some(lod("0")),
                    kind: GeometryKind::MultiSurface,
                    boundaries: Boundaries::Surfaces(vec![vec![vec![0, 1, 2]]]),
                }],
                attributes: Attributes::from([("status".to_owned(), "Pand in gebruik".into())]),
            },
        );
        objects.insert(
            "NL.IMBAG.Pand.1-0".to_owned(),
            CityObject {
                kind: BUILDING_PART.to_owned(),
                geometry: vec![RawGeometry {
                    lod: Some(lod("2.2")),
                    kind: GeometryKind::Solid,
                    boundaries: Boundaries::Shells(vec![vec![vec![vec![0, 1, 3]]]]),
                }],
                attributes: Attributes::new(),
            },
        );
        CityFeature {
            id: "NL.IMBAG.Pand.1".to_owned(),
            vertices: RawVertices::Integer(vec![
                [0, 0, 0],
                [1000, 0, 0],
                [1000, 1000, 0],
                [0, 0, 3000],
            ]),
            city_objects: objects,
        }
    }

    #[fixture]
    fn transform() -> VertexTransform {
        VertexTransform::new([0.001, 0.001, 0.001], [85_000.0, 446_000.0, 0.0])
            .expect("valid transform")
    }

    #[rstest]
    fn plain_feature_passes_through(page: PageRef) {
        let raw = RawFeature::Plain {
            id: "42".to_owned(),
            geometry: GeometryValue::Point(Coord3 {
                x: 5.0,
                y: 52.0,
                z: 0.0,
            }),
            attributes: Attributes::from([("naam".to_owned(), "Delft".into())]),
        };
        let decoded = raw.decode(None, None, &page).expect("plain decodes");
        assert_eq!(decoded.id, "42");
        assert_eq!(decoded.source_page, page);
        assert_eq!(decoded.attributes["naam"], AttributeValue::from("Delft"));
    }

    #[rstest]
    fn city_feature_defaults_to_footprint(
        city: CityFeature,
        transform: VertexTransform,
        page: PageRef,
    ) {
        let decoded = RawFeature::City(city)
            .decode(Some(&transform), None, &page)
            .expect("footprint decodes");
        let GeometryValue::Polygon(surface) = &decoded.geometry else {
            panic!("expected polygon, got {:?}", decoded.geometry);
        };
        assert_eq!(surface[0][1], Coord3 { x: 85_001.0, y: 446_000.0, z: 0.0 });
        assert_eq!(
            decoded.attributes["status"],
            AttributeValue::from("Pand in gebruik")
        );
    }

    #[rstest]
    fn city_feature_selects_part_solid(
        city: CityFeature,
        transform: VertexTransform,
        page: PageRef,
    ) {
        let decoded = RawFeature::City(city)
            .decode(Some(&transform), Some(&lod("2.2")), &page)
            .expect("solid decodes");
        let GeometryValue::Solid(shells) = &decoded.geometry else {
            panic!("expected solid, got {:?}", decoded.geometry);
        };
        assert_eq!(shells[0][0][0][2].z, 3.0);
    }

    #[rstest]
    fn integer_vertices_without_transform_are_real(city: CityFeature, page: PageRef) {
        let decoded = RawFeature::City(city)
            .decode(None, None, &page)
            .expect("uncompressed page decodes");
        let GeometryValue::Polygon(surface) = &decoded.geometry else {
            panic!("expected polygon, got {:?}", decoded.geometry);
        };
        assert_eq!(surface[0][1], Coord3 { x: 1000.0, y: 0.0, z: 0.0 });
    }

    #[rstest]
    fn real_vertices_without_transform_decode(mut city: CityFeature, page: PageRef) {
        city.vertices = RawVertices::Real(vec![
            Coord3 { x: 85_000.125, y: 446_000.0, z: 0.0 },
            Coord3 { x: 85_001.125, y: 446_000.0, z: 0.0 },
            Coord3 { x: 85_001.125, y: 446_001.0, z: 0.0 },
            Coord3 { x: 85_000.125, y: 446_000.0, z: 3.5 },
        ]);
        let decoded = RawFeature::City(city)
            .decode(None, None, &page)
            .expect("real vertices decode");
        let GeometryValue::Polygon(surface) = &decoded.geometry else {
            panic!("expected polygon, got {:?}", decoded.geometry);
        };
        assert_eq!(surface[0][2], Coord3 { x: 85_001.125, y: 446_001.0, z: 0.0 });
    }

    #[rstest]
    fn real_vertices_conflict_with_a_page_transform(
        mut city: CityFeature,
        transform: VertexTransform,
        page: PageRef,
    ) {
        city.vertices = RawVertices::Real(vec![Coord3 { x: 0.5, y: 0.5, z: 0.5 }]);
        let err = RawFeature::City(city)
            .decode(Some(&transform), None, &page)
            .expect_err("real vertices cannot be compressed");
        assert!(matches!(err, DecodeError::RealVerticesWithTransform { .. }));
    }

    #[rstest]
    fn city_feature_requires_building(mut city: CityFeature, transform: VertexTransform, page: PageRef) {
        city.city_objects.retain(|_, o| o.kind != BUILDING);
        let err = RawFeature::City(city)
            .decode(Some(&transform), None, &page)
            .expect_err("building required");
        assert_eq!(
            err,
            DecodeError::MissingBuilding {
                feature_id: "NL.IMBAG.Pand.1".to_owned()
            }
        );
    }

    #[rstest]
    fn city_feature_reports_missing_lod(city: CityFeature, transform: VertexTransform, page: PageRef) {
        let err = RawFeature::City(city)
            .decode(Some(&transform), Some(&lod("1.3")), &page)
            .expect_err("no 1.3");
        assert!(err.lod_not_available().is_some());
    }
}
