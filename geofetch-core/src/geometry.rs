//! Decoded geometry values and level-of-detail selection.
//!
//! Multi-LOD encodings attach several geometries to one feature record, each
//! tagged with a level of detail and expressed as nested index arrays into the
//! feature's compressed vertex list. [`decode_geometry`] picks the candidate
//! carrying the requested tag and resolves its indices through the page-local
//! [`VertexTransform`].

use std::fmt;
use std::str::FromStr;

use geo::{Coord, LineString, MultiPolygon, Point, Polygon};
use thiserror::Error;

use crate::transform::{Coord3, IntegerVertex, VertexTransform, decode};

/// Closed or open ring of coordinates.
pub type Ring = Vec<Coord3>;
/// Exterior ring followed by interior rings.
pub type Surface = Vec<Ring>;
/// Surfaces bounding one closed volume.
pub type Shell = Vec<Surface>;

/// Errors returned when parsing a [`LevelOfDetail`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LevelOfDetailError {
    /// The tag was empty or not of the form `N`, `N.M` or `lodNM`.
    #[error("invalid level of detail: {0:?}")]
    Invalid(String),
}

/// Normalised level-of-detail tag such as `0`, `1.2` or `2.2`.
///
/// Layer-style names are accepted and normalised: `lod22` and `LoD2.2` both
/// parse to `2.2`.
///
/// # Examples
///
/// ```
/// use geofetch_core::LevelOfDetail;
///
/// let lod: LevelOfDetail = "lod22".parse().unwrap();
/// assert_eq!(lod.as_str(), "2.2");
/// assert!(LevelOfDetail::footprint().is_footprint());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct LevelOfDetail(String);

impl LevelOfDetail {
    /// Parse and normalise a tag.
    ///
    /// # Errors
    ///
    /// Returns [`LevelOfDetailError::Invalid`] for anything that is not a
    /// dotted numeric tag, optionally prefixed with `lod`.
    pub fn parse(raw: &str) -> Result<Self, LevelOfDetailError> {
        let invalid = || LevelOfDetailError::Invalid(raw.to_owned());
        let trimmed = raw.trim().to_ascii_lowercase();
        let body = trimmed.strip_prefix("lod").unwrap_or(&trimmed);
        if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(invalid());
        }
        let normalised = match body.split_once('.') {
            Some((major, minor)) => {
                if major.is_empty() || minor.is_empty() || minor.contains('.') {
                    return Err(invalid());
                }
                format!("{major}.{minor}")
            }
            // `lod22` style names pack major and minor into two digits.
            None if body.len() == 2 && trimmed.starts_with("lod") => {
                let mut digits = body.chars();
                match (digits.next(), digits.next()) {
                    (Some(major), Some(minor)) => format!("{major}.{minor}"),
                    _ => return Err(invalid()),
                }
            }
            None => body.to_owned(),
        };
        Ok(Self(normalised))
    }

    /// The flat 2D footprint, tag `0`.
    #[must_use]
    pub fn footprint() -> Self {
        Self("0".to_owned())
    }

    /// Whether this is the footprint tag.
    #[must_use]
    pub fn is_footprint(&self) -> bool {
        self.0 == "0"
    }

    /// Borrow the normalised tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for LevelOfDetail {
    type Err = LevelOfDetailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LevelOfDetail {
    type Error = LevelOfDetailError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LevelOfDetail> for String {
    fn from(value: LevelOfDetail) -> Self {
        value.0
    }
}

impl fmt::Display for LevelOfDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Geometry in real-world coordinates.
///
/// Planar sources carry `z = 0.0`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GeometryValue {
    /// Single position.
    Point(Coord3),
    /// Open polyline.
    LineString(Vec<Coord3>),
    /// One surface with optional holes.
    Polygon(Surface),
    /// Several surfaces.
    MultiPolygon(Vec<Surface>),
    /// Closed volume described by one exterior shell and optional inner shells.
    Solid(Vec<Shell>),
}

impl GeometryValue {
    /// Name of the geometry variant, for logs and diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "Point",
            Self::LineString(_) => "LineString",
            Self::Polygon(_) => "Polygon",
            Self::MultiPolygon(_) => "MultiPolygon",
            Self::Solid(_) => "Solid",
        }
    }

    /// Project onto the XY plane as a `geo` geometry.
    ///
    /// Solids flatten into the multipolygon of all their faces.
    #[must_use]
    pub fn to_geo(&self) -> geo::Geometry<f64> {
        match self {
            Self::Point(c) => Point::from(c.xy()).into(),
            Self::LineString(coords) => line_string(coords).into(),
            Self::Polygon(surface) => polygon(surface).into(),
            Self::MultiPolygon(surfaces) => {
                MultiPolygon::new(surfaces.iter().map(|s| polygon(s)).collect()).into()
            }
            Self::Solid(shells) => MultiPolygon::new(
                shells
                    .iter()
                    .flatten()
                    .map(|s| polygon(s))
                    .collect(),
            )
            .into(),
        }
    }
}

fn line_string(coords: &[Coord3]) -> LineString<f64> {
    coords.iter().map(|c| c.xy()).collect::<Vec<Coord<f64>>>().into()
}

fn polygon(surface: &[Ring]) -> Polygon<f64> {
    let mut rings = surface.iter();
    let exterior = rings.next().map_or_else(|| LineString::new(Vec::new()), |r| line_string(r));
    Polygon::new(exterior, rings.map(|r| line_string(r)).collect())
}

/// Geometry type tag of an encoded geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeometryKind {
    /// Unconnected surfaces.
    MultiSurface,
    /// Surfaces sharing edges.
    CompositeSurface,
    /// Closed volume.
    Solid,
    /// Any type the engine does not decode.
    Other(String),
}

impl GeometryKind {
    /// Encoded type name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::MultiSurface => "MultiSurface",
            Self::CompositeSurface => "CompositeSurface",
            Self::Solid => "Solid",
            Self::Other(name) => name,
        }
    }
}

/// Nested vertex indices of an encoded geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Boundaries {
    /// Surfaces → rings → vertex indices.
    Surfaces(Vec<Vec<Vec<usize>>>),
    /// Shells → surfaces → rings → vertex indices.
    Shells(Vec<Vec<Vec<Vec<usize>>>>),
}

/// One LOD-tagged geometry in compressed form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawGeometry {
    /// Level-of-detail tag, when the source provides one.
    pub lod: Option<LevelOfDetail>,
    /// Encoded geometry type.
    pub kind: GeometryKind,
    /// Index arrays into the owning feature's vertex list.
    pub boundaries: Boundaries,
}

/// A feature does not carry the requested level of detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("feature {feature_id} has no LOD {requested} (available: {})", display_lods(.available))]
pub struct LodNotAvailableError {
    /// Feature that was being decoded.
    pub feature_id: String,
    /// Requested tag.
    pub requested: LevelOfDetail,
    /// Tags present on the feature, sorted and unique.
    pub available: Vec<LevelOfDetail>,
}

fn display_lods(lods: &[LevelOfDetail]) -> String {
    if lods.is_empty() {
        return "none".to_owned();
    }
    lods.iter()
        .map(LevelOfDetail::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while turning a raw feature into a decoded one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The requested level of detail is absent.
    #[error(transparent)]
    LodNotAvailable(#[from] LodNotAvailableError),
    /// A boundary referenced a vertex outside the feature's vertex list.
    #[error("feature {feature_id} references vertex {index} but only {len} exist")]
    VertexOutOfRange {
        /// Feature that was being decoded.
        feature_id: String,
        /// Offending index.
        index: usize,
        /// Length of the vertex list.
        len: usize,
    },
    /// The selected geometry uses an encoding the engine does not decode.
    #[error("feature {feature_id} uses unsupported geometry type {kind}")]
    UnsupportedGeometry {
        /// Feature that was being decoded.
        feature_id: String,
        /// Encoded type name.
        kind: String,
    },
    /// A 3D feature record had no `Building` object.
    #[error("feature {feature_id} has no Building city object")]
    MissingBuilding {
        /// Feature that was being decoded.
        feature_id: String,
    },
    /// A feature with real-valued vertices arrived on a page that carries a
    /// transform.
    #[error("feature {feature_id} has real-valued vertices on a page with a transform")]
    RealVerticesWithTransform {
        /// Feature that was being decoded.
        feature_id: String,
    },
}

impl DecodeError {
    /// The level-of-detail error, if this is one.
    #[must_use]
    pub const fn lod_not_available(&self) -> Option<&LodNotAvailableError> {
        match self {
            Self::LodNotAvailable(err) => Some(err),
            _ => None,
        }
    }
}

/// Select the candidate tagged `lod` and decode it.
///
/// `vertices` is the owning feature's compressed vertex list and `transform`
/// must be the transform carried by the page that delivered it.
///
/// # Errors
///
/// Returns [`DecodeError::LodNotAvailable`] when no candidate carries `lod`,
/// [`DecodeError::UnsupportedGeometry`] when the selected candidate is not a
/// surface or solid encoding, and [`DecodeError::VertexOutOfRange`] for a
/// dangling index.
pub fn decode_geometry(
    feature_id: &str,
    candidates: &[RawGeometry],
    vertices: &[IntegerVertex],
    transform: &VertexTransform,
    lod: &LevelOfDetail,
) -> Result<GeometryValue, DecodeError> {
    let selected = select_lod(feature_id, candidates, lod)?;
    assemble(feature_id, selected, &decode(vertices, transform))
}

/// Select the candidate tagged `lod` and resolve it against coordinates that
/// are already real-world.
///
/// # Errors
///
/// As [`decode_geometry`].
pub fn resolve_geometry(
    feature_id: &str,
    candidates: &[RawGeometry],
    coords: &[Coord3],
    lod: &LevelOfDetail,
) -> Result<GeometryValue, DecodeError> {
    let selected = select_lod(feature_id, candidates, lod)?;
    assemble(feature_id, selected, coords)
}

fn select_lod<'a>(
    feature_id: &str,
    candidates: &'a [RawGeometry],
    lod: &LevelOfDetail,
) -> Result<&'a RawGeometry, DecodeError> {
    if let Some(selected) = candidates.iter().find(|g| g.lod.as_ref() == Some(lod)) {
        return Ok(selected);
    }
    let mut available: Vec<LevelOfDetail> =
        candidates.iter().filter_map(|g| g.lod.clone()).collect();
    available.sort();
    available.dedup();
    Err(LodNotAvailableError {
        feature_id: feature_id.to_owned(),
        requested: lod.clone(),
        available,
    }
    .into())
}

fn assemble(
    feature_id: &str,
    selected: &RawGeometry,
    coords: &[Coord3],
) -> Result<GeometryValue, DecodeError> {
    let resolve_ring = |ring: &Vec<usize>| -> Result<Ring, DecodeError> {
        ring.iter()
            .map(|&index| {
                coords
                    .get(index)
                    .copied()
                    .ok_or_else(|| DecodeError::VertexOutOfRange {
                        feature_id: feature_id.to_owned(),
                        index,
                        len: coords.len(),
                    })
            })
            .collect()
    };
    let resolve_surface = |surface: &Vec<Vec<usize>>| -> Result<Surface, DecodeError> {
        surface.iter().map(resolve_ring).collect()
    };

    match (&selected.kind, &selected.boundaries) {
        (GeometryKind::MultiSurface | GeometryKind::CompositeSurface, Boundaries::Surfaces(s)) => {
            let mut surfaces = s
                .iter()
                .map(resolve_surface)
                .collect::<Result<Vec<_>, _>>()?;
            if surfaces.len() == 1
                && let Some(only) = surfaces.pop()
            {
                return Ok(GeometryValue::Polygon(only));
            }
            Ok(GeometryValue::MultiPolygon(surfaces))
        }
        (GeometryKind::Solid, Boundaries::Shells(shells)) => shells
            .iter()
            .map(|shell| shell.iter().map(resolve_surface).collect())
            .collect::<Result<Vec<Shell>, _>>()
            .map(GeometryValue::Solid),
        (kind, _) => Err(DecodeError::UnsupportedGeometry {
            feature_id: feature_id.to_owned(),
            kind: kind.name().to_owned(),
        }),
    }
}
