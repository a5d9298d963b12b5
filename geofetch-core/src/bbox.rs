//! Axis-aligned bounding boxes tagged with a coordinate reference system.
//!
//! The engine never reprojects. A [`BoundingBox`] is assumed to already be
//! expressed in the planar CRS the target service expects, and every cell the
//! planner derives from it inherits the same [`CrsId`].

use std::fmt;

use geo::{Area, Coord, Rect};
use thiserror::Error;

/// OGC URI for the WGS84 longitude/latitude axis order.
const CRS84_URI: &str = "http://www.opengis.net/def/crs/OGC/1.3/CRS84";

/// Identifier of a coordinate reference system, e.g. `EPSG:28992`.
///
/// # Examples
///
/// ```
/// use geofetch_core::CrsId;
///
/// let crs = CrsId::new("EPSG:28992");
/// assert_eq!(crs.ogc_uri(), "http://www.opengis.net/def/crs/EPSG/0/28992");
/// assert_eq!(CrsId::wgs84().ogc_uri(), "http://www.opengis.net/def/crs/OGC/1.3/CRS84");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CrsId(String);

impl CrsId {
    /// Wrap a CRS identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The WGS84 geographic CRS.
    #[must_use]
    pub fn wgs84() -> Self {
        Self::new("EPSG:4326")
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render the identifier as the OGC URI form used by `bbox-crs`.
    ///
    /// Identifiers that are already URIs pass through unchanged.
    #[must_use]
    pub fn ogc_uri(&self) -> String {
        let id = self.0.trim();
        if id.starts_with("http://") || id.starts_with("https://") {
            return id.to_owned();
        }
        if id.eq_ignore_ascii_case("EPSG:4326") || id.eq_ignore_ascii_case("CRS84") {
            return CRS84_URI.to_owned();
        }
        let code = id
            .split_once(':')
            .map_or(id, |(authority, code)| {
                if authority.eq_ignore_ascii_case("EPSG") {
                    code
                } else {
                    id
                }
            });
        format!("http://www.opengis.net/def/crs/EPSG/0/{code}")
    }
}

impl From<&str> for CrsId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for CrsId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for CrsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors returned by [`BoundingBox::new`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BoundingBoxError {
    /// A coordinate was NaN or infinite.
    #[error("bounding box coordinates must be finite")]
    NonFinite,
    /// A minimum was not strictly below its maximum.
    #[error("bounding box is empty or inverted on the {axis} axis ({min} >= {max})")]
    Inverted {
        /// Axis name, `x` or `y`.
        axis: &'static str,
        /// Supplied minimum.
        min: f64,
        /// Supplied maximum.
        max: f64,
    },
}

/// Immutable rectangle with a strictly positive extent on both axes.
///
/// # Examples
///
/// ```
/// use geofetch_core::{BoundingBox, CrsId};
///
/// # fn main() -> Result<(), geofetch_core::BoundingBoxError> {
/// let bbox = BoundingBox::new(0.0, 0.0, 500.0, 250.0, CrsId::new("EPSG:28992"))?;
/// assert_eq!(bbox.to_query_param(), "0,0,500,250");
/// assert!(BoundingBox::new(1.0, 0.0, 1.0, 1.0, CrsId::wgs84()).is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    rect: Rect<f64>,
    crs: CrsId,
}

impl BoundingBox {
    /// Validate and construct a bounding box.
    ///
    /// # Errors
    ///
    /// Returns [`BoundingBoxError`] when a coordinate is not finite or when a
    /// minimum is not strictly less than its maximum.
    pub fn new(
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        crs: CrsId,
    ) -> Result<Self, BoundingBoxError> {
        if ![min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite()) {
            return Err(BoundingBoxError::NonFinite);
        }
        if min_x >= max_x {
            return Err(BoundingBoxError::Inverted {
                axis: "x",
                min: min_x,
                max: max_x,
            });
        }
        if min_y >= max_y {
            return Err(BoundingBoxError::Inverted {
                axis: "y",
                min: min_y,
                max: max_y,
            });
        }
        Ok(Self {
            rect: Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y }),
            crs,
        })
    }

    /// Lower x bound.
    #[must_use]
    pub fn min_x(&self) -> f64 {
        self.rect.min().x
    }

    /// Lower y bound.
    #[must_use]
    pub fn min_y(&self) -> f64 {
        self.rect.min().y
    }

    /// Upper x bound.
    #[must_use]
    pub fn max_x(&self) -> f64 {
        self.rect.max().x
    }

    /// Upper y bound.
    #[must_use]
    pub fn max_y(&self) -> f64 {
        self.rect.max().y
    }

    /// Coordinate reference system of the box.
    #[must_use]
    pub const fn crs(&self) -> &CrsId {
        &self.crs
    }

    /// Underlying `geo` rectangle.
    #[must_use]
    pub const fn rect(&self) -> &Rect<f64> {
        &self.rect
    }

    /// Extent along x.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.rect.width()
    }

    /// Extent along y.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.rect.height()
    }

    /// Planar area in squared CRS units.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.rect.unsigned_area()
    }

    /// Whether `other` lies entirely within this box, edges included.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.min_x() >= self.min_x()
            && other.min_y() >= self.min_y()
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }

    /// Render as the OGC `bbox` query value `minx,miny,maxx,maxy`.
    #[must_use]
    pub fn to_query_param(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_x(),
            self.min_y(),
            self.max_x(),
            self.max_y()
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ({})", self.to_query_param(), self.crs)
    }
}
