//! Page-local vertex transform and the compressed-vertex decoder.
//!
//! Compressed 3D encodings store vertices as integer triples and ship a
//! scale/translate pair with every response. Each page re-centres its integers
//! around its own content, so a transform is only valid for the vertices of
//! the page that carried it. [`VertexTransform`] therefore has no default and
//! no shared instance; callers thread the page's transform explicitly into
//! [`decode`].

use thiserror::Error;

/// Integer vertex exactly as it appears in a compressed payload.
pub type IntegerVertex = [i64; 3];

/// Real-world 3D coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Coord3 {
    /// Easting or longitude.
    pub x: f64,
    /// Northing or latitude.
    pub y: f64,
    /// Height.
    pub z: f64,
}

impl Coord3 {
    /// Planar projection of the coordinate.
    #[must_use]
    pub const fn xy(self) -> geo::Coord<f64> {
        geo::Coord {
            x: self.x,
            y: self.y,
        }
    }
}

impl From<IntegerVertex> for Coord3 {
    fn from([x, y, z]: IntegerVertex) -> Self {
        Self {
            x: x as f64,
            y: y as f64,
            z: z as f64,
        }
    }
}

/// Vertex list of one 3D feature record.
///
/// Pages with a transform carry integer vertices. Pages without one carry
/// real coordinates, which may still happen to be whole numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum RawVertices {
    /// Integer triples, compressed when the page carries a transform.
    Integer(Vec<IntegerVertex>),
    /// Real-valued triples.
    Real(Vec<Coord3>),
}

/// Errors returned by [`VertexTransform::new`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VertexTransformError {
    /// A scale or translate component was NaN or infinite.
    #[error("vertex transform {field}[{axis}] must be finite, got {value}")]
    NonFinite {
        /// Either `scale` or `translate`.
        field: &'static str,
        /// Component index.
        axis: usize,
        /// Offending value.
        value: f64,
    },
}

/// Scale/translate pair carried by one page.
///
/// # Examples
///
/// ```
/// use geofetch_core::{VertexTransform, decode};
///
/// # fn main() -> Result<(), geofetch_core::VertexTransformError> {
/// let transform = VertexTransform::new([0.5, 0.5, 1.0], [100.0, 200.0, 0.0])?;
/// let coords = decode(&[[2, 4, 7]], &transform);
/// assert_eq!(coords[0].x, 101.0);
/// assert_eq!(coords[0].y, 202.0);
/// assert_eq!(coords[0].z, 7.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexTransform {
    scale: [f64; 3],
    translate: [f64; 3],
}

impl VertexTransform {
    /// Validate and construct a transform.
    ///
    /// # Errors
    ///
    /// Returns [`VertexTransformError::NonFinite`] when any component is NaN
    /// or infinite.
    pub fn new(scale: [f64; 3], translate: [f64; 3]) -> Result<Self, VertexTransformError> {
        for (field, values) in [("scale", scale), ("translate", translate)] {
            if let Some((axis, value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
                return Err(VertexTransformError::NonFinite {
                    field,
                    axis,
                    value: *value,
                });
            }
        }
        Ok(Self { scale, translate })
    }

    /// Per-axis scale factors.
    #[must_use]
    pub const fn scale(&self) -> [f64; 3] {
        self.scale
    }

    /// Per-axis offsets.
    #[must_use]
    pub const fn translate(&self) -> [f64; 3] {
        self.translate
    }

    /// Decode one vertex: multiply, then add, per component.
    ///
    /// Compressed integers stay far below 2^53, so the `i64` to `f64`
    /// conversion is exact.
    #[must_use]
    pub fn apply(&self, vertex: IntegerVertex) -> Coord3 {
        let [vx, vy, vz] = vertex;
        let [sx, sy, sz] = self.scale;
        let [tx, ty, tz] = self.translate;
        Coord3 {
            x: (vx as f64) * sx + tx,
            y: (vy as f64) * sy + ty,
            z: (vz as f64) * sz + tz,
        }
    }
}

/// Decode every vertex of one page with that page's transform.
///
/// The function is total and keeps no state between calls.
#[must_use]
pub fn decode(raw: &[IntegerVertex], transform: &VertexTransform) -> Vec<Coord3> {
    raw.iter().map(|v| transform.apply(*v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn assert_close(actual: f64, expected: f64) {
        let delta = (actual - expected).abs();
        assert!(
            delta <= 1.0e-6,
            "expected {expected}, got {actual} (|Δ| = {delta})"
        );
    }

    #[fixture]
    fn rd_transform() -> VertexTransform {
        VertexTransform::new([0.001, 0.001, 0.001], [80_113.570, 429_309.435, -1.302])
            .expect("valid transform")
    }

    #[rstest]
    fn decodes_reference_vertex(rd_transform: VertexTransform) {
        let coords = decode(&[[5455, 661_895, 5567]], &rd_transform);
        let c = coords.first().expect("one vertex");
        assert_close(c.x, 80_119.025);
        assert_close(c.y, 429_971.330);
        assert_close(c.z, 4.265);
    }

    #[rstest]
    fn wrong_transform_shifts_by_kilometres(rd_transform: VertexTransform) {
        let other = VertexTransform::new([0.001, 0.001, 0.001], [84_000.0, 431_000.0, 0.0])
            .expect("valid transform");
        let good = rd_transform.apply([5455, 661_895, 5567]);
        let bad = other.apply([5455, 661_895, 5567]);
        assert!((good.x - bad.x).abs() > 1_000.0);
        assert!((good.y - bad.y).abs() > 1_000.0);
    }

    #[rstest]
    fn multiplies_before_adding() {
        let transform = VertexTransform::new([2.0, 3.0, 4.0], [1.0, 1.0, 1.0]).expect("valid");
        let c = transform.apply([10, 10, 10]);
        assert_eq!((c.x, c.y, c.z), (21.0, 31.0, 41.0));
    }

    #[rstest]
    fn decodes_empty_input(rd_transform: VertexTransform) {
        assert!(decode(&[], &rd_transform).is_empty());
    }

    #[rstest]
    #[case([f64::NAN, 1.0, 1.0], [0.0; 3], "scale", 0)]
    #[case([1.0; 3], [0.0, 0.0, f64::INFINITY], "translate", 2)]
    fn rejects_non_finite_components(
        #[case] scale: [f64; 3],
        #[case] translate: [f64; 3],
        #[case] expected_field: &str,
        #[case] expected_axis: usize,
    ) {
        let err = VertexTransform::new(scale, translate).expect_err("must fail");
        let VertexTransformError::NonFinite { field, axis, .. } = err;
        assert_eq!(field, expected_field);
        assert_eq!(axis, expected_axis);
    }
}
