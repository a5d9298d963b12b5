//! Test-only builders for features and failures used by unit and behaviour
//! tests.

use crate::bbox::{BoundingBox, BoundingBoxError, CrsId};
use crate::feature::{Attributes, DecodedFeature, PageRef};
use crate::geometry::GeometryValue;
use crate::grid::{CellFailure, FailureCause};
use crate::transform::Coord3;

/// CRS used by the Dutch national grid fixtures.
pub const RD_NEW: &str = "EPSG:28992";

/// Bounding box in the Dutch national grid.
///
/// # Errors
///
/// Propagates [`BoundingBoxError`] for degenerate input.
pub fn rd_bbox(
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
) -> Result<BoundingBox, BoundingBoxError> {
    BoundingBox::new(min_x, min_y, max_x, max_y, CrsId::new(RD_NEW))
}

/// Point feature attributed to page zero of `cell_index`.
#[must_use]
pub fn point_feature(id: &str, x: f64, y: f64, cell_index: usize) -> DecodedFeature {
    DecodedFeature {
        id: id.to_owned(),
        geometry: GeometryValue::Point(Coord3 { x, y, z: 0.0 }),
        attributes: Attributes::new(),
        source_page: PageRef {
            cell_index,
            page_number: 0,
            url: format!("https://stub.test/cells/{cell_index}"),
        },
    }
}

/// Failure record with a fetch cause.
#[must_use]
pub fn fetch_failure(index: usize, bbox: BoundingBox, message: &str) -> CellFailure {
    CellFailure {
        index,
        bbox,
        attempts: 1,
        cause: FailureCause::Fetch {
            message: message.to_owned(),
            status: None,
        },
    }
}
