//! Subdivide large query areas into a grid of cells.
//!
//! Providers cap the number of features a single query may return. Areas
//! above [`PlannerConfig::area_threshold`] are split into square cells of
//! [`PlannerConfig::cell_size`] CRS units so each cell stays well below that
//! ceiling. The last row and column are clipped to the original box, so the
//! cells tile it exactly: shared edges are the same `f64` values on both
//! sides and the outer edges are the original bounds.

use thiserror::Error;

use crate::bbox::{BoundingBox, BoundingBoxError};
use crate::profile::CompatibilityProfile;

/// Areas at or below this many squared CRS units are fetched whole.
pub const DEFAULT_AREA_THRESHOLD: f64 = 250_000.0;
/// Default cell edge length in CRS units.
pub const DEFAULT_CELL_SIZE: f64 = 250.0;
/// Default upper bound on the number of cells in one plan.
pub const DEFAULT_MAX_CELLS: usize = 10_000;

/// Planner settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct PlannerConfig {
    /// Largest area fetched without subdivision.
    pub area_threshold: f64,
    /// Cell edge length.
    pub cell_size: f64,
    /// Refuse plans with more cells than this.
    pub max_cells: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            area_threshold: DEFAULT_AREA_THRESHOLD,
            cell_size: DEFAULT_CELL_SIZE,
            max_cells: DEFAULT_MAX_CELLS,
        }
    }
}

impl PlannerConfig {
    /// Set the subdivision threshold.
    #[must_use]
    pub const fn with_area_threshold(mut self, area_threshold: f64) -> Self {
        self.area_threshold = area_threshold;
        self
    }

    /// Set the cell edge length.
    #[must_use]
    pub const fn with_cell_size(mut self, cell_size: f64) -> Self {
        self.cell_size = cell_size;
        self
    }

    /// Set the cell-count ceiling.
    #[must_use]
    pub const fn with_max_cells(mut self, max_cells: usize) -> Self {
        self.max_cells = max_cells;
        self
    }
}

/// Errors returned by the planner.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    /// The configuration cannot produce a grid.
    #[error("invalid planner configuration: {0}")]
    InvalidConfig(String),
    /// The grid would exceed [`PlannerConfig::max_cells`].
    #[error("plan needs {cells} cells but at most {max} are allowed")]
    TooManyCells {
        /// Estimated cell count.
        cells: f64,
        /// Configured ceiling.
        max: usize,
    },
    /// A derived cell was not a valid bounding box.
    #[error(transparent)]
    Cell(#[from] BoundingBoxError),
}

/// Deterministic grid planner.
///
/// # Examples
///
/// ```
/// use geofetch_core::{BoundingBox, CellPlanner, CompatibilityProfile, CrsId, PlannerConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let planner = CellPlanner::new(PlannerConfig::default())?;
/// let bbox = BoundingBox::new(0.0, 0.0, 600.0, 500.0, CrsId::new("EPSG:28992"))?;
/// let cells = planner.plan(&bbox, &CompatibilityProfile::default())?;
/// assert_eq!(cells.len(), 6);
/// assert_eq!(cells[2].max_x(), 600.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CellPlanner {
    config: PlannerConfig,
}

impl CellPlanner {
    /// Validate the configuration and build a planner.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidConfig`] for a non-positive or non-finite
    /// cell size or threshold, or a zero cell ceiling.
    pub fn new(config: PlannerConfig) -> Result<Self, PlanError> {
        if !(config.cell_size.is_finite() && config.cell_size > 0.0) {
            return Err(PlanError::InvalidConfig(format!(
                "cell_size must be positive and finite, got {}",
                config.cell_size
            )));
        }
        if config.area_threshold.is_nan() || config.area_threshold < 0.0 {
            return Err(PlanError::InvalidConfig(format!(
                "area_threshold must be non-negative, got {}",
                config.area_threshold
            )));
        }
        if config.max_cells == 0 {
            return Err(PlanError::InvalidConfig("max_cells must be positive".to_owned()));
        }
        Ok(Self { config })
    }

    /// Planner settings.
    #[must_use]
    pub const fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan the cells covering `bbox`, in row-major order from the low-y row.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::TooManyCells`] when the grid would exceed the
    /// configured ceiling.
    pub fn plan(
        &self,
        bbox: &BoundingBox,
        profile: &CompatibilityProfile,
    ) -> Result<Vec<BoundingBox>, PlanError> {
        let area = bbox.area();
        if area <= self.config.area_threshold {
            log::debug!("area {area} within threshold; fetching {bbox} whole");
            return Ok(vec![bbox.clone()]);
        }

        let cell = self.config.cell_size;
        let columns = (bbox.width() / cell).ceil();
        let rows = (bbox.height() / cell).ceil();
        let estimate = columns * rows;
        if estimate > self.config.max_cells as f64 {
            return Err(PlanError::TooManyCells {
                cells: estimate,
                max: self.config.max_cells,
            });
        }

        let xs = edges(bbox.min_x(), bbox.max_x(), cell);
        let ys = edges(bbox.min_y(), bbox.max_y(), cell);
        let mut cells = Vec::with_capacity(xs.len().saturating_sub(1) * ys.len().saturating_sub(1));
        for y in ys.windows(2) {
            for x in xs.windows(2) {
                if let ([x0, x1], [y0, y1]) = (x, y) {
                    cells.push(BoundingBox::new(*x0, *y0, *x1, *y1, bbox.crs().clone())?);
                }
            }
        }
        log::debug!(
            "split {bbox} into {} cells of {cell} units (page ceiling {:?})",
            cells.len(),
            profile.max_features_per_page
        );
        Ok(cells)
    }
}

/// Strictly increasing grid edges from `min` to `max` inclusive.
fn edges(min: f64, max: f64, step: f64) -> Vec<f64> {
    let mut out = vec![min];
    let mut i: u32 = 1;
    loop {
        let next = min + f64::from(i) * step;
        if next >= max {
            break;
        }
        out.push(next);
        i += 1;
    }
    out.push(max);
    out
}
