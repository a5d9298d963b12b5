//! Per-cell bookkeeping for one grid walk.
//!
//! A [`CellTable`] is owned by exactly one task for the duration of a run.
//! It enforces the cell lifecycle `Pending → InFlight → Succeeded | Failed`
//! (an in-flight cell may be restarted for a retry) and keeps every cell's
//! status until the run returns, so failures can be reported with their
//! bounding boxes.

use std::fmt;

use thiserror::Error;

use crate::bbox::BoundingBox;
use crate::feature::DecodedFeature;
use crate::geometry::LevelOfDetail;

/// Lifecycle state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Not yet started.
    Pending,
    /// A fetch is running.
    InFlight,
    /// All pages fetched and decoded.
    Succeeded,
    /// Gave up; see the matching [`CellFailure`].
    Failed,
}

impl CellStatus {
    /// Whether the cell has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a cell failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// A page could not be fetched or parsed after all retries.
    Fetch {
        /// Last error message.
        message: String,
        /// HTTP status, when the server answered.
        status: Option<u16>,
    },
    /// A feature lacked the requested level of detail and the run was
    /// configured to fail the cell.
    LevelOfDetail {
        /// Offending feature.
        feature_id: String,
        /// Requested tag.
        lod: LevelOfDetail,
    },
    /// The run was cancelled before the cell finished.
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch {
                message,
                status: Some(status),
            } => write!(f, "fetch failed with HTTP {status}: {message}"),
            Self::Fetch {
                message,
                status: None,
            } => write!(f, "fetch failed: {message}"),
            Self::LevelOfDetail { feature_id, lod } => {
                write!(f, "feature {feature_id} has no LOD {lod}")
            }
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A failed cell as reported to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CellFailure {
    /// Position in the plan.
    pub index: usize,
    /// Area whose features are missing.
    pub bbox: BoundingBox,
    /// Attempts made.
    pub attempts: u32,
    /// Last cause.
    pub cause: FailureCause,
}

impl fmt::Display for CellFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cell {} {} after {} attempt(s): {}",
            self.index, self.bbox, self.attempts, self.cause
        )
    }
}

/// One planned cell.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    /// Position in the plan.
    pub index: usize,
    /// Cell area.
    pub bbox: BoundingBox,
    /// Lifecycle state.
    pub status: CellStatus,
    /// Attempts started so far.
    pub attempt: u32,
    /// Features held until they are merged.
    pub features: Vec<DecodedFeature>,
}

/// Per-cell completion event for progress indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Cell that reached a terminal state.
    pub cell_index: usize,
    /// Cells in the plan.
    pub total_cells: usize,
    /// Features the cell returned.
    pub cell_feature_count: usize,
    /// Distinct features merged so far; never decreases within a run.
    pub cumulative_features: usize,
}

/// A status change the table refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellStateError {
    /// The index is outside the plan.
    #[error("cell {index} does not exist")]
    UnknownCell {
        /// Requested index.
        index: usize,
    },
    /// The transition is not part of the lifecycle.
    #[error("cell {index} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Cell index.
        index: usize,
        /// Current status.
        from: CellStatus,
        /// Requested status.
        to: CellStatus,
    },
}

/// Status table for every cell of one run.
#[derive(Debug, Clone, Default)]
pub struct CellTable {
    cells: Vec<GridCell>,
}

impl CellTable {
    /// Create a table with every cell pending.
    #[must_use]
    pub fn new(bboxes: Vec<BoundingBox>) -> Self {
        let cells = bboxes
            .into_iter()
            .enumerate()
            .map(|(index, bbox)| GridCell {
                index,
                bbox,
                status: CellStatus::Pending,
                attempt: 0,
                features: Vec::new(),
            })
            .collect();
        Self { cells }
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the plan is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Borrow a cell.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&GridCell> {
        self.cells.get(index)
    }

    /// Iterate over all cells in plan order.
    pub fn iter(&self) -> impl Iterator<Item = &GridCell> {
        self.cells.iter()
    }

    fn cell_mut(&mut self, index: usize) -> Result<&mut GridCell, CellStateError> {
        self.cells
            .get_mut(index)
            .ok_or(CellStateError::UnknownCell { index })
    }

    /// Mark a cell in flight and return its attempt number.
    ///
    /// # Errors
    ///
    /// Fails for unknown or terminal cells.
    pub fn start(&mut self, index: usize) -> Result<u32, CellStateError> {
        let cell = self.cell_mut(index)?;
        if cell.status.is_terminal() {
            return Err(CellStateError::InvalidTransition {
                index,
                from: cell.status,
                to: CellStatus::InFlight,
            });
        }
        cell.status = CellStatus::InFlight;
        cell.attempt += 1;
        Ok(cell.attempt)
    }

    /// Mark an in-flight cell succeeded and hold its features.
    ///
    /// # Errors
    ///
    /// Fails for unknown cells or cells that are not in flight.
    pub fn succeed(
        &mut self,
        index: usize,
        features: Vec<DecodedFeature>,
    ) -> Result<(), CellStateError> {
        let cell = self.cell_mut(index)?;
        if cell.status != CellStatus::InFlight {
            return Err(CellStateError::InvalidTransition {
                index,
                from: cell.status,
                to: CellStatus::Succeeded,
            });
        }
        cell.status = CellStatus::Succeeded;
        cell.features = features;
        Ok(())
    }

    /// Mark a non-terminal cell failed.
    ///
    /// # Errors
    ///
    /// Fails for unknown or already terminal cells.
    pub fn fail(&mut self, index: usize, cause: FailureCause) -> Result<CellFailure, CellStateError> {
        let cell = self.cell_mut(index)?;
        if cell.status.is_terminal() {
            return Err(CellStateError::InvalidTransition {
                index,
                from: cell.status,
                to: CellStatus::Failed,
            });
        }
        cell.status = CellStatus::Failed;
        cell.features.clear();
        Ok(CellFailure {
            index,
            bbox: cell.bbox.clone(),
            attempts: cell.attempt,
            cause,
        })
    }

    /// Fail every cell that has not finished.
    pub fn fail_unfinished(&mut self, cause: &FailureCause) -> Vec<CellFailure> {
        self.cells
            .iter_mut()
            .filter(|cell| !cell.status.is_terminal())
            .map(|cell| {
                cell.status = CellStatus::Failed;
                CellFailure {
                    index: cell.index,
                    bbox: cell.bbox.clone(),
                    attempts: cell.attempt,
                    cause: cause.clone(),
                }
            })
            .collect()
    }

    /// Move a cell's features out for merging.
    pub fn take_features(&mut self, index: usize) -> Vec<DecodedFeature> {
        self.cells
            .get_mut(index)
            .map(|cell| std::mem::take(&mut cell.features))
            .unwrap_or_default()
    }

    /// Whether every cell is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.cells.iter().all(|c| c.status.is_terminal())
    }

    /// Count of cells with `status`.
    #[must_use]
    pub fn count(&self, status: CellStatus) -> usize {
        self.cells.iter().filter(|c| c.status == status).count()
    }
}
