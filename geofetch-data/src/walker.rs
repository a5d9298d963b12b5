//! Concurrent grid walking.
//!
//! Every cell runs as its own task, gated by a semaphore. Tasks never touch
//! shared state: they report `Started`/`Finished` events over a channel to
//! the single consumer loop in [`GridWalker::run`], which owns the
//! [`CellTable`] and the [`FeatureDeduplicator`].
//!
//! Cancellation is cooperative. Cells that have not started stay pending
//! and are reported as cancelled; running cells finish their current page
//! and stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geofetch_core::{
    BoundingBox, CellFailure, CellStatus, CellTable, DecodedFeature, DownloadFailedError,
    FailureCause, FeatureDeduplicator, PartialFailure, ProgressEvent, Retrieval,
};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::fetch::FetchError;

/// Cells fetched at once unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 5;
/// Attempts per cell unless configured otherwise.
pub const DEFAULT_MAX_CELL_ATTEMPTS: u32 = 2;
/// Delay before re-running a failed cell.
pub const DEFAULT_CELL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Features of one cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellFetch {
    /// Decoded features in page order.
    pub features: Vec<DecodedFeature>,
    /// Paging stopped early because the run was cancelled.
    pub interrupted: bool,
}

/// A cell attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{cause}")]
pub struct CellError {
    /// Reported cause.
    pub cause: FailureCause,
    /// Whether re-running the cell could help.
    pub transient: bool,
}

impl From<&FetchError> for CellError {
    fn from(err: &FetchError) -> Self {
        Self {
            cause: FailureCause::Fetch {
                message: err.to_string(),
                status: err.status(),
            },
            transient: err.is_transient(),
        }
    }
}

impl From<FetchError> for CellError {
    fn from(err: FetchError) -> Self {
        Self::from(&err)
    }
}

/// Fetches every feature inside one cell.
#[async_trait]
pub trait CellFetcher: Send + Sync {
    /// Fetch all pages of cell `index`.
    ///
    /// Implementations should check `cancel` between pages and return what
    /// they have with [`CellFetch::interrupted`] set.
    async fn fetch_cell(
        &self,
        index: usize,
        bbox: &BoundingBox,
        cancel: &CancellationToken,
    ) -> Result<CellFetch, CellError>;
}

#[derive(Debug)]
enum CellEvent {
    Started {
        index: usize,
    },
    Finished {
        index: usize,
        result: Result<CellFetch, CellError>,
    },
}

/// Runs a [`CellFetcher`] over a list of cells with bounded concurrency.
#[derive(Debug, Clone)]
pub struct GridWalker {
    concurrency: usize,
    max_cell_attempts: u32,
    cell_retry_delay: Duration,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Default for GridWalker {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_cell_attempts: DEFAULT_MAX_CELL_ATTEMPTS,
            cell_retry_delay: DEFAULT_CELL_RETRY_DELAY,
            progress: None,
        }
    }
}

impl GridWalker {
    /// Create a walker with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of concurrently fetched cells. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the attempt budget per cell. Zero is treated as one.
    #[must_use]
    pub fn with_max_cell_attempts(mut self, attempts: u32) -> Self {
        self.max_cell_attempts = attempts.max(1);
        self
    }

    /// Set the base delay between cell attempts.
    #[must_use]
    pub const fn with_cell_retry_delay(mut self, delay: Duration) -> Self {
        self.cell_retry_delay = delay;
        self
    }

    /// Send a [`ProgressEvent`] to `sender` whenever a cell finishes.
    #[must_use]
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Concurrency in effect.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch every cell and merge the features.
    ///
    /// Returns [`Retrieval::Complete`] when every cell succeeded and
    /// [`Retrieval::Partial`] when some failed or the run was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadFailedError`] when every cell failed without the
    /// run being cancelled.
    pub async fn run<F>(
        &self,
        cells: Vec<BoundingBox>,
        fetcher: Arc<F>,
        cancel: CancellationToken,
    ) -> Result<Retrieval, DownloadFailedError>
    where
        F: CellFetcher + ?Sized + 'static,
    {
        let total_cells = cells.len();
        let mut table = CellTable::new(cells.clone());
        let mut dedup = FeatureDeduplicator::new();
        if total_cells == 0 {
            return Ok(Retrieval::Complete(dedup.finalize()));
        }

        let (events, mut inbox) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, bbox) in cells.into_iter().enumerate() {
            let task = CellTask {
                index,
                bbox,
                fetcher: Arc::clone(&fetcher),
                cancel: cancel.clone(),
                max_attempts: self.max_cell_attempts,
                retry_delay: self.cell_retry_delay,
                events: events.clone(),
            };
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = task.cancel.cancelled() => return,
                    permit = permits.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else { return };
                if task.cancel.is_cancelled() {
                    return;
                }
                task.run().await;
            });
        }
        drop(events);

        while let Some(event) = inbox.recv().await {
            match event {
                CellEvent::Started { index } => {
                    if let Err(err) = table.start(index) {
                        warn!("ignoring start of cell {index}: {err}");
                    }
                }
                CellEvent::Finished { index, result } => {
                    let cell_feature_count = finish_cell(&mut table, &mut dedup, index, result);
                    self.report(ProgressEvent {
                        cell_index: index,
                        total_cells,
                        cell_feature_count,
                        cumulative_features: dedup.len(),
                    });
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("cell task ended abnormally: {err}");
            }
        }

        let cancelled = cancel.is_cancelled();
        let leftover = if cancelled {
            FailureCause::Cancelled
        } else {
            FailureCause::Fetch {
                message: "cell task ended without a result".to_owned(),
                status: None,
            }
        };
        for failure in table.fail_unfinished(&leftover) {
            dedup.record_failure(failure);
        }

        let succeeded = table.count(CellStatus::Succeeded);
        let features = dedup.finalize();
        info!(
            "grid walk finished: {succeeded}/{total_cells} cell(s) succeeded, {} feature(s), {} duplicate(s) discarded",
            features.len(),
            features.duplicates_discarded
        );

        if features.failed_cells.is_empty() {
            Ok(Retrieval::Complete(features))
        } else if cancelled {
            Ok(Retrieval::Partial(PartialFailure {
                features,
                cancelled: true,
            }))
        } else if succeeded == 0 {
            Err(DownloadFailedError {
                failures: features.failed_cells,
            })
        } else {
            Ok(Retrieval::Partial(PartialFailure {
                features,
                cancelled: false,
            }))
        }
    }

    fn report(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.send(event).ok();
        }
    }
}

fn finish_cell(
    table: &mut CellTable,
    dedup: &mut FeatureDeduplicator,
    index: usize,
    result: Result<CellFetch, CellError>,
) -> usize {
    let failure = match result {
        Ok(fetch) if !fetch.interrupted => {
            if let Err(err) = table.succeed(index, fetch.features) {
                warn!("dropping result of cell {index}: {err}");
                return 0;
            }
            let features = table.take_features(index);
            let count = features.len();
            let added = dedup.ingest_all(features);
            debug!("cell {index} done: {count} feature(s), {added} new");
            return count;
        }
        Ok(fetch) => {
            // Pages completed before cancellation are still valid.
            let count = fetch.features.len();
            dedup.ingest_all(fetch.features);
            table.fail(index, FailureCause::Cancelled).map(|f| (f, count))
        }
        Err(err) => table.fail(index, err.cause).map(|f| (f, 0)),
    };
    match failure {
        Ok((failure, count)) => {
            log_failure(&failure);
            dedup.record_failure(failure);
            count
        }
        Err(err) => {
            warn!("dropping result of cell {index}: {err}");
            0
        }
    }
}

fn log_failure(failure: &CellFailure) {
    if failure.cause == FailureCause::Cancelled {
        debug!("{failure}");
    } else {
        warn!("{failure}");
    }
}

struct CellTask<F: ?Sized> {
    index: usize,
    bbox: BoundingBox,
    fetcher: Arc<F>,
    cancel: CancellationToken,
    max_attempts: u32,
    retry_delay: Duration,
    events: mpsc::UnboundedSender<CellEvent>,
}

impl<F> CellTask<F>
where
    F: CellFetcher + ?Sized,
{
    async fn run(self) {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            if self.events.send(CellEvent::Started { index: self.index }).is_err() {
                return;
            }
            match self
                .fetcher
                .fetch_cell(self.index, &self.bbox, &self.cancel)
                .await
            {
                Err(err) if err.transient && attempt < self.max_attempts => {
                    let delay = self.retry_delay.saturating_mul(attempt);
                    warn!(
                        "cell {} attempt {attempt} failed: {err}; retrying in {delay:?}",
                        self.index
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => break Ok(CellFetch {
                            features: Vec::new(),
                            interrupted: true,
                        }),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                result => break result,
            }
        };
        let _ = self.events.send(CellEvent::Finished {
            index: self.index,
            result,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCellFetcher;
    use geofetch_core::test_support::rd_bbox;
    use rstest::{fixture, rstest};

    #[fixture]
    fn ten_cells() -> Vec<BoundingBox> {
        (0..10)
            .map(|i| {
                let x = 80_000.0 + f64::from(i) * 250.0;
                rd_bbox(x, 429_000.0, x + 250.0, 429_250.0).expect("valid bbox")
            })
            .collect()
    }

    fn walker() -> GridWalker {
        GridWalker::new()
            .with_concurrency(3)
            .with_cell_retry_delay(Duration::from_millis(1))
    }

    #[rstest]
    #[tokio::test]
    async fn all_cells_succeeding_is_complete(ten_cells: Vec<BoundingBox>) {
        let fetcher = Arc::new(ScriptedCellFetcher::new(2));

        let retrieval = walker()
            .run(ten_cells, fetcher, CancellationToken::new())
            .await
            .expect("run succeeds");

        assert!(retrieval.is_complete());
        assert_eq!(retrieval.feature_set().len(), 20);
    }

    #[rstest]
    #[tokio::test]
    async fn three_failing_cells_yield_partial_failure(ten_cells: Vec<BoundingBox>) {
        let failing = [1, 4, 8];
        let expected: Vec<BoundingBox> = failing.iter().map(|&i| ten_cells[i].clone()).collect();
        let fetcher = Arc::new(ScriptedCellFetcher::new(2).failing_cells(failing));

        let retrieval = walker()
            .run(ten_cells, fetcher, CancellationToken::new())
            .await
            .expect("partial result is not an error");

        let Retrieval::Partial(partial) = retrieval else {
            panic!("expected partial failure");
        };
        assert!(!partial.cancelled);
        assert_eq!(partial.features.len(), 14);
        let failed: Vec<BoundingBox> = partial.failed_cells().iter().map(|f| f.bbox.clone()).collect();
        assert_eq!(failed, expected);
        assert!(partial.failed_cells().iter().all(|f| f.attempts == 2));
    }

    #[rstest]
    #[tokio::test]
    async fn every_cell_failing_is_download_failed(ten_cells: Vec<BoundingBox>) {
        let fetcher = Arc::new(ScriptedCellFetcher::new(2).failing_cells(0..10));

        let err = walker()
            .run(ten_cells, fetcher, CancellationToken::new())
            .await
            .expect_err("every cell fails");

        assert_eq!(err.failures.len(), 10);
    }

    #[rstest]
    #[tokio::test]
    async fn shared_border_features_are_counted_once(ten_cells: Vec<BoundingBox>) {
        let fetcher = Arc::new(ScriptedCellFetcher::new(1).with_shared_feature("border"));

        let retrieval = walker()
            .run(ten_cells, fetcher, CancellationToken::new())
            .await
            .expect("run succeeds");

        let set = retrieval.feature_set();
        assert_eq!(set.len(), 11);
        assert_eq!(set.duplicates_discarded, 9);
    }

    #[rstest]
    #[tokio::test]
    async fn cancelling_before_start_reports_every_cell(ten_cells: Vec<BoundingBox>) {
        let fetcher = Arc::new(ScriptedCellFetcher::new(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let retrieval = walker()
            .run(ten_cells, fetcher, cancel)
            .await
            .expect("cancellation is not an error");

        let Retrieval::Partial(partial) = retrieval else {
            panic!("expected partial result");
        };
        assert!(partial.cancelled);
        assert!(partial.features.is_empty());
        assert_eq!(partial.failed_cells().len(), 10);
        assert!(
            partial
                .failed_cells()
                .iter()
                .all(|f| f.cause == FailureCause::Cancelled)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn cancelling_mid_run_keeps_finished_cells(ten_cells: Vec<BoundingBox>) {
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(ScriptedCellFetcher::new(1).cancel_on(0));

        let retrieval = GridWalker::new()
            .with_concurrency(1)
            .run(ten_cells, fetcher, cancel)
            .await
            .expect("cancellation is not an error");

        let Retrieval::Partial(partial) = retrieval else {
            panic!("expected partial result");
        };
        assert!(partial.cancelled);
        assert!(!partial.features.is_empty());
        assert_eq!(
            partial.features.len() + partial.failed_cells().len(),
            10
        );
    }

    #[rstest]
    #[tokio::test]
    async fn progress_is_reported_per_cell(ten_cells: Vec<BoundingBox>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let fetcher = Arc::new(ScriptedCellFetcher::new(3).failing_cells([2]));

        walker()
            .with_progress(sender)
            .run(ten_cells, fetcher, CancellationToken::new())
            .await
            .expect("partial result");

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 10);
        assert!(events.iter().all(|e| e.total_cells == 10));
        assert!(
            events
                .windows(2)
                .all(|w| w[0].cumulative_features <= w[1].cumulative_features)
        );
        assert_eq!(events.last().map(|e| e.cumulative_features), Some(27));
    }

    #[rstest]
    #[tokio::test]
    async fn no_cells_is_an_empty_complete_result() {
        let fetcher = Arc::new(ScriptedCellFetcher::new(1));

        let retrieval = walker()
            .run(Vec::new(), fetcher, CancellationToken::new())
            .await
            .expect("nothing to do");

        assert!(retrieval.is_complete());
        assert!(retrieval.feature_set().is_empty());
    }
}
