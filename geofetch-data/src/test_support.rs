//! Test doubles for the transport and cell-fetch seams.
//!
//! [`StubTransport`] answers GET requests from a script or a closure and
//! records every URL it saw. [`ScriptedCellFetcher`] stands in for the whole
//! page pipeline when only grid walking is under test.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use geofetch_core::test_support::point_feature;
use geofetch_core::{BoundingBox, FailureCause};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::http::{Transport, TransportError, TransportResponse};
use crate::walker::{CellError, CellFetch, CellFetcher};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canned answer of a [`StubTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReply {
    /// A response with a status and body.
    Response {
        /// HTTP status.
        status: u16,
        /// Body bytes.
        body: Vec<u8>,
    },
    /// A connection-level failure.
    NetworkError(String),
    /// The request timed out.
    Timeout,
    /// Another reply, after a delay.
    Delayed {
        /// Time to wait first.
        delay: Duration,
        /// Reply sent afterwards.
        reply: Box<StubReply>,
    },
}

impl StubReply {
    /// Empty body with `status`.
    #[must_use]
    pub const fn status(status: u16) -> Self {
        Self::Response {
            status,
            body: Vec::new(),
        }
    }

    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self::Response {
            status: 200,
            body: body.into().into_bytes(),
        }
    }

    /// Network failure with `message`.
    #[must_use]
    pub fn network_error(message: impl Into<String>) -> Self {
        Self::NetworkError(message.into())
    }

    /// Send this reply after `delay`.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed {
            delay,
            reply: Box::new(self),
        }
    }
}

type Responder = Box<dyn Fn(&Url) -> StubReply + Send + Sync>;

enum Script {
    Respond(Responder),
    Sequence(Mutex<VecDeque<StubReply>>),
}

/// In-memory [`Transport`].
pub struct StubTransport {
    script: Script,
    requests: Mutex<Vec<Url>>,
}

impl std::fmt::Debug for StubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubTransport")
            .field("requests", &*lock(&self.requests))
            .finish_non_exhaustive()
    }
}

impl StubTransport {
    /// Answer every request with `respond(url)`.
    pub fn from_fn<F>(respond: F) -> Self
    where
        F: Fn(&Url) -> StubReply + Send + Sync + 'static,
    {
        Self {
            script: Script::Respond(Box::new(respond)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer requests with `replies` in order, then with network errors.
    #[must_use]
    pub fn sequence(replies: Vec<StubReply>) -> Self {
        Self {
            script: Script::Sequence(Mutex::new(replies.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// URLs requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Url> {
        lock(&self.requests).clone()
    }

    fn reply_for(&self, url: &Url) -> StubReply {
        match &self.script {
            Script::Respond(respond) => respond(url),
            Script::Sequence(replies) => lock(replies)
                .pop_front()
                .unwrap_or_else(|| StubReply::network_error("stub script exhausted")),
        }
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn get(
        &self,
        url: &Url,
        _headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        lock(&self.requests).push(url.clone());
        let mut reply = self.reply_for(url);
        while let StubReply::Delayed { delay, reply: next } = reply {
            tokio::time::sleep(delay).await;
            reply = *next;
        }
        match reply {
            StubReply::Response { status, body } => Ok(TransportResponse {
                status,
                headers: BTreeMap::new(),
                body,
            }),
            StubReply::NetworkError(message) => Err(TransportError::Network {
                url: url.to_string(),
                message,
            }),
            StubReply::Timeout | StubReply::Delayed { .. } => Err(TransportError::Timeout {
                url: url.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

/// [`CellFetcher`] returning synthetic point features.
///
/// Cell `i` yields features `cell-{i}-0`, `cell-{i}-1`, and so on. Failing
/// cells report a transient `503`.
#[derive(Debug, Default)]
pub struct ScriptedCellFetcher {
    features_per_cell: usize,
    failing: BTreeSet<usize>,
    shared_feature: Option<String>,
    cancel_on: Option<usize>,
    delay: Duration,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedCellFetcher {
    /// Yield `features_per_cell` features for every cell.
    #[must_use]
    pub fn new(features_per_cell: usize) -> Self {
        Self {
            features_per_cell,
            ..Self::default()
        }
    }

    /// Fail every attempt at the given cells.
    #[must_use]
    pub fn failing_cells(mut self, cells: impl IntoIterator<Item = usize>) -> Self {
        self.failing.extend(cells);
        self
    }

    /// Add a feature with `id` to every cell, as a border-straddling feature
    /// would be.
    #[must_use]
    pub fn with_shared_feature(mut self, id: impl Into<String>) -> Self {
        self.shared_feature = Some(id.into());
        self
    }

    /// Cancel the run while fetching cell `index`; that cell still completes.
    #[must_use]
    pub const fn cancel_on(mut self, index: usize) -> Self {
        self.cancel_on = Some(index);
        self
    }

    /// Sleep for `delay` in every attempt.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cell indices of every attempt, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<usize> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CellFetcher for ScriptedCellFetcher {
    async fn fetch_cell(
        &self,
        index: usize,
        bbox: &BoundingBox,
        cancel: &CancellationToken,
    ) -> Result<CellFetch, CellError> {
        lock(&self.calls).push(index);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.cancel_on == Some(index) {
            cancel.cancel();
        }
        if self.failing.contains(&index) {
            return Err(CellError {
                cause: FailureCause::Fetch {
                    message: "service unavailable".to_owned(),
                    status: Some(503),
                },
                transient: true,
            });
        }

        let mut features: Vec<_> = (0..self.features_per_cell)
            .map(|n| point_feature(&format!("cell-{index}-{n}"), bbox.min_x(), bbox.min_y(), index))
            .collect();
        if let Some(id) = &self.shared_feature {
            features.push(point_feature(id, bbox.max_x(), bbox.max_y(), index));
        }
        Ok(CellFetch {
            features,
            interrupted: false,
        })
    }
}
