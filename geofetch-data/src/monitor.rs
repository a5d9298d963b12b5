//! Usage counters for compatibility quirks.
//!
//! The monitor answers "which workarounds are we actually relying on?" so
//! that a quirk can be retired once a provider fixes its server.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use geofetch_core::QuirkKind;

/// Usage of one quirk for one `(provider, protocol)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuirkUsage {
    /// Number of requests the quirk changed.
    pub applied_count: u64,
    /// First application.
    pub first_applied: SystemTime,
    /// Most recent application.
    pub last_applied: SystemTime,
}

type UsageKey = (String, String, QuirkKind);

/// Thread-safe quirk usage log shared by every fetch of a retriever.
#[derive(Debug, Default)]
pub struct QuirksMonitor {
    usage: Mutex<HashMap<UsageKey, QuirkUsage>>,
}

impl QuirksMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `quirk` changed a request.
    pub fn record(&self, provider: &str, protocol: &str, quirk: QuirkKind) {
        let now = SystemTime::now();
        self.lock()
            .entry((provider.to_owned(), protocol.to_owned(), quirk))
            .and_modify(|usage| {
                usage.applied_count += 1;
                usage.last_applied = now;
            })
            .or_insert(QuirkUsage {
                applied_count: 1,
                first_applied: now,
                last_applied: now,
            });
    }

    /// Record every quirk in `quirks`.
    pub fn record_all(&self, provider: &str, protocol: &str, quirks: &[QuirkKind]) {
        for quirk in quirks {
            self.record(provider, protocol, *quirk);
        }
    }

    /// Usage of one quirk, if it was ever applied.
    #[must_use]
    pub fn usage(&self, provider: &str, protocol: &str, quirk: QuirkKind) -> Option<QuirkUsage> {
        self.lock()
            .get(&(provider.to_owned(), protocol.to_owned(), quirk))
            .copied()
    }

    /// Sorted copy of all recorded usage.
    #[must_use]
    pub fn snapshot(&self) -> Vec<((String, String, QuirkKind), QuirkUsage)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, usage)| (key.clone(), *usage))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Forget all recorded usage.
    pub fn reset(&self) {
        self.lock().clear();
    }

    // Counters stay meaningful after a panicking writer.
    fn lock(&self) -> MutexGuard<'_, HashMap<UsageKey, QuirkUsage>> {
        self.usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn counts_repeated_application() {
        let monitor = QuirksMonitor::new();
        monitor.record("pdok", "ogc-features", QuirkKind::TrailingSlash);
        monitor.record("pdok", "ogc-features", QuirkKind::TrailingSlash);

        let usage = monitor
            .usage("pdok", "ogc-features", QuirkKind::TrailingSlash)
            .expect("usage recorded");
        assert_eq!(usage.applied_count, 2);
        assert!(usage.first_applied <= usage.last_applied);
    }

    #[rstest]
    fn keys_usage_by_provider_and_quirk() {
        let monitor = QuirksMonitor::new();
        monitor.record_all(
            "bag3d",
            "ogc-features",
            &[QuirkKind::PageSizeClamp, QuirkKind::OmitBboxCrs],
        );
        monitor.record("pdok", "ogc-features", QuirkKind::PageSizeClamp);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].0.0, "bag3d");
        assert!(
            monitor
                .usage("pdok", "ogc-features", QuirkKind::OmitBboxCrs)
                .is_none()
        );
    }

    #[rstest]
    fn reset_clears_usage() {
        let monitor = QuirksMonitor::new();
        monitor.record("pdok", "ogc-features", QuirkKind::ExtraHeaders);
        monitor.reset();
        assert!(monitor.snapshot().is_empty());
    }
}
