//! Pool runtime statistics.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::pool::WorkerId;

/// Counters for a single worker thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub last_active: Option<DateTime<Utc>>,
}

/// Pool-wide aggregates plus per-worker counters.
///
/// `processed` counts jobs that eventually succeeded, `failed` jobs that
/// reached their error callback, and `retried` individual retry attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    /// Jobs executed on the submitting thread because the queue was full.
    pub executed_inline: u64,
    pub workers: BTreeMap<usize, WorkerStats>,
}

/// Lock-guarded metrics; readers only ever get a snapshot.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: RwLock<PoolMetrics>,
}

impl MetricsRecorder {
    pub(crate) fn new(workers: usize) -> Self {
        let metrics = PoolMetrics {
            workers: (0..workers).map(|id| (id, WorkerStats::default())).collect(),
            ..Default::default()
        };
        Self {
            inner: RwLock::new(metrics),
        }
    }

    pub(crate) fn snapshot(&self) -> PoolMetrics {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn record_success(&self, worker: WorkerId) {
        self.update(|m| {
            m.processed += 1;
            if let Some(stats) = worker_stats(m, worker) {
                stats.jobs_processed += 1;
                stats.last_active = Some(Utc::now());
            }
        });
    }

    pub(crate) fn record_failure(&self, worker: WorkerId) {
        self.update(|m| {
            m.failed += 1;
            if let Some(stats) = worker_stats(m, worker) {
                stats.jobs_failed += 1;
                stats.last_active = Some(Utc::now());
            }
        });
    }

    pub(crate) fn record_retry(&self) {
        self.update(|m| m.retried += 1);
    }

    pub(crate) fn record_inline(&self) {
        self.update(|m| m.executed_inline += 1);
    }

    fn update(&self, f: impl FnOnce(&mut PoolMetrics)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }
}

fn worker_stats(metrics: &mut PoolMetrics, worker: WorkerId) -> Option<&mut WorkerStats> {
    match worker {
        WorkerId::Worker(id) => Some(metrics.workers.entry(id).or_default()),
        WorkerId::Caller => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached_from_live_counters() {
        let recorder = MetricsRecorder::new(2);
        let mut snapshot = recorder.snapshot();
        snapshot.processed = 99;

        recorder.record_success(WorkerId::Worker(1));

        let fresh = recorder.snapshot();
        assert_eq!(fresh.processed, 1);
        assert_eq!(fresh.workers[&1].jobs_processed, 1);
        assert!(fresh.workers[&1].last_active.is_some());
        assert_eq!(fresh.workers[&0], WorkerStats::default());
    }

    #[test]
    fn caller_executions_only_touch_aggregates() {
        let recorder = MetricsRecorder::new(1);
        recorder.record_failure(WorkerId::Caller);

        let m = recorder.snapshot();
        assert_eq!(m.failed, 1);
        assert_eq!(m.workers[&0].jobs_failed, 0);
    }
}
