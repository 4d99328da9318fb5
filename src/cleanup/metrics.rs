//! Orphan cleanup metrics.

use crate::metrics::{render_all, Counter, Histogram, HistogramSnapshot, PHASE_BUCKETS};
use std::time::Duration;

#[derive(Debug)]
pub struct CleanupMetrics {
    scanned: Counter,
    deleted: Counter,
    batches: Counter,
    passes: Counter,
    range_deletions: Counter,
    pass_duration: Histogram,
}

/// Plain-data copy of [`CleanupMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupMetricsSnapshot {
    pub scanned: u64,
    pub deleted: u64,
    pub batches: u64,
    pub passes: u64,
    pub range_deletions: u64,
    pub pass_duration: HistogramSnapshot,
}

impl Default for CleanupMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupMetrics {
    pub fn new() -> Self {
        Self {
            scanned: Counter::new("rangeshift_cleanup_scanned_total", "Documents examined by cleanup"),
            deleted: Counter::new("rangeshift_cleanup_deleted_total", "Orphans deleted"),
            batches: Counter::new("rangeshift_cleanup_batches_total", "Cleanup batches run"),
            passes: Counter::new("rangeshift_cleanup_passes_total", "Cleanup passes completed"),
            range_deletions: Counter::new(
                "rangeshift_range_deletions_total",
                "Scheduled range deletions completed",
            ),
            pass_duration: Histogram::new(
                "rangeshift_cleanup_pass_seconds",
                "Duration of a cleanup pass",
                PHASE_BUCKETS,
            ),
        }
    }

    pub fn record_batch(&self, scanned: u64, deleted: u64) {
        self.batches.inc();
        self.scanned.inc_by(scanned);
        self.deleted.inc_by(deleted);
    }

    pub fn record_pass(&self, duration: Duration) {
        self.passes.inc();
        self.pass_duration.observe(duration);
    }

    pub fn record_range_deletion(&self) {
        self.range_deletions.inc();
    }

    pub fn snapshot(&self) -> CleanupMetricsSnapshot {
        CleanupMetricsSnapshot {
            scanned: self.scanned.get(),
            deleted: self.deleted.get(),
            batches: self.batches.get(),
            passes: self.passes.get(),
            range_deletions: self.range_deletions.get(),
            pass_duration: self.pass_duration.snapshot(),
        }
    }

    pub fn render(&self) -> String {
        render_all(&[
            &self.scanned,
            &self.deleted,
            &self.batches,
            &self.passes,
            &self.range_deletions,
            &self.pass_duration,
        ])
    }
}
