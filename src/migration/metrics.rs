//! Migration metrics for one shard, covering both donor and recipient roles.

use crate::metrics::{render_all, CodeCounter, Counter, Gauge, Histogram, HistogramSnapshot, PHASE_BUCKETS};
use std::time::Duration;

/// Counters and timings of migrations run by one shard.
#[derive(Debug)]
pub struct MigrationMetrics {
    started: Counter,
    committed: Counter,
    aborted: CodeCounter,
    active_sessions: Gauge,
    docs_cloned: Counter,
    mods_forwarded: Counter,
    catchup_rounds: Counter,
    commit_duration: Histogram,
    critical_section_duration: Histogram,
    recipient_aborts: Counter,
    docs_received: Counter,
}

/// Plain-data copy of [`MigrationMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationMetricsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub active_sessions: i64,
    pub docs_cloned: u64,
    pub mods_forwarded: u64,
    pub catchup_rounds: u64,
    pub commit_duration: HistogramSnapshot,
    pub critical_section_duration: HistogramSnapshot,
    pub recipient_aborts: u64,
    pub docs_received: u64,
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationMetrics {
    pub fn new() -> Self {
        Self {
            started: Counter::new("rangeshift_migrations_started_total", "Migrations started as donor"),
            committed: Counter::new(
                "rangeshift_migrations_committed_total",
                "Migrations committed as donor",
            ),
            aborted: CodeCounter::new(
                "rangeshift_migrations_aborted_total",
                "Migrations aborted as donor, by error code",
            ),
            active_sessions: Gauge::new(
                "rangeshift_migration_sessions_active",
                "Donor sessions currently running",
            ),
            docs_cloned: Counter::new(
                "rangeshift_migration_docs_cloned_total",
                "Documents served to recipients",
            ),
            mods_forwarded: Counter::new(
                "rangeshift_migration_mods_forwarded_total",
                "Modifications forwarded to recipients",
            ),
            catchup_rounds: Counter::new(
                "rangeshift_migration_catchup_rounds_total",
                "Catch-up flush rounds",
            ),
            commit_duration: Histogram::new(
                "rangeshift_migration_commit_seconds",
                "Time from critical section entry to metadata commit",
                PHASE_BUCKETS,
            ),
            critical_section_duration: Histogram::new(
                "rangeshift_migration_critical_section_seconds",
                "Time writes to the range were held back",
                PHASE_BUCKETS,
            ),
            recipient_aborts: Counter::new(
                "rangeshift_recipient_aborts_total",
                "Sessions discarded as recipient",
            ),
            docs_received: Counter::new(
                "rangeshift_recipient_docs_received_total",
                "Documents cloned in as recipient",
            ),
        }
    }

    pub fn record_started(&self) {
        self.started.inc();
        self.active_sessions.inc();
    }

    pub fn record_committed(&self, commit: Duration, critical_section: Duration) {
        self.committed.inc();
        self.active_sessions.dec();
        self.commit_duration.observe(commit);
        self.critical_section_duration.observe(critical_section);
    }

    pub fn record_aborted(&self, code: &'static str) {
        self.aborted.inc(code);
        self.active_sessions.dec();
    }

    pub fn record_cloned(&self, docs: usize) {
        self.docs_cloned.inc_by(docs as u64);
    }

    pub fn record_forwarded(&self, mods: usize) {
        self.mods_forwarded.inc_by(mods as u64);
    }

    pub fn record_catchup_round(&self) {
        self.catchup_rounds.inc();
    }

    pub fn record_recipient_abort(&self) {
        self.recipient_aborts.inc();
    }

    pub fn record_received(&self, docs: usize) {
        self.docs_received.inc_by(docs as u64);
    }

    /// Aborts with a given error code.
    pub fn aborted_with(&self, code: &str) -> u64 {
        self.aborted.get(code)
    }

    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            started: self.started.get(),
            committed: self.committed.get(),
            aborted: self.aborted.total(),
            active_sessions: self.active_sessions.get(),
            docs_cloned: self.docs_cloned.get(),
            mods_forwarded: self.mods_forwarded.get(),
            catchup_rounds: self.catchup_rounds.get(),
            commit_duration: self.commit_duration.snapshot(),
            critical_section_duration: self.critical_section_duration.snapshot(),
            recipient_aborts: self.recipient_aborts.get(),
            docs_received: self.docs_received.get(),
        }
    }

    /// Prometheus exposition text.
    pub fn render(&self) -> String {
        render_all(&[
            &self.started,
            &self.committed,
            &self.aborted,
            &self.active_sessions,
            &self.docs_cloned,
            &self.mods_forwarded,
            &self.catchup_rounds,
            &self.commit_duration,
            &self.critical_section_duration,
            &self.recipient_aborts,
            &self.docs_received,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters() {
        let metrics = MigrationMetrics::new();
        metrics.record_started();
        metrics.record_started();
        metrics.record_committed(Duration::from_millis(20), Duration::from_millis(5));
        metrics.record_aborted("RecipientUnavailable");

        let snap = metrics.snapshot();
        assert_eq!(snap.started, 2);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.aborted, 1);
        assert_eq!(snap.active_sessions, 0);
        assert_eq!(snap.commit_duration.count, 1);
        assert_eq!(metrics.aborted_with("RecipientUnavailable"), 1);
    }

    #[test]
    fn test_render_contains_all_series() {
        let metrics = MigrationMetrics::new();
        metrics.record_forwarded(3);
        let text = metrics.render();
        assert!(text.contains("rangeshift_migration_mods_forwarded_total 3"));
        assert!(text.contains("# TYPE rangeshift_migration_commit_seconds histogram"));
    }
}
