//! Metrics primitives for monitoring migrations and cleanup.
//!
//! Prometheus-style counters, gauges and histograms backed by atomics.
//! Each component owns a metrics struct built from these and exposes a
//! plain-data `snapshot()` plus a text rendering in the Prometheus
//! exposition format.
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │     MigrationMetrics     │   │      CleanupMetrics      │
//! │ started / committed      │   │ scanned / deleted        │
//! │ aborted{code}            │   │ batches                  │
//! │ active sessions (gauge)  │   │ range deletions          │
//! │ commit duration (hist)   │   │ pass duration (hist)     │
//! └──────────────────────────┘   └──────────────────────────┘
//! ```

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Buckets (seconds) for migration phase durations.
pub const PHASE_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Something that can append itself in the exposition format.
pub trait Render {
    /// Append this metric to `out`.
    fn render(&self, out: &mut String);
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Render for Counter {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// A counter split by error code.
#[derive(Debug)]
pub struct CodeCounter {
    name: &'static str,
    help: &'static str,
    values: RwLock<BTreeMap<&'static str, u64>>,
}

impl CodeCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Increment the series for `code`.
    pub fn inc(&self, code: &'static str) {
        *self.values.write().entry(code).or_insert(0) += 1;
    }

    /// Value of the series for `code`.
    pub fn get(&self, code: &str) -> u64 {
        self.values.read().get(code).copied().unwrap_or(0)
    }

    /// Sum over all codes.
    pub fn total(&self) -> u64 {
        self.values.read().values().sum()
    }
}

impl Render for CodeCounter {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "counter");
        for (code, value) in self.values.read().iter() {
            let _ = writeln!(out, "{}{{code=\"{}\"}} {}", self.name, code, value);
        }
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set the value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Render for Gauge {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Sum of observations in seconds.
    pub sum: f64,
    /// Cumulative `(upper bound, count)` pairs.
    pub buckets: Vec<(f64, u64)>,
}

impl HistogramSnapshot {
    /// Mean observation, zero when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Distribution of durations.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: &'static [f64],
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with sorted bucket upper bounds in seconds.
    pub fn new(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            help,
            bounds,
            counts: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one duration.
    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            if secs <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            buckets: self
                .bounds
                .iter()
                .zip(&self.counts)
                .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl Render for Histogram {
    fn render(&self, out: &mut String) {
        let snap = self.snapshot();
        header(out, self.name, self.help, "histogram");
        for (bound, count) in &snap.buckets {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, count);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, snap.count);
        let _ = writeln!(out, "{}_sum {}", self.name, snap.sum);
        let _ = writeln!(out, "{}_count {}", self.name, snap.count);
    }
}

/// Render several metrics into one exposition document.
pub fn render_all(metrics: &[&dyn Render]) -> String {
    let mut out = String::new();
    for metric in metrics {
        metric.render(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new("moves_total", "Moves");
        counter.inc();
        counter.inc_by(2);
        assert_eq!(counter.get(), 3);

        let gauge = Gauge::new("active", "Active");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_code_counter() {
        let aborts = CodeCounter::new("aborts_total", "Aborts");
        aborts.inc("RecipientUnavailable");
        aborts.inc("RecipientUnavailable");
        aborts.inc("Aborted");
        assert_eq!(aborts.get("RecipientUnavailable"), 2);
        assert_eq!(aborts.total(), 3);

        let text = render_all(&[&aborts]);
        assert!(text.contains("aborts_total{code=\"Aborted\"} 1"));
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new("commit_seconds", "Commit", PHASE_BUCKETS);
        hist.observe(Duration::from_millis(3));
        hist.observe(Duration::from_millis(200));

        let snap = hist.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.buckets[0], (0.005, 1));
        assert_eq!(snap.buckets[4], (0.25, 2));
        assert!((snap.mean() - 0.1015).abs() < 1e-6);

        let text = render_all(&[&hist]);
        assert!(text.contains("commit_seconds_count 2"));
    }
}
