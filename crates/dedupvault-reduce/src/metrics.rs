//! Prometheus-compatible counters for the backup pipeline.
//!
//! Counters are plain atomics so the dedup ratio can be read from any thread
//! while hashers and the index consumer keep running.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The type of metric: counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up or down.
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

/// Thread-safe counters shared between the index consumer, the dispatcher
/// and readers.
#[derive(Debug, Default)]
pub struct DedupMetrics {
    total_bytes_seen: AtomicU64,
    unique_bytes_stored: AtomicU64,
    blocks_seen: AtomicU64,
    blocks_unique: AtomicU64,
    store_failures: AtomicU64,
    files_processed: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    metadata_failures: AtomicU64,
}

impl DedupMetrics {
    /// Create a new DedupMetrics with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block seen for the first time.
    ///
    /// Adds to `total_bytes_seen` before `unique_bytes_stored`.
    #[inline]
    pub fn record_new_block(&self, len: u64) {
        self.total_bytes_seen.fetch_add(len, Ordering::SeqCst);
        self.unique_bytes_stored.fetch_add(len, Ordering::SeqCst);
        self.blocks_seen.fetch_add(1, Ordering::Relaxed);
        self.blocks_unique.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block whose digest was already indexed.
    #[inline]
    pub fn record_duplicate_block(&self, len: u64) {
        self.total_bytes_seen.fetch_add(len, Ordering::SeqCst);
        self.blocks_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed block write.
    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file whose metadata was appended and cached.
    #[inline]
    pub fn record_file_processed(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file skipped by the change cache.
    #[inline]
    pub fn record_file_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file abandoned because of an error.
    #[inline]
    pub fn record_file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed metadata log append.
    #[inline]
    pub fn record_metadata_failure(&self) {
        self.metadata_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes of every block observed, duplicates included.
    pub fn total_bytes_seen(&self) -> u64 {
        self.total_bytes_seen.load(Ordering::SeqCst)
    }

    /// Bytes of blocks classified as new.
    pub fn unique_bytes_stored(&self) -> u64 {
        self.unique_bytes_stored.load(Ordering::SeqCst)
    }

    /// Unique bytes stored divided by total bytes seen.
    ///
    /// Returns 1.0 if nothing has been seen yet.
    pub fn dedup_ratio(&self) -> f64 {
        self.snapshot().dedup_ratio
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        // total first: writers add to total before unique
        let total_bytes_seen = self.total_bytes_seen.load(Ordering::SeqCst);
        let unique_bytes_stored = self
            .unique_bytes_stored
            .load(Ordering::SeqCst)
            .min(total_bytes_seen);
        MetricsSnapshot {
            total_bytes_seen,
            unique_bytes_stored,
            blocks_seen: self.blocks_seen.load(Ordering::Relaxed),
            blocks_unique: self.blocks_unique.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            metadata_failures: self.metadata_failures.load(Ordering::Relaxed),
            dedup_ratio: ratio(unique_bytes_stored, total_bytes_seen),
        }
    }

    /// Collect all metrics for a Prometheus text exporter.
    pub fn collect(&self) -> Vec<BackupMetric> {
        let s = self.snapshot();
        let counter = |name: &str, help: &str, v: u64| BackupMetric {
            name: format!("dedupvault_{}", name),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(v),
        };
        vec![
            counter("bytes_seen_total", "Total block bytes observed by the dedup index", s.total_bytes_seen),
            counter("unique_bytes_total", "Block bytes classified as new", s.unique_bytes_stored),
            counter("blocks_seen_total", "Blocks observed by the dedup index", s.blocks_seen),
            counter("blocks_unique_total", "Blocks classified as new", s.blocks_unique),
            counter("store_failures_total", "Failed block writes", s.store_failures),
            counter("files_processed_total", "Files fully indexed", s.files_processed),
            counter("files_skipped_total", "Files skipped by the change cache", s.files_skipped),
            counter("files_failed_total", "Files abandoned after an error", s.files_failed),
            counter("metadata_failures_total", "Failed metadata log appends", s.metadata_failures),
            BackupMetric {
                name: "dedupvault_dedup_ratio".to_string(),
                help: "Unique bytes stored divided by total bytes seen".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(s.dedup_ratio),
            },
        ]
    }

    /// Render [`DedupMetrics::collect`] in the Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for m in self.collect() {
            let (kind, value) = match m.value {
                MetricValue::Counter(v) => ("counter", v.to_string()),
                MetricValue::Gauge(v) => ("gauge", format!("{}", v)),
            };
            out.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n{} {}\n", m.name, m.help, m.name, kind, m.name, value));
        }
        out
    }
}

fn ratio(unique: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        unique as f64 / total as f64
    }
}

/// A point-in-time snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total block bytes observed.
    pub total_bytes_seen: u64,
    /// Bytes of new blocks.
    pub unique_bytes_stored: u64,
    /// Blocks observed.
    pub blocks_seen: u64,
    /// New blocks.
    pub blocks_unique: u64,
    /// Failed block writes.
    pub store_failures: u64,
    /// Files fully indexed.
    pub files_processed: u64,
    /// Files skipped by the change cache.
    pub files_skipped: u64,
    /// Files abandoned after an error.
    pub files_failed: u64,
    /// Failed metadata appends.
    pub metadata_failures: u64,
    /// Unique bytes divided by total bytes.
    pub dedup_ratio: f64,
}
