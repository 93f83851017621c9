//! Metrics and observability for mysql-migrate.
//!
//! Counters are kept in process as atomics for the end-of-run summary and
//! mirrored to the [`metrics`] facade, so an installed recorder (Prometheus,
//! StatsD, ...) sees them too. Without a recorder the facade calls are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::apply::ApplyOutcome;

/// Metrics collector for a migration run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Objects created at the destination
    pub objects_created: AtomicU64,
    /// Objects that already existed
    pub objects_skipped: AtomicU64,
    /// Objects whose DDL could not be extracted or applied
    pub objects_failed: AtomicU64,
    /// Batches acknowledged by the destination
    pub batches_written: AtomicU64,
    /// Batches that failed
    pub batches_failed: AtomicU64,
    /// Rows read from the source
    pub rows_read: AtomicU64,
    /// Rows written to the destination
    pub rows_written: AtomicU64,
    /// Rows in failed batches
    pub rows_failed: AtomicU64,
    /// Connection attempts that were retried
    pub connect_retries: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of applying one object's DDL.
    pub fn record_apply(&self, outcome: &ApplyOutcome) {
        let (counter, status) = match outcome {
            ApplyOutcome::Created => (&self.objects_created, "created"),
            ApplyOutcome::SkippedExists => (&self.objects_skipped, "skipped_exists"),
            ApplyOutcome::Failed { .. } => (&self.objects_failed, "failed"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mysql_migrate_objects_total", "status" => status).increment(1);
    }

    /// Record an object whose DDL could not be extracted.
    pub fn record_extraction_failure(&self) {
        self.objects_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mysql_migrate_objects_total", "status" => "failed").increment(1);
    }

    /// Record one batch.
    pub fn record_batch(&self, success: bool, rows: u64) {
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
        metrics::counter!("mysql_migrate_rows_read_total").increment(rows);
        if success {
            self.batches_written.fetch_add(1, Ordering::Relaxed);
            self.rows_written.fetch_add(rows, Ordering::Relaxed);
            metrics::counter!("mysql_migrate_batches_total", "status" => "written").increment(1);
            metrics::counter!("mysql_migrate_rows_written_total").increment(rows);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
            self.rows_failed.fetch_add(rows, Ordering::Relaxed);
            metrics::counter!("mysql_migrate_batches_total", "status" => "failed").increment(1);
            metrics::counter!("mysql_migrate_rows_failed_total").increment(rows);
        }
    }

    /// Record a connection retry.
    pub fn record_retry(&self) {
        self.connect_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mysql_migrate_connect_retries_total").increment(1);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            objects_created: self.objects_created.load(Ordering::Relaxed),
            objects_skipped: self.objects_skipped.load(Ordering::Relaxed),
            objects_failed: self.objects_failed.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            connect_retries: self.connect_retries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    /// Objects created at the destination
    pub objects_created: u64,
    /// Objects that already existed
    pub objects_skipped: u64,
    /// Objects that failed
    pub objects_failed: u64,
    /// Batches acknowledged
    pub batches_written: u64,
    /// Batches that failed
    pub batches_failed: u64,
    /// Rows read
    pub rows_read: u64,
    /// Rows written
    pub rows_written: u64,
    /// Rows failed
    pub rows_failed: u64,
    /// Connection retries
    pub connect_retries: u64,
}

impl MetricsSnapshot {
    /// Fraction of batches that were written.
    pub fn batch_success_rate(&self) -> f64 {
        let total = self.batches_written + self.batches_failed;
        if total == 0 {
            0.0
        } else {
            self.batches_written as f64 / total as f64
        }
    }

    /// Rows written per second over `duration_ms`.
    pub fn rows_per_second(&self, duration_ms: u64) -> f64 {
        if duration_ms == 0 {
            0.0
        } else {
            (self.rows_written as f64 * 1000.0) / duration_ms as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClass;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_apply(&ApplyOutcome::Created);
        metrics.record_apply(&ApplyOutcome::SkippedExists);
        metrics.record_apply(&ApplyOutcome::Failed {
            class: ErrorClass::MissingObject,
            cause: "no table".into(),
        });
        metrics.record_extraction_failure();
        metrics.record_batch(true, 1000);
        metrics.record_batch(false, 500);
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.objects_created, 1);
        assert_eq!(snapshot.objects_skipped, 1);
        assert_eq!(snapshot.objects_failed, 2);
        assert_eq!(snapshot.batches_written, 1);
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.rows_read, 1500);
        assert_eq!(snapshot.rows_written, 1000);
        assert_eq!(snapshot.rows_failed, 500);
        assert_eq!(snapshot.connect_retries, 1);
    }

    #[test]
    fn test_metrics_calculations() {
        let snapshot = MetricsSnapshot {
            batches_written: 8,
            batches_failed: 2,
            rows_written: 1000,
            ..Default::default()
        };

        assert!((snapshot.batch_success_rate() - 0.8).abs() < 0.001);
        assert!((snapshot.rows_per_second(5000) - 200.0).abs() < 0.001);
        assert_eq!(MetricsSnapshot::default().batch_success_rate(), 0.0);
        assert_eq!(snapshot.rows_per_second(0), 0.0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("op");
        assert!(timer.stop() < 60_000);
    }
}
