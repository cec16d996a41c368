//! Bucket index updater metrics
//!
//! Counters are plain atomics behind an `Arc`, so one instance can be handed
//! to every updater and cloned freely.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Thread-safe metrics for bucket index updates
#[derive(Debug, Clone, Default)]
pub struct UpdaterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    updates_started: AtomicUsize,
    updates_succeeded: AtomicUsize,
    updates_failed: AtomicUsize,
    updates_cancelled: AtomicUsize,
    blocks_reused: AtomicUsize,
    blocks_fetched: AtomicUsize,
    partial_blocks: AtomicUsize,
    deletion_marks_indexed: AtomicUsize,
    deletion_marks_dropped: AtomicUsize,
    total_duration_ms: AtomicU64,
}

impl UpdaterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update_start(&self) {
        self.inner.updates_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed pass and what it did.
    pub fn record_update_success(
        &self,
        blocks_reused: usize,
        blocks_fetched: usize,
        partial_blocks: usize,
        duration: Duration,
    ) {
        self.inner.updates_succeeded.fetch_add(1, Ordering::Relaxed);
        self.inner
            .blocks_reused
            .fetch_add(blocks_reused, Ordering::Relaxed);
        self.inner
            .blocks_fetched
            .fetch_add(blocks_fetched, Ordering::Relaxed);
        self.inner
            .partial_blocks
            .fetch_add(partial_blocks, Ordering::Relaxed);
        self.inner
            .total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_update_failure(&self) {
        self.inner.updates_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_cancelled(&self) {
        self.inner.updates_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletion_marks(&self, indexed: usize, dropped: usize) {
        self.inner
            .deletion_marks_indexed
            .fetch_add(indexed, Ordering::Relaxed);
        self.inner
            .deletion_marks_dropped
            .fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn updates_started(&self) -> usize {
        self.inner.updates_started.load(Ordering::Relaxed)
    }

    pub fn updates_succeeded(&self) -> usize {
        self.inner.updates_succeeded.load(Ordering::Relaxed)
    }

    pub fn updates_failed(&self) -> usize {
        self.inner.updates_failed.load(Ordering::Relaxed)
    }

    pub fn updates_cancelled(&self) -> usize {
        self.inner.updates_cancelled.load(Ordering::Relaxed)
    }

    /// Blocks copied from the previous index without a fetch
    pub fn blocks_reused(&self) -> usize {
        self.inner.blocks_reused.load(Ordering::Relaxed)
    }

    /// Blocks whose meta.json was fetched and indexed
    pub fn blocks_fetched(&self) -> usize {
        self.inner.blocks_fetched.load(Ordering::Relaxed)
    }

    pub fn partial_blocks(&self) -> usize {
        self.inner.partial_blocks.load(Ordering::Relaxed)
    }

    pub fn deletion_marks_indexed(&self) -> usize {
        self.inner.deletion_marks_indexed.load(Ordering::Relaxed)
    }

    pub fn deletion_marks_dropped(&self) -> usize {
        self.inner.deletion_marks_dropped.load(Ordering::Relaxed)
    }

    /// Calculate the average duration of a successful pass
    pub fn avg_duration_ms(&self) -> f64 {
        let total_ms = self.inner.total_duration_ms.load(Ordering::Relaxed) as f64;
        let updates = self.updates_succeeded() as f64;

        if updates > 0.0 { total_ms / updates } else { 0.0 }
    }

    /// Get a summary of all metrics
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            updates_started: self.updates_started(),
            updates_succeeded: self.updates_succeeded(),
            updates_failed: self.updates_failed(),
            updates_cancelled: self.updates_cancelled(),
            blocks_reused: self.blocks_reused(),
            blocks_fetched: self.blocks_fetched(),
            partial_blocks: self.partial_blocks(),
            deletion_marks_indexed: self.deletion_marks_indexed(),
            deletion_marks_dropped: self.deletion_marks_dropped(),
            avg_duration_ms: self.avg_duration_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub updates_started: usize,
    pub updates_succeeded: usize,
    pub updates_failed: usize,
    pub updates_cancelled: usize,
    pub blocks_reused: usize,
    pub blocks_fetched: usize,
    pub partial_blocks: usize,
    pub deletion_marks_indexed: usize,
    pub deletion_marks_dropped: usize,
    pub avg_duration_ms: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            started = self.updates_started,
            succeeded = self.updates_succeeded,
            failed = self.updates_failed,
            cancelled = self.updates_cancelled,
            "Bucket index updates"
        );
        info!(
            reused = self.blocks_reused,
            fetched = self.blocks_fetched,
            partial = self.partial_blocks,
            "Bucket index blocks"
        );
        info!(
            indexed = self.deletion_marks_indexed,
            dropped = self.deletion_marks_dropped,
            "Bucket index deletion marks"
        );
        info!("Average update duration: {:.2}ms", self.avg_duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = UpdaterMetrics::new();

        assert_eq!(metrics.updates_started(), 0);
        assert_eq!(metrics.updates_succeeded(), 0);
        assert_eq!(metrics.blocks_fetched(), 0);
        assert_eq!(metrics.avg_duration_ms(), 0.0);
    }

    #[test]
    fn test_record_update_success() {
        let metrics = UpdaterMetrics::new();

        metrics.record_update_start();
        metrics.record_update_success(10, 2, 1, Duration::from_millis(40));
        metrics.record_update_start();
        metrics.record_update_success(12, 0, 0, Duration::from_millis(20));

        assert_eq!(metrics.updates_started(), 2);
        assert_eq!(metrics.updates_succeeded(), 2);
        assert_eq!(metrics.blocks_reused(), 22);
        assert_eq!(metrics.blocks_fetched(), 2);
        assert_eq!(metrics.partial_blocks(), 1);
        assert_eq!(metrics.avg_duration_ms(), 30.0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = UpdaterMetrics::new();
        let clone = metrics.clone();

        clone.record_update_failure();
        clone.record_update_cancelled();
        clone.record_deletion_marks(3, 1);

        let summary = metrics.summary();
        assert_eq!(summary.updates_failed, 1);
        assert_eq!(summary.updates_cancelled, 1);
        assert_eq!(summary.deletion_marks_indexed, 3);
        assert_eq!(summary.deletion_marks_dropped, 1);
    }
}
