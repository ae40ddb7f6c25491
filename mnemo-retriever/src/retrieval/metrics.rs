//! Injected metrics for the indexing orchestrator.
//!
//! The orchestrator reports per-indexer counters through a sink owned by the
//! caller instead of mutating process-wide state, so embedders can be swapped
//! and tests can assert on exactly what happened.

use std::collections::HashMap;
use std::sync::Mutex;

/// Receives per-indexer indexing counters. Implementations must be cheap;
/// they are called from the hot indexing path.
pub trait MetricsSink: Send + Sync {
    /// Items successfully embedded and upserted.
    fn items_processed(&self, indexer: &str, count: usize);

    /// Items that failed embedding or upserting.
    fn items_failed(&self, indexer: &str, count: usize);

    /// The indexer entered rate-limit backoff.
    fn backoff(&self, indexer: &str);
}

/// Discards everything; the default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn items_processed(&self, _indexer: &str, _count: usize) {}
    fn items_failed(&self, _indexer: &str, _count: usize) {}
    fn backoff(&self, _indexer: &str) {}
}

/// Per-indexer counter totals captured by [`RecordingMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexerCounters {
    pub processed: usize,
    pub failed: usize,
    pub backoffs: usize,
}

/// Accumulates counters in memory, for tests and the CLI status output.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<String, IndexerCounters>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter totals for one indexer (zeroes if it never reported).
    pub fn snapshot(&self, indexer: &str) -> IndexerCounters {
        self.counters
            .lock()
            .expect("metrics mutex poisoned")
            .get(indexer)
            .copied()
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingMetrics {
    fn items_processed(&self, indexer: &str, count: usize) {
        let mut counters = self.counters.lock().expect("metrics mutex poisoned");
        counters.entry(indexer.to_string()).or_default().processed += count;
    }

    fn items_failed(&self, indexer: &str, count: usize) {
        let mut counters = self.counters.lock().expect("metrics mutex poisoned");
        counters.entry(indexer.to_string()).or_default().failed += count;
    }

    fn backoff(&self, indexer: &str) {
        let mut counters = self.counters.lock().expect("metrics mutex poisoned");
        counters.entry(indexer.to_string()).or_default().backoffs += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_metrics_accumulates_per_indexer() {
        let metrics = RecordingMetrics::new();
        metrics.items_processed("messages", 5);
        metrics.items_processed("messages", 3);
        metrics.items_failed("messages", 1);
        metrics.backoff("windows");

        assert_eq!(
            metrics.snapshot("messages"),
            IndexerCounters {
                processed: 8,
                failed: 1,
                backoffs: 0
            }
        );
        assert_eq!(metrics.snapshot("windows").backoffs, 1);
        assert_eq!(metrics.snapshot("unknown"), IndexerCounters::default());
    }
}
