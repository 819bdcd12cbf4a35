//! Datastore operation metrics.
//!
//! Counters are kept in process-local atomics so they are always available
//! via [`StoreMetrics::snapshot`]; when the datastore is configured with
//! `enable_prometheus_stats`, the same observations are also emitted through
//! the `metrics` facade for whatever exporter the embedding process installs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Datastore operation metrics.
#[derive(Debug)]
pub struct StoreMetrics {
    export: bool,

    query_count: AtomicU64,
    query_latency_us: AtomicU64,
    query_errors: AtomicU64,

    transaction_count: AtomicU64,
    transaction_latency_us: AtomicU64,
    transaction_errors: AtomicU64,
    transaction_retries: AtomicU64,

    bulk_loaded_rows: AtomicU64,

    gc_passes: AtomicU64,
    gc_failures: AtomicU64,
    gc_reclaimed_relationships: AtomicU64,
    gc_reclaimed_transactions: AtomicU64,

    watch_events: AtomicU64,
}

impl StoreMetrics {
    /// `export` mirrors the datastore's `enable_prometheus_stats` option.
    pub fn new(export: bool) -> Self {
        Self {
            export,
            query_count: AtomicU64::new(0),
            query_latency_us: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            transaction_count: AtomicU64::new(0),
            transaction_latency_us: AtomicU64::new(0),
            transaction_errors: AtomicU64::new(0),
            transaction_retries: AtomicU64::new(0),
            bulk_loaded_rows: AtomicU64::new(0),
            gc_passes: AtomicU64::new(0),
            gc_failures: AtomicU64::new(0),
            gc_reclaimed_relationships: AtomicU64::new(0),
            gc_reclaimed_transactions: AtomicU64::new(0),
            watch_events: AtomicU64::new(0),
        }
    }

    /// Record a read query.
    pub fn record_query(&self, duration: Duration, error: bool) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.query_latency_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if error {
            self.query_errors.fetch_add(1, Ordering::Relaxed);
        }
        if self.export {
            counter!("stratum_store_queries_total").increment(1);
            histogram!("stratum_store_query_duration_seconds").record(duration.as_secs_f64());
            if error {
                counter!("stratum_store_query_errors_total").increment(1);
            }
        }
    }

    /// Record a completed (or failed) read-write transaction.
    pub fn record_transaction(&self, duration: Duration, retries: u64, error: bool) {
        self.transaction_count.fetch_add(1, Ordering::Relaxed);
        self.transaction_latency_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.transaction_retries.fetch_add(retries, Ordering::Relaxed);
        if error {
            self.transaction_errors.fetch_add(1, Ordering::Relaxed);
        }
        if self.export {
            counter!("stratum_store_transactions_total").increment(1);
            counter!("stratum_store_transaction_retries_total").increment(retries);
            histogram!("stratum_store_transaction_duration_seconds")
                .record(duration.as_secs_f64());
            if error {
                counter!("stratum_store_transaction_errors_total").increment(1);
            }
        }
    }

    pub fn record_bulk_loaded(&self, rows: u64) {
        self.bulk_loaded_rows.fetch_add(rows, Ordering::Relaxed);
        if self.export {
            counter!("stratum_store_bulk_loaded_rows_total").increment(rows);
        }
    }

    /// Record a garbage collection pass.
    pub fn record_gc_pass(&self, relationships: u64, transactions: u64, failed: bool) {
        self.gc_passes.fetch_add(1, Ordering::Relaxed);
        self.gc_reclaimed_relationships.fetch_add(relationships, Ordering::Relaxed);
        self.gc_reclaimed_transactions.fetch_add(transactions, Ordering::Relaxed);
        if failed {
            self.gc_failures.fetch_add(1, Ordering::Relaxed);
        }
        if self.export {
            counter!("stratum_store_gc_passes_total").increment(1);
            counter!("stratum_store_gc_reclaimed_relationships_total").increment(relationships);
            counter!("stratum_store_gc_reclaimed_transactions_total").increment(transactions);
            if failed {
                counter!("stratum_store_gc_failures_total").increment(1);
            }
        }
    }

    pub fn record_watch_event(&self) {
        self.watch_events.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("stratum_store_watch_events_total").increment(1);
        }
    }

    /// Get a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let query_count = self.query_count.load(Ordering::Relaxed);
        let transaction_count = self.transaction_count.load(Ordering::Relaxed);
        let query_latency_us = self.query_latency_us.load(Ordering::Relaxed);
        let transaction_latency_us = self.transaction_latency_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            query_count,
            query_avg_latency_us: if query_count > 0 { query_latency_us / query_count } else { 0 },
            query_errors: self.query_errors.load(Ordering::Relaxed),
            transaction_count,
            transaction_avg_latency_us: if transaction_count > 0 {
                transaction_latency_us / transaction_count
            } else {
                0
            },
            transaction_errors: self.transaction_errors.load(Ordering::Relaxed),
            transaction_retries: self.transaction_retries.load(Ordering::Relaxed),
            bulk_loaded_rows: self.bulk_loaded_rows.load(Ordering::Relaxed),
            gc_passes: self.gc_passes.load(Ordering::Relaxed),
            gc_failures: self.gc_failures.load(Ordering::Relaxed),
            gc_reclaimed_relationships: self.gc_reclaimed_relationships.load(Ordering::Relaxed),
            gc_reclaimed_transactions: self.gc_reclaimed_transactions.load(Ordering::Relaxed),
            watch_events: self.watch_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub query_count: u64,
    pub query_avg_latency_us: u64,
    pub query_errors: u64,
    pub transaction_count: u64,
    pub transaction_avg_latency_us: u64,
    pub transaction_errors: u64,
    pub transaction_retries: u64,
    pub bulk_loaded_rows: u64,
    pub gc_passes: u64,
    pub gc_failures: u64,
    pub gc_reclaimed_relationships: u64,
    pub gc_reclaimed_transactions: u64,
    pub watch_events: u64,
}

/// Helper to measure operation duration.
pub struct OpTimer {
    start: Instant,
}

impl OpTimer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for OpTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = StoreMetrics::new(false);

        metrics.record_query(Duration::from_micros(100), false);
        metrics.record_query(Duration::from_micros(300), true);
        metrics.record_transaction(Duration::from_micros(500), 2, false);
        metrics.record_gc_pass(10, 4, false);
        metrics.record_bulk_loaded(1000);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.query_count, 2);
        assert_eq!(snapshot.query_avg_latency_us, 200);
        assert_eq!(snapshot.query_errors, 1);
        assert_eq!(snapshot.transaction_count, 1);
        assert_eq!(snapshot.transaction_retries, 2);
        assert_eq!(snapshot.gc_reclaimed_relationships, 10);
        assert_eq!(snapshot.gc_reclaimed_transactions, 4);
        assert_eq!(snapshot.bulk_loaded_rows, 1000);
    }

    #[test]
    fn test_op_timer() {
        let timer = OpTimer::new();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed().as_millis() >= 5);
    }
}
