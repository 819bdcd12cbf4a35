//! Metric family descriptions for the datastore.
//!
//! Registration with the `metrics` facade is side-effecting, so it is
//! guarded to run at most once per process no matter how many datastores
//! the process opens.

use std::sync::Once;

use metrics::{describe_counter, describe_histogram};

static DESCRIBE_ONCE: Once = Once::new();

/// Describes every metric family the datastore emits. Idempotent.
pub fn describe_metrics() {
    DESCRIBE_ONCE.call_once(|| {
        describe_counter!(
            "stratum_store_queries_total",
            "Total number of read queries executed"
        );
        describe_histogram!(
            "stratum_store_query_duration_seconds",
            "Duration of read queries in seconds"
        );
        describe_counter!(
            "stratum_store_query_errors_total",
            "Total number of read queries that failed"
        );

        describe_counter!(
            "stratum_store_transactions_total",
            "Total number of read-write transactions attempted"
        );
        describe_counter!(
            "stratum_store_transaction_retries_total",
            "Total number of serialization-conflict retries"
        );
        describe_histogram!(
            "stratum_store_transaction_duration_seconds",
            "Duration of read-write transactions in seconds, retries included"
        );
        describe_counter!(
            "stratum_store_transaction_errors_total",
            "Total number of read-write transactions that failed"
        );

        describe_counter!(
            "stratum_store_bulk_loaded_rows_total",
            "Total number of relationships appended through the bulk loader"
        );

        describe_counter!(
            "stratum_store_gc_passes_total",
            "Total number of garbage collection passes"
        );
        describe_counter!(
            "stratum_store_gc_failures_total",
            "Total number of garbage collection passes that failed"
        );
        describe_counter!(
            "stratum_store_gc_reclaimed_relationships_total",
            "Total number of expired relationship rows reclaimed"
        );
        describe_counter!(
            "stratum_store_gc_reclaimed_transactions_total",
            "Total number of expired transaction rows reclaimed"
        );

        describe_counter!(
            "stratum_store_watch_events_total",
            "Total number of change events emitted to watchers"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_is_idempotent() {
        // Calling twice must not panic or double-register.
        describe_metrics();
        describe_metrics();
    }
}
