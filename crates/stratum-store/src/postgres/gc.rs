//! Garbage collection of expired rows.
//!
//! Each pass resolves `now - gc_window` (by the database clock) to a
//! transaction horizon and physically deletes, in small independent batches:
//! relationships whose deletion precedes the horizon, transactions older
//! than the window, and soft-deleted namespace/caveat definitions. Rows
//! visible to any revision at or after the horizon are never touched, and
//! the batches avoid holding long locks against foreground writers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::QueryBuilder;
use tokio_util::sync::CancellationToken;

use stratum_types::{StoreError, StoreResult};

use crate::metrics::StoreMetrics;

use super::errors;
use super::pool::{ConnPool, PooledConn};
use super::revision::PgSnapshot;
use super::tables::*;

/// Rows deleted per batch. Small enough to keep row-lock footprints short.
const GC_BATCH_SIZE: i64 = 1_000;

/// What one garbage collection pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub relationships: u64,
    pub transactions: u64,
    pub namespaces: u64,
    pub caveats: u64,
}

impl GcReport {
    fn total(&self) -> u64 {
        self.relationships + self.transactions + self.namespaces + self.caveats
    }
}

/// The long-lived garbage collection task. Failed passes are logged and
/// retried at the next interval; the task only exits on cancellation.
pub(crate) async fn run_task(
    pool: ConnPool,
    tables: Arc<Tables>,
    metrics: Arc<StoreMetrics>,
    window: Duration,
    interval: Duration,
    max_operation_time: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so a
    // freshly started datastore does not collect during startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match collect_once(&pool, &tables, window, max_operation_time).await {
            Ok(report) => {
                metrics.record_gc_pass(report.relationships, report.transactions, false);
                if report.total() > 0 {
                    tracing::info!(
                        relationships = report.relationships,
                        transactions = report.transactions,
                        namespaces = report.namespaces,
                        caveats = report.caveats,
                        "garbage collection pass completed"
                    );
                }
            }
            Err(err) => {
                metrics.record_gc_pass(0, 0, true);
                tracing::warn!(error = %err, "garbage collection pass failed; will retry");
            }
        }
    }
}

/// Runs one bounded garbage collection pass.
pub(crate) async fn collect_once(
    pool: &ConnPool,
    tables: &Tables,
    window: Duration,
    max_operation_time: Duration,
) -> StoreResult<GcReport> {
    tokio::time::timeout(max_operation_time, collect_inner(pool, tables, window))
        .await
        .map_err(|_| StoreError::DeadlineExceeded)?
}

async fn collect_inner(
    pool: &ConnPool,
    tables: &Tables,
    window: Duration,
) -> StoreResult<GcReport> {
    let mut conn = pool.acquire().await?;

    // Use the database clock so GC is immune to process clock skew.
    let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
        .fetch_one(&mut *conn)
        .await
        .map_err(errors::wrap)?;
    let horizon_ts = now
        - chrono::Duration::from_std(window).map_err(|err| {
            StoreError::InvalidArgument { message: format!("gc window out of range: {err}") }
        })?;

    // The newest transaction older than the window. Its snapshot's xmin is a
    // safe horizon: every transaction below it was resolved before any
    // still-serviceable revision.
    let horizon_sql = format!(
        "SELECT {COL_SNAPSHOT}::text FROM {} WHERE {COL_TIMESTAMP} < $1 \
         ORDER BY {COL_XID} DESC LIMIT 1",
        tables.transaction
    );
    let horizon_snapshot: Option<String> = sqlx::query_scalar(&horizon_sql)
        .bind(horizon_ts)
        .fetch_optional(&mut *conn)
        .await
        .map_err(errors::wrap)?;
    let Some(horizon_snapshot) = horizon_snapshot else {
        // Nothing has aged out of the window yet.
        return Ok(GcReport::default());
    };
    let horizon_xmin = horizon_snapshot.parse::<PgSnapshot>()?.xmin();

    let mut report = GcReport::default();

    // Expired relationships: deleted before every still-serviceable revision.
    report.relationships = batched_delete(&mut conn, |qb| {
        let key_cols = format!("{}, {COL_CREATED_XID}", TUPLE_KEY_COLS.join(", "));
        qb.push(format!(
            "DELETE FROM {table} WHERE ({key_cols}) IN \
             (SELECT {key_cols} FROM {table} WHERE {COL_DELETED_XID} < ",
            table = tables.tuple,
        ));
        qb.push_bind(horizon_xmin.to_string()).push("::text::xid8 LIMIT ");
        qb.push_bind(GC_BATCH_SIZE).push(")");
    })
    .await?;

    // Expired transaction rows, by timestamp.
    report.transactions = batched_delete(&mut conn, |qb| {
        qb.push(format!(
            "DELETE FROM {table} WHERE {COL_XID} IN \
             (SELECT {COL_XID} FROM {table} WHERE {COL_TIMESTAMP} < ",
            table = tables.transaction,
        ));
        qb.push_bind(horizon_ts).push(" LIMIT ");
        qb.push_bind(GC_BATCH_SIZE).push(")");
    })
    .await?;

    // Soft-deleted definitions whose deletion aged out.
    report.namespaces =
        batched_definition_delete(&mut conn, &tables.namespace, horizon_xmin).await?;
    report.caveats = batched_definition_delete(&mut conn, &tables.caveat, horizon_xmin).await?;

    Ok(report)
}

async fn batched_definition_delete(
    conn: &mut PooledConn,
    table: &str,
    horizon_xmin: u64,
) -> StoreResult<u64> {
    batched_delete(conn, |qb| {
        qb.push(format!(
            "DELETE FROM {table} WHERE ({COL_NAME}, {COL_CREATED_XID}) IN \
             (SELECT {COL_NAME}, {COL_CREATED_XID} FROM {table} WHERE {COL_DELETED_XID} < "
        ));
        qb.push_bind(horizon_xmin.to_string()).push("::text::xid8 LIMIT ");
        qb.push_bind(GC_BATCH_SIZE).push(")");
    })
    .await
}

/// Repeats a bounded DELETE until it stops making progress. Each execution
/// commits independently (autocommit), so a failure mid-way leaves earlier
/// batches reclaimed.
async fn batched_delete(
    conn: &mut PooledConn,
    build: impl Fn(&mut QueryBuilder<'static, Postgres>),
) -> StoreResult<u64> {
    let mut total = 0u64;
    loop {
        let mut qb = QueryBuilder::<Postgres>::new("");
        build(&mut qb);
        let affected =
            qb.build().execute(&mut **conn).await.map_err(errors::wrap)?.rows_affected();
        total += affected;
        if affected < GC_BATCH_SIZE as u64 {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_report_totals() {
        let report = GcReport { relationships: 5, transactions: 2, namespaces: 1, caveats: 0 };
        assert_eq!(report.total(), 8);
        assert_eq!(GcReport::default().total(), 0);
    }

    #[test]
    fn test_batch_sql_shape() {
        let tables = Tables::new(&crate::postgres::options::TableNames::default());
        let mut qb = QueryBuilder::<Postgres>::new("");
        let key_cols = format!("{}, {COL_CREATED_XID}", TUPLE_KEY_COLS.join(", "));
        qb.push(format!(
            "DELETE FROM {table} WHERE ({key_cols}) IN \
             (SELECT {key_cols} FROM {table} WHERE {COL_DELETED_XID} < ",
            table = tables.tuple,
        ));
        qb.push_bind("12345".to_string()).push("::text::xid8 LIMIT ");
        qb.push_bind(GC_BATCH_SIZE).push(")");

        let sql = qb.sql();
        assert!(sql.starts_with("DELETE FROM \"tuple\" WHERE (namespace, object_id"));
        assert!(sql.contains("deleted_xid < $1::text::xid8 LIMIT $2"));
    }
}
