//! The PostgreSQL-backed datastore.
//!
//! Revisioning is implemented with manual bookkeeping: every write
//! transaction inserts a row into the transaction table, whose defaults
//! capture `pg_current_xact_id()` and `pg_current_snapshot()`. Reads filter
//! rows through `pg_visible_in_snapshot` against a revision's snapshot, so a
//! reader at revision R observes exactly the transactions R could see.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgConnectOptions;
use sqlx::Executor as _;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use stratum_types::{StoreError, StoreResult};

use crate::metrics::{OpTimer, StoreMetrics};
use crate::{
    Datastore, Feature, Features, Reader, ReadyState, RwtOptions, Stats, TxFn, WatchOptions,
    WatchReceivers,
};

pub(crate) mod errors;
pub mod gc;
pub mod options;
pub(crate) mod pool;
pub(crate) mod reader;
pub mod revision;
pub(crate) mod tables;
pub(crate) mod watch;
pub(crate) mod writer;

use gc::GcReport;
use options::PgDatastoreOptions;
use pool::{AfterConnectFn, ConnPool};
use reader::PgReader;
use revision::{PgSnapshot, Revision, Xid};
use tables::Tables;
use writer::PgReadWriteTx;

/// Embedded schema migrations, applied via [`PgDatastore::run_migrations`].
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// The version of the newest embedded migration; `ready_state` compares the
/// database against it.
const HEAD_MIGRATION_VERSION: i64 = 3;

/// Hard ceiling on initialization (pool construction plus feature probes).
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

const BEGIN_SERIALIZABLE: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE";

struct Inner {
    read_pool: ConnPool,
    write_pool: ConnPool,
    tables: Arc<Tables>,
    options: PgDatastoreOptions,
    metrics: Arc<StoreMetrics>,
    watch_enabled: bool,
    /// Cached optimized revision and the instant it expires. The mutex also
    /// single-flights recomputation.
    revision_cache: Mutex<Option<(Revision, Instant)>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A revisioned relationship datastore backed by PostgreSQL.
#[derive(Clone)]
pub struct PgDatastore {
    inner: Arc<Inner>,
}

impl PgDatastore {
    /// Connects to the database, probes features, and starts the background
    /// garbage collector. Bounded by a hard five-second ceiling.
    pub async fn connect(url: &str, options: PgDatastoreOptions) -> StoreResult<Self> {
        options.validate()?;
        tokio::time::timeout(INIT_TIMEOUT, Self::connect_inner(url, options))
            .await
            .map_err(|_| StoreError::DeadlineExceeded)?
    }

    async fn connect_inner(url: &str, options: PgDatastoreOptions) -> StoreResult<Self> {
        let connect_options = PgConnectOptions::from_str(url)
            .map_err(|err| errors::redact_conn_string("unable to parse datastore URL", err, url))?;

        // Session verification run on every new connection: confirm the
        // server knows the types revisioning depends on.
        let after_connect: AfterConnectFn = Arc::new(|conn| Box::pin(verify_revision_types(conn)));

        let read_pool = ConnPool::new(
            connect_options.clone(),
            options.read_pool.clone(),
            options.credentials_provider.clone(),
            Some(Arc::clone(&after_connect)),
        );
        let write_pool = ConnPool::new(
            connect_options,
            options.write_pool.clone(),
            options.credentials_provider.clone(),
            Some(after_connect),
        );
        read_pool.warm().await?;
        write_pool.warm().await?;

        // The watch pipeline orders events by commit timestamp, which the
        // server only records with track_commit_timestamp=on.
        let track_commit_timestamps: String = {
            let mut conn = read_pool.acquire().await?;
            sqlx::query_scalar("SHOW track_commit_timestamp")
                .fetch_one(&mut *conn)
                .await
                .map_err(errors::wrap)?
        };
        let watch_enabled = track_commit_timestamps == "on";
        if !watch_enabled {
            tracing::warn!(
                "watch API disabled; the server must run with track_commit_timestamp=on"
            );
        }

        let metrics = Arc::new(StoreMetrics::new(options.enable_prometheus_stats));
        let tables = Arc::new(Tables::new(&options.tables));
        let cancel = CancellationToken::new();

        let datastore = Self {
            inner: Arc::new(Inner {
                read_pool,
                write_pool,
                tables,
                metrics,
                watch_enabled,
                revision_cache: Mutex::new(None),
                cancel,
                tasks: Mutex::new(Vec::new()),
                options,
            }),
        };

        if datastore.inner.options.gc_enabled && !datastore.inner.options.gc_interval.is_zero() {
            let handle = tokio::spawn(gc::run_task(
                datastore.inner.write_pool.clone(),
                Arc::clone(&datastore.inner.tables),
                Arc::clone(&datastore.inner.metrics),
                datastore.inner.options.gc_window,
                datastore.inner.options.gc_interval,
                datastore.inner.options.gc_max_operation_time,
                datastore.inner.cancel.child_token(),
            ));
            datastore.inner.tasks.lock().await.push(handle);
        } else {
            tracing::warn!("background garbage collection is disabled");
        }

        Ok(datastore)
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let mut conn = self.inner.write_pool.acquire().await?;
        MIGRATOR.run(&mut *conn).await.map_err(StoreError::internal)
    }

    /// Runs one garbage collection pass outside the background schedule.
    pub async fn collect_garbage(&self) -> StoreResult<GcReport> {
        gc::collect_once(
            &self.inner.write_pool,
            &self.inner.tables,
            self.inner.options.gc_window,
            self.inner.options.gc_max_operation_time,
        )
        .await
    }

    /// Brings the server's transaction counter forward to the maximum xid
    /// referenced in the transaction table by issuing batched no-op
    /// transactions. Optional repair tooling for restored backups whose
    /// counters lag the data.
    pub async fn repair_transaction_ids(&self) -> StoreResult<u64> {
        let mut conn = self.inner.write_pool.acquire().await?;

        let current: String = sqlx::query_scalar("SELECT pg_current_xact_id()::text")
            .fetch_one(&mut *conn)
            .await
            .map_err(errors::wrap)?;
        let current: u64 = current
            .parse()
            .map_err(|_| StoreError::internal_msg("malformed pg_current_xact_id"))?;

        let referenced_sql = format!(
            "SELECT coalesce(max({})::text, '0') FROM {}",
            tables::COL_XID,
            self.inner.tables.transaction
        );
        let referenced: String = sqlx::query_scalar(&referenced_sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(errors::wrap)?;
        let referenced: u64 =
            referenced.parse().map_err(|_| StoreError::internal_msg("malformed max xid"))?;

        if referenced <= current {
            return Ok(0);
        }

        let delta = referenced - current;
        tracing::info!(current, referenced, delta, "advancing transaction counter");
        for issued in 0..delta {
            // Allocate-and-abort burns exactly one xid per round trip.
            (&mut *conn)
                .execute("BEGIN; SELECT pg_current_xact_id(); ROLLBACK;")
                .await
                .map_err(errors::wrap)?;
            if issued % 10_000 == 0 && issued > 0 {
                tracing::debug!(issued, delta, "transaction counter repair progress");
            }
        }
        Ok(delta)
    }

    /// One attempt at a serializable read-write transaction.
    async fn try_tx(&self, f: &TxFn<'_>) -> StoreResult<Revision> {
        let mut conn = self.inner.write_pool.acquire().await?;
        conn.mark_dirty();
        (&mut *conn).execute(BEGIN_SERIALIZABLE).await.map_err(errors::wrap)?;

        let allocation_sql = self.inner.tables.create_transaction_sql();
        let (xid_text, snapshot_text): (String, String) = sqlx::query_as(&allocation_sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(errors::wrap)?;
        let xid: Xid = xid_text
            .parse()
            .map_err(|_| StoreError::internal_msg(format!("malformed xid `{xid_text}`")))?;
        let snapshot: PgSnapshot = snapshot_text.parse()?;

        let conn = Arc::new(Mutex::new(conn));
        let tx: Arc<dyn crate::ReadWriteTransaction> = Arc::new(PgReadWriteTx::new(
            Arc::clone(&conn),
            xid,
            Arc::clone(&self.inner.tables),
            Arc::clone(&self.inner.metrics),
        ));

        let result = f(Arc::clone(&tx)).await;
        drop(tx);

        let mut guard = conn.lock().await;
        match result {
            Ok(()) => {
                (&mut **guard).execute("COMMIT").await.map_err(errors::wrap)?;
                guard.mark_clean();
                Ok(Revision::for_committed(xid, snapshot))
            }
            Err(err) => {
                // Best effort; a failed rollback leaves the connection dirty
                // and it is discarded instead of reused.
                if (&mut **guard).execute("ROLLBACK").await.is_ok() {
                    guard.mark_clean();
                }
                Err(err)
            }
        }
    }

    async fn fetch_head_revision(&self) -> StoreResult<Revision> {
        let sql = self.inner.tables.head_revision_sql();
        let mut conn = self.inner.read_pool.acquire().await?;
        let row: Option<(String, String)> =
            sqlx::query_as(&sql).fetch_optional(&mut *conn).await.map_err(errors::wrap)?;
        let (xid_text, snapshot_text) = row.ok_or_else(|| {
            StoreError::internal_msg("transaction table is empty; is the datastore migrated?")
        })?;
        let xid: Xid = xid_text
            .parse()
            .map_err(|_| StoreError::internal_msg(format!("malformed xid `{xid_text}`")))?;
        Ok(Revision::for_committed(xid, snapshot_text.parse()?))
    }

    async fn compute_optimized_revision(&self) -> StoreResult<Revision> {
        let sql = self.inner.tables.optimized_revision_sql();
        let quantization_secs = self.inner.options.revision_quantization.as_secs_f64();
        let mut conn = self.inner.read_pool.acquire().await?;
        let row: Option<(String, String)> = sqlx::query_as(&sql)
            .bind(quantization_secs)
            .fetch_optional(&mut *conn)
            .await
            .map_err(errors::wrap)?;
        drop(conn);

        match row {
            Some((xid_text, snapshot_text)) => {
                let xid: Xid = xid_text
                    .parse()
                    .map_err(|_| StoreError::internal_msg(format!("malformed xid `{xid_text}`")))?;
                Ok(Revision::for_committed(xid, snapshot_text.parse()?))
            }
            // No transaction inside the current quantum yet; fall back to
            // the head.
            None => self.fetch_head_revision().await,
        }
    }

    /// How long a freshly computed optimized revision stays valid: the
    /// remainder of the current quantum plus the staleness budget.
    fn optimized_revision_validity(&self) -> Duration {
        let quantum = self.inner.options.revision_quantization;
        let staleness = quantum.mul_f64(self.inner.options.max_revision_staleness_percent);
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let into_quantum = Duration::from_nanos(
            (since_epoch.as_nanos() % quantum.as_nanos().max(1)) as u64,
        );
        quantum.saturating_sub(into_quantum) + staleness
    }
}

/// Confirms the server exposes the MVCC types revisioning depends on.
async fn verify_revision_types(conn: &mut sqlx::postgres::PgConnection) -> StoreResult<()> {
    conn.execute("SELECT 'pg_snapshot'::regtype, 'xid8'::regtype")
        .await
        .map_err(errors::wrap)?;
    Ok(())
}

/// Exponential backoff with bounded jitter for serialization retries.
fn retry_backoff(attempt: u8) -> Duration {
    let base = Duration::from_millis(10)
        .saturating_mul(1u32 << attempt.min(6) as u32)
        .min(Duration::from_secs(1));
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=base / 2);
    base + jitter
}

#[async_trait]
impl Datastore for PgDatastore {
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn Reader> {
        Box::new(PgReader::for_snapshot(
            self.inner.read_pool.clone(),
            revision,
            Arc::clone(&self.inner.tables),
            Arc::clone(&self.inner.metrics),
        ))
    }

    async fn read_write_tx(&self, f: &TxFn<'_>, options: RwtOptions) -> StoreResult<Revision> {
        let timer = OpTimer::new();
        let mut attempt: u8 = 0;

        loop {
            if let Some(deadline) = options.deadline {
                if Instant::now() >= deadline {
                    self.inner.metrics.record_transaction(timer.elapsed(), attempt as u64, true);
                    return Err(StoreError::DeadlineExceeded);
                }
            }

            match self.try_tx(f).await {
                Ok(revision) => {
                    if attempt > 0 {
                        tracing::debug!(retries = attempt, "transaction succeeded after retry");
                    }
                    self.inner.metrics.record_transaction(timer.elapsed(), attempt as u64, false);
                    return Ok(revision);
                }
                Err(err) if err.is_retryable() && !options.disable_retries => {
                    if attempt >= self.inner.options.max_retries {
                        self.inner.metrics.record_transaction(
                            timer.elapsed(),
                            attempt as u64,
                            true,
                        );
                        return Err(StoreError::MaxRetriesExceeded {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.inner.metrics.record_transaction(timer.elapsed(), attempt as u64, true);
                    return Err(err);
                }
            }
        }
    }

    async fn head_revision(&self) -> StoreResult<Revision> {
        self.fetch_head_revision().await
    }

    async fn optimized_revision(&self) -> StoreResult<Revision> {
        let mut cache = self.inner.revision_cache.lock().await;
        if let Some((revision, valid_until)) = &*cache {
            if Instant::now() < *valid_until {
                return Ok(revision.clone());
            }
        }

        let revision = self.compute_optimized_revision().await?;
        let valid_until = Instant::now() + self.optimized_revision_validity();
        *cache = Some((revision.clone(), valid_until));
        Ok(revision)
    }

    async fn check_revision(&self, revision: &Revision) -> StoreResult<()> {
        let sql = self.inner.tables.revision_bounds_sql();
        let window_secs = self.inner.options.gc_window.as_secs_f64();
        let mut conn = self.inner.read_pool.acquire().await?;
        let (min_text, max_text): (Option<String>, Option<String>) = sqlx::query_as(&sql)
            .bind(window_secs)
            .fetch_one(&mut *conn)
            .await
            .map_err(errors::wrap)?;

        let parse = |text: Option<String>| -> StoreResult<Option<u64>> {
            text.map(|t| {
                t.parse::<u64>()
                    .map_err(|_| StoreError::internal_msg(format!("malformed xid bound `{t}`")))
            })
            .transpose()
        };
        let min_xid = parse(min_text)?;
        let max_xid = parse(max_text)?;

        match (min_xid, max_xid) {
            (Some(min_xid), Some(max_xid)) => {
                if revision.xid().0 < min_xid {
                    return Err(StoreError::RevisionStale { revision: revision.to_string() });
                }
                if revision.xid().0 > max_xid {
                    return Err(StoreError::InvalidRevision {
                        token: revision.to_string(),
                        reason: "revision references an unknown transaction".to_string(),
                    });
                }
                Ok(())
            }
            _ => Err(StoreError::internal_msg(
                "transaction table is empty; is the datastore migrated?",
            )),
        }
    }

    fn revision_from_string(&self, token: &str) -> StoreResult<Revision> {
        Revision::parse_token(token)
    }

    async fn watch(&self, after: Revision, options: WatchOptions) -> WatchReceivers {
        if !self.inner.watch_enabled {
            let (_, changes_rx) = mpsc::channel(1);
            let (errors_tx, errors_rx) = mpsc::channel(1);
            let _ = errors_tx
                .send(StoreError::Unsupported { feature: "watch".to_string() })
                .await;
            return (changes_rx, errors_rx);
        }

        let params = watch::WatchParams {
            emit_relationship_changes: options.emit_relationship_changes,
            emit_schema_changes: options.emit_schema_changes,
            emit_checkpoints: options.emit_checkpoints,
            buffer_length: options
                .buffer_length
                .unwrap_or(self.inner.options.watch_buffer_length),
            buffer_write_timeout: options
                .buffer_write_timeout
                .unwrap_or(self.inner.options.watch_buffer_write_timeout),
            poll_interval: self.inner.options.watch_poll_interval,
        };

        let (changes_rx, errors_rx, handle) = watch::spawn(
            self.inner.read_pool.clone(),
            Arc::clone(&self.inner.tables),
            Arc::clone(&self.inner.metrics),
            after,
            params,
            self.inner.cancel.child_token(),
        );
        self.inner.tasks.lock().await.push(handle);
        (changes_rx, errors_rx)
    }

    async fn features(&self) -> StoreResult<Features> {
        Ok(Features {
            watch: if self.inner.watch_enabled {
                Feature::enabled()
            } else {
                Feature::disabled("the server is running without track_commit_timestamp=on")
            },
            integrity_data: Feature::enabled(),
        })
    }

    fn offline_features(&self) -> StoreResult<Features> {
        Ok(Features {
            // Without a probe the conservative answer is "configured state".
            watch: if self.inner.watch_enabled {
                Feature::enabled()
            } else {
                Feature::disabled("the server is running without track_commit_timestamp=on")
            },
            integrity_data: Feature::enabled(),
        })
    }

    async fn statistics(&self) -> StoreResult<Stats> {
        let mut conn = self.inner.read_pool.acquire().await?;

        if self.inner.options.analyze_before_statistics {
            let analyze = format!("ANALYZE {}", self.inner.tables.tuple);
            (&mut *conn).execute(analyze.as_str()).await.map_err(errors::wrap)?;
        }

        let estimated: i64 = sqlx::query_scalar(
            "SELECT coalesce(reltuples, 0)::bigint FROM pg_class WHERE oid = to_regclass($1)",
        )
        .bind(self.inner.tables.tuple.clone())
        .fetch_optional(&mut *conn)
        .await
        .map_err(errors::wrap)?
        .unwrap_or(0);
        drop(conn);

        let head = self.fetch_head_revision().await?;
        let reader = self.snapshot_reader(head);
        let object_definition_names = reader
            .list_namespaces()
            .await?
            .into_iter()
            .map(|revisioned| revisioned.definition.name)
            .collect();

        Ok(Stats {
            estimated_relationship_count: estimated.max(0) as u64,
            object_definition_names,
        })
    }

    async fn ready_state(&self) -> StoreResult<ReadyState> {
        let mut conn = self.inner.read_pool.acquire().await?;
        let version: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
            "SELECT version FROM _sqlx_migrations ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await;

        match version {
            Ok(Some(version)) if version == HEAD_MIGRATION_VERSION => Ok(ReadyState::ready()),
            Ok(version) => Ok(ReadyState::not_ready(format!(
                "datastore is at migration revision {:?} but requires {HEAD_MIGRATION_VERSION}; \
                 run the migrations",
                version
            ))),
            // The migrations table not existing at all is the common
            // "never migrated" case, not an internal fault.
            Err(_) => Ok(ReadyState::not_ready(
                "datastore has no migrations applied; run the migrations",
            )),
        }
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.cancel.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.read_pool.close().await;
        self.inner.write_pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_is_bounded() {
        for attempt in 0..=20u8 {
            let backoff = retry_backoff(attempt);
            assert!(backoff >= Duration::from_millis(10));
            assert!(backoff <= Duration::from_millis(1500), "attempt {attempt}: {backoff:?}");
        }
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        // Minimum possible values (zero jitter) still grow exponentially.
        let early = Duration::from_millis(10) * 2u32.pow(1);
        let late = Duration::from_millis(10) * 2u32.pow(5);
        assert!(late > early);
    }
}
