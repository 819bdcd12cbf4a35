//! The watch pipeline: tails committed transactions after a revision and
//! emits per-revision change sets in commit order.
//!
//! The pipeline polls the transaction table for xids that are visible now
//! but were not visible at the watermark snapshot, orders them by commit
//! timestamp (which is why `track_commit_timestamp=on` gates the feature),
//! loads each transaction's changes, and pushes them into a bounded channel.
//! A consumer that cannot drain within the write timeout aborts the watch
//! with `BufferOverflow`; nothing is ever dropped silently.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgRow, Postgres};
use sqlx::{QueryBuilder, Row};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stratum_types::{
    ChangeOperation, RelationshipChange, SchemaChange, StoreError, StoreResult,
};

use crate::metrics::StoreMetrics;
use crate::RevisionChanges;

use super::errors;
use super::pool::ConnPool;
use super::reader::decode_relationship;
use super::revision::{PgSnapshot, Revision, Xid};
use super::tables::*;

/// Fully-resolved watch parameters.
#[derive(Debug, Clone)]
pub(crate) struct WatchParams {
    pub emit_relationship_changes: bool,
    pub emit_schema_changes: bool,
    pub emit_checkpoints: bool,
    pub buffer_length: u16,
    pub buffer_write_timeout: Duration,
    pub poll_interval: Duration,
}

/// Spawns the watch task. The returned receivers close when the watch
/// terminates for any reason.
pub(crate) fn spawn(
    pool: ConnPool,
    tables: Arc<Tables>,
    metrics: Arc<StoreMetrics>,
    after: Revision,
    params: WatchParams,
    cancel: CancellationToken,
) -> (
    mpsc::Receiver<RevisionChanges>,
    mpsc::Receiver<StoreError>,
    tokio::task::JoinHandle<()>,
) {
    let (changes_tx, changes_rx) = mpsc::channel(params.buffer_length.max(1) as usize);
    let (errors_tx, errors_rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        let outcome =
            run(pool, tables, metrics, after, &params, cancel, &changes_tx).await;
        if let Err(err) = outcome {
            // Best effort: the consumer may already be gone.
            let _ = errors_tx.try_send(err);
        }
        // Dropping the senders closes both sequences.
    });

    (changes_rx, errors_rx, handle)
}

async fn run(
    pool: ConnPool,
    tables: Arc<Tables>,
    metrics: Arc<StoreMetrics>,
    after: Revision,
    params: &WatchParams,
    cancel: CancellationToken,
    changes_tx: &mpsc::Sender<RevisionChanges>,
) -> StoreResult<()> {
    let mut watermark = after.snapshot().clone();
    let mut last_checkpoint: Option<Revision> = None;

    let mut ticker = tokio::time::interval(params.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let new_revisions = load_new_revisions(&pool, &tables, &watermark).await?;
        for (xid, snapshot) in new_revisions {
            let revision = Revision::for_committed(xid, snapshot);
            watermark = watermark.mark_complete(xid);

            let mut changes = RevisionChanges {
                revision: Some(revision.clone()),
                ..Default::default()
            };
            if params.emit_relationship_changes {
                changes.relationship_changes =
                    load_relationship_changes(&pool, &tables, xid).await?;
            }
            if params.emit_schema_changes {
                changes.schema_changes = load_schema_changes(&pool, &tables, xid).await?;
            }

            if changes.relationship_changes.is_empty() && changes.schema_changes.is_empty() {
                continue;
            }

            send_or_overflow(changes_tx, changes, params.buffer_write_timeout).await?;
            metrics.record_watch_event();
            last_checkpoint = Some(revision);
        }

        if params.emit_checkpoints {
            let head = Revision::new(Xid(watermark.xmax().saturating_sub(1)), watermark.clone());
            let advanced = match &last_checkpoint {
                Some(previous) => head.greater_than(previous),
                None => true,
            };
            if advanced {
                let checkpoint = RevisionChanges {
                    revision: Some(head.clone()),
                    is_checkpoint: true,
                    ..Default::default()
                };
                send_or_overflow(changes_tx, checkpoint, params.buffer_write_timeout).await?;
                last_checkpoint = Some(head);
            }
        }
    }
}

async fn send_or_overflow(
    changes_tx: &mpsc::Sender<RevisionChanges>,
    changes: RevisionChanges,
    timeout: Duration,
) -> StoreResult<()> {
    match changes_tx.send_timeout(changes, timeout).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
            Err(StoreError::BufferOverflow { timeout })
        }
        // Receiver dropped: the consumer walked away; end quietly.
        Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(StoreError::Canceled),
    }
}

/// Transactions committed since the watermark snapshot, in commit order.
async fn load_new_revisions(
    pool: &ConnPool,
    tables: &Tables,
    watermark: &PgSnapshot,
) -> StoreResult<Vec<(Xid, PgSnapshot)>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {xid}::text, {snapshot}::text FROM {transaction} \
         WHERE pg_visible_in_snapshot({xid}, pg_current_snapshot()) = true \
           AND pg_visible_in_snapshot({xid}, ",
        xid = COL_XID,
        snapshot = COL_SNAPSHOT,
        transaction = tables.transaction,
    ));
    qb.push_bind(watermark.to_string()).push(
        format!(
            "::pg_snapshot) = false \
             ORDER BY pg_xact_commit_timestamp({xid}::xid), {xid}",
            xid = COL_XID
        ),
    );

    let mut conn = pool.acquire().await?;
    let rows = qb.build().fetch_all(&mut *conn).await.map_err(errors::wrap)?;
    rows.into_iter()
        .map(|row| {
            let xid_text: String = row.try_get(0).map_err(errors::wrap)?;
            let snapshot_text: String = row.try_get(1).map_err(errors::wrap)?;
            let xid = xid_text.parse::<Xid>().map_err(|_| {
                StoreError::internal_msg(format!("malformed xid `{xid_text}`"))
            })?;
            Ok((xid, snapshot_text.parse::<PgSnapshot>()?))
        })
        .collect()
}

async fn load_relationship_changes(
    pool: &ConnPool,
    tables: &Tables,
    xid: Xid,
) -> StoreResult<Vec<RelationshipChange>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {}, {COL_CREATED_XID}::text, {COL_DELETED_XID}::text FROM {} WHERE ",
        tables.tuple_select_list(),
        tables.tuple
    ));
    qb.push(COL_CREATED_XID).push(" = ").push_bind(xid.to_string()).push("::text::xid8");
    qb.push(" OR ").push(COL_DELETED_XID).push(" = ").push_bind(xid.to_string()).push("::text::xid8");
    // Within a revision, consumers observe changes in the order the write
    // inserted them. Rows the transaction deleted carry older ordinals than
    // rows it created, so a touch surfaces as delete-then-create.
    qb.push(format!(" ORDER BY {COL_CREATED_XID}, {COL_ORDINAL}"));

    let mut conn = pool.acquire().await?;
    let rows = qb.build().fetch_all(&mut *conn).await.map_err(errors::wrap)?;

    let mut changes = Vec::new();
    for row in &rows {
        if let Some(change) = classify_change(row, xid)? {
            changes.push(change);
        }
    }
    Ok(changes)
}

/// Classifies one touched row. A row both created and deleted by the same
/// transaction never became visible and produces no event.
fn classify_change(row: &PgRow, xid: Xid) -> StoreResult<Option<RelationshipChange>> {
    let created: String = row.try_get(COL_CREATED_XID).map_err(errors::wrap)?;
    let deleted: String = row.try_get(COL_DELETED_XID).map_err(errors::wrap)?;
    let created_here = created == xid.to_string();
    let deleted_here = deleted == xid.to_string();

    let operation = match (created_here, deleted_here) {
        (true, true) => return Ok(None),
        (true, false) => ChangeOperation::Create,
        (false, true) => ChangeOperation::Delete,
        (false, false) => {
            return Err(StoreError::internal_msg(
                "change query returned a row untouched by the transaction",
            ))
        }
    };

    Ok(Some(RelationshipChange { operation, relationship: decode_relationship(row)? }))
}

async fn load_schema_changes(
    pool: &ConnPool,
    tables: &Tables,
    xid: Xid,
) -> StoreResult<Vec<SchemaChange>> {
    let mut changes = Vec::new();

    let namespace_rows =
        load_definition_changes(pool, &tables.namespace, COL_CONFIG, xid).await?;
    for (body, created_here, deleted_here) in namespace_rows {
        match (created_here, deleted_here) {
            (true, true) => {}
            (true, false) => {
                changes.push(SchemaChange::ChangedNamespace(serde_json::from_str(&body)?))
            }
            _ => {
                let definition: stratum_types::NamespaceDefinition = serde_json::from_str(&body)?;
                changes.push(SchemaChange::DeletedNamespace(definition.name));
            }
        }
    }

    let caveat_rows = load_definition_changes(pool, &tables.caveat, COL_DEFINITION, xid).await?;
    for (body, created_here, deleted_here) in caveat_rows {
        match (created_here, deleted_here) {
            (true, true) => {}
            (true, false) => {
                changes.push(SchemaChange::ChangedCaveat(serde_json::from_str(&body)?))
            }
            _ => {
                let definition: stratum_types::CaveatDefinition = serde_json::from_str(&body)?;
                changes.push(SchemaChange::DeletedCaveat(definition.name));
            }
        }
    }

    Ok(changes)
}

async fn load_definition_changes(
    pool: &ConnPool,
    table: &str,
    body_col: &str,
    xid: Xid,
) -> StoreResult<Vec<(String, bool, bool)>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {body_col}, {COL_CREATED_XID}::text, {COL_DELETED_XID}::text FROM {table} WHERE "
    ));
    qb.push(COL_CREATED_XID).push(" = ").push_bind(xid.to_string()).push("::text::xid8");
    qb.push(" OR ").push(COL_DELETED_XID).push(" = ").push_bind(xid.to_string()).push("::text::xid8");

    let mut conn = pool.acquire().await?;
    let rows = qb.build().fetch_all(&mut *conn).await.map_err(errors::wrap)?;
    rows.into_iter()
        .map(|row| {
            let body: String = row.try_get(0).map_err(errors::wrap)?;
            let created: String = row.try_get(1).map_err(errors::wrap)?;
            let deleted: String = row.try_get(2).map_err(errors::wrap)?;
            Ok((body, created == xid.to_string(), deleted == xid.to_string()))
        })
        .collect()
}
