//! Snapshot and transactional reads.
//!
//! A [`PgReader`] either owns a handle to the read pool (snapshot reads,
//! one short repeatable-read transaction per query, rows streamed) or shares
//! the connection of an open read-write transaction (reads-your-own-writes,
//! rows buffered since the transaction owns the connection).

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use sqlx::postgres::{PgRow, Postgres};
use sqlx::{Executor as _, QueryBuilder, Row};
use tokio::sync::Mutex;

use stratum_types::{
    CaveatDefinition, ContextualizedCaveat, NamespaceDefinition, ObjectAndRelation, Relationship,
    RelationshipIntegrity, RelationshipsFilter, StoreError, StoreResult, SubjectsFilter, ELLIPSIS,
};

use crate::iterator::{Cursor, CursorKey, RelationshipIterator};
use crate::metrics::{OpTimer, StoreMetrics};
use crate::{
    QueryOptions, Reader, RelationshipCounter, ReverseQueryOptions, RevisionedCaveat,
    RevisionedNamespace, SortOrder,
};

use super::errors;
use super::pool::{ConnPool, PooledConn};
use super::revision::{PgSnapshot, Revision, Xid, LIVE_DELETED_XID};
use super::tables::*;

const BEGIN_READ_ONLY: &str = "BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY";

/// How rows are fetched: from the shared read pool, or over the connection
/// of an open read-write transaction.
#[derive(Clone)]
pub(crate) enum ReadExecutor {
    Pool(ConnPool),
    Tx(Arc<Mutex<PooledConn>>),
}

/// The row-liveness predicate for a reader.
#[derive(Debug, Clone)]
pub(crate) enum LivingFilter {
    /// Created-and-not-deleted as of the given snapshot.
    AtSnapshot(PgSnapshot),
    /// Rows whose `deleted_xid` is the live sentinel; inside a transaction
    /// this includes the transaction's own uncommitted writes.
    CurrentlyLiving,
}

impl LivingFilter {
    fn push_predicate(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            LivingFilter::AtSnapshot(snapshot) => {
                qb.push(" AND pg_visible_in_snapshot(")
                    .push(COL_CREATED_XID)
                    .push(", ")
                    .push_bind(snapshot.to_string())
                    .push("::pg_snapshot) = true");
                qb.push(" AND pg_visible_in_snapshot(")
                    .push(COL_DELETED_XID)
                    .push(", ")
                    .push_bind(snapshot.to_string())
                    .push("::pg_snapshot) = false");
            }
            LivingFilter::CurrentlyLiving => {
                qb.push(" AND ")
                    .push(COL_DELETED_XID)
                    .push(" = ")
                    .push_bind(LIVE_DELETED_XID.to_string())
                    .push("::text::xid8");
            }
        }
    }
}

pub(crate) struct PgReader {
    executor: ReadExecutor,
    living: LivingFilter,
    /// Set for snapshot readers; transactional readers have no committed
    /// revision and therefore no cursors.
    revision: Option<Revision>,
    tables: Arc<Tables>,
    metrics: Arc<StoreMetrics>,
}

impl PgReader {
    pub(crate) fn for_snapshot(
        pool: ConnPool,
        revision: Revision,
        tables: Arc<Tables>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            executor: ReadExecutor::Pool(pool),
            living: LivingFilter::AtSnapshot(revision.snapshot().clone()),
            revision: Some(revision),
            tables,
            metrics,
        }
    }

    pub(crate) fn for_transaction(
        conn: Arc<Mutex<PooledConn>>,
        tables: Arc<Tables>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            executor: ReadExecutor::Tx(conn),
            living: LivingFilter::CurrentlyLiving,
            revision: None,
            tables,
            metrics,
        }
    }

    /// Runs a fully-built query, buffering the rows.
    async fn fetch_all(&self, qb: &mut QueryBuilder<'_, Postgres>) -> StoreResult<Vec<PgRow>> {
        let timer = OpTimer::new();
        let result = match &self.executor {
            ReadExecutor::Pool(pool) => {
                let mut conn = pool.acquire().await?;
                conn.mark_dirty();
                (&mut *conn).execute(BEGIN_READ_ONLY).await.map_err(errors::wrap)?;
                let rows = qb.build().fetch_all(&mut *conn).await.map_err(errors::wrap);
                if rows.is_ok() {
                    (&mut *conn).execute("COMMIT").await.map_err(errors::wrap)?;
                    conn.mark_clean();
                }
                rows
            }
            ReadExecutor::Tx(conn) => {
                let mut guard = conn.lock().await;
                qb.build().fetch_all(&mut **guard).await.map_err(errors::wrap)
            }
        };
        self.metrics.record_query(timer.elapsed(), result.is_err());
        result
    }

    /// Streams relationship rows. Pool-backed readers hold their connection
    /// for the lifetime of the stream; transactional readers buffer.
    async fn stream_relationships(
        &self,
        mut qb: QueryBuilder<'static, Postgres>,
        sort: Option<SortOrder>,
    ) -> StoreResult<RelationshipIterator> {
        match &self.executor {
            ReadExecutor::Pool(pool) => {
                let pool = pool.clone();
                let metrics = Arc::clone(&self.metrics);
                let stream = try_stream! {
                    let timer = OpTimer::new();
                    let mut conn = pool.acquire().await?;
                    conn.mark_dirty();
                    (&mut *conn)
                        .execute(BEGIN_READ_ONLY)
                        .await
                        .map_err(errors::wrap)?;
                    {
                        let query = qb.build();
                        let mut rows = query.fetch(&mut *conn);
                        while let Some(row) =
                            rows.try_next().await.map_err(errors::wrap)?
                        {
                            yield decode_relationship(&row)?;
                        }
                    }
                    (&mut *conn).execute("COMMIT").await.map_err(errors::wrap)?;
                    conn.mark_clean();
                    metrics.record_query(timer.elapsed(), false);
                };
                Ok(RelationshipIterator::new(stream.boxed(), self.revision.clone(), sort))
            }
            ReadExecutor::Tx(_) => {
                let rows = self.fetch_all(&mut qb).await?;
                let decoded = rows.iter().map(|row| decode_relationship(row)).collect();
                Ok(RelationshipIterator::from_vec(decoded, None, sort))
            }
        }
    }

    /// Validates a caller-supplied cursor against this reader and the
    /// requested sort order.
    fn check_cursor(&self, options_sort: Option<SortOrder>, after: &Cursor) -> StoreResult<()> {
        let Some(sort) = options_sort else {
            return Err(StoreError::InvalidArgument {
                message: "resuming from a cursor requires an explicit sort order".to_string(),
            });
        };
        if sort != after.sort {
            return Err(StoreError::InvalidArgument {
                message: "cursor was created with a different sort order".to_string(),
            });
        }
        if let Some(revision) = &self.revision {
            if !revision.equivalent(&after.revision) {
                return Err(StoreError::InvalidArgument {
                    message: "cursor was created at a different revision".to_string(),
                });
            }
        }
        Ok(())
    }

    fn relationships_query_base(&self) -> QueryBuilder<'static, Postgres> {
        QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            self.tables.tuple_select_list(),
            self.tables.tuple
        ))
    }

    async fn read_definitions(
        &self,
        table: &str,
        body_col: &str,
        names: Option<&[String]>,
    ) -> StoreResult<Vec<(String, Revision)>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {body_col}, {COL_CREATED_XID}::text FROM {table} WHERE 1 = 1"
        ));
        if let Some(names) = names {
            qb.push(" AND ").push(COL_NAME).push(" = ANY(").push_bind(names.to_vec()).push(")");
        }
        self.living.push_predicate(&mut qb);
        qb.push(" ORDER BY ").push(COL_NAME);

        let rows = self.fetch_all(&mut qb).await?;
        rows.iter()
            .map(|row| {
                let body: String = row.try_get(0).map_err(errors::wrap)?;
                let created: String = row.try_get(1).map_err(errors::wrap)?;
                let xid: Xid = created.parse().map_err(|_| {
                    StoreError::internal_msg(format!("malformed created_xid `{created}`"))
                })?;
                Ok((body, Revision::new(xid, PgSnapshot::complete_through(xid.0))))
            })
            .collect()
    }
}

#[async_trait]
impl Reader for PgReader {
    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        options: QueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        if let Some(after) = &options.after {
            self.check_cursor(options.sort, after)?;
        }

        let mut qb = self.relationships_query_base();
        push_relationships_filter(&mut qb, &filter);
        self.living.push_predicate(&mut qb);
        push_order_and_limit(&mut qb, options.sort, options.after.as_ref(), options.limit);

        self.stream_relationships(qb, options.sort).await
    }

    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        options: ReverseQueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        if let Some(after) = &options.after {
            self.check_cursor(options.sort, after)?;
        }

        let mut qb = self.relationships_query_base();
        push_subjects_filter(&mut qb, &subjects_filter);
        if let Some((resource_type, relation)) = &options.resource_relation {
            qb.push(" AND ").push(COL_NAMESPACE).push(" = ").push_bind(resource_type.clone());
            qb.push(" AND ").push(COL_RELATION).push(" = ").push_bind(relation.clone());
        }
        self.living.push_predicate(&mut qb);
        push_order_and_limit(&mut qb, options.sort, options.after.as_ref(), options.limit);

        self.stream_relationships(qb, options.sort).await
    }

    async fn read_namespace(&self, name: &str) -> StoreResult<RevisionedNamespace> {
        let names = [name.to_string()];
        let mut results = self.lookup_namespaces(&names).await?;
        results
            .pop()
            .ok_or_else(|| StoreError::NamespaceNotFound { name: name.to_string() })
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<RevisionedNamespace>> {
        let table = self.tables.namespace.clone();
        let rows = self.read_definitions(&table, COL_CONFIG, None).await?;
        decode_namespaces(rows)
    }

    async fn lookup_namespaces(&self, names: &[String]) -> StoreResult<Vec<RevisionedNamespace>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.tables.namespace.clone();
        let rows = self.read_definitions(&table, COL_CONFIG, Some(names)).await?;
        decode_namespaces(rows)
    }

    async fn read_caveat(&self, name: &str) -> StoreResult<RevisionedCaveat> {
        let names = [name.to_string()];
        let mut results = self.lookup_caveats(&names).await?;
        results.pop().ok_or_else(|| StoreError::CaveatNotFound { name: name.to_string() })
    }

    async fn list_caveats(&self) -> StoreResult<Vec<RevisionedCaveat>> {
        let table = self.tables.caveat.clone();
        let rows = self.read_definitions(&table, COL_DEFINITION, None).await?;
        decode_caveats(rows)
    }

    async fn lookup_caveats(&self, names: &[String]) -> StoreResult<Vec<RevisionedCaveat>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.tables.caveat.clone();
        let rows = self.read_definitions(&table, COL_DEFINITION, Some(names)).await?;
        decode_caveats(rows)
    }

    async fn count_relationships(&self, counter_name: &str) -> StoreResult<u64> {
        let counters = self.lookup_counters().await?;
        let counter = counters
            .into_iter()
            .find(|c| c.name == counter_name)
            .ok_or_else(|| StoreError::CounterNotRegistered { name: counter_name.to_string() })?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT count(*) FROM {} WHERE 1 = 1",
            self.tables.tuple
        ));
        push_relationships_filter(&mut qb, &counter.filter);
        self.living.push_predicate(&mut qb);

        let rows = self.fetch_all(&mut qb).await?;
        let row = rows
            .first()
            .ok_or_else(|| StoreError::internal_msg("count query returned no rows"))?;
        let count: i64 = row.try_get(0).map_err(errors::wrap)?;
        Ok(count.max(0) as u64)
    }

    async fn lookup_counters(&self) -> StoreResult<Vec<RelationshipCounter>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COL_NAME}, {COL_COUNTER_FILTER}, {COL_COUNTER_COUNT}, \
             {COL_COUNTER_SNAPSHOT} FROM {} ORDER BY {COL_NAME}",
            self.tables.relationship_counter
        ));
        let rows = self.fetch_all(&mut qb).await?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(errors::wrap)?;
                let filter_body: String = row.try_get(1).map_err(errors::wrap)?;
                let count: i64 = row.try_get(2).map_err(errors::wrap)?;
                let snapshot: Option<String> = row.try_get(3).map_err(errors::wrap)?;
                let computed_at = snapshot.map(|token| Revision::parse_token(&token)).transpose()?;
                Ok(RelationshipCounter {
                    name,
                    filter: serde_json::from_str(&filter_body)?,
                    count: count.max(0) as u64,
                    computed_at,
                })
            })
            .collect()
    }
}

// ============================================================================
// Query Fragments
// ============================================================================

pub(crate) fn push_relationships_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &RelationshipsFilter,
) {
    if let Some(resource_type) = &filter.resource_type {
        qb.push(" AND ").push(COL_NAMESPACE).push(" = ").push_bind(resource_type.clone());
    }
    if !filter.resource_ids.is_empty() {
        qb.push(" AND ")
            .push(COL_OBJECT_ID)
            .push(" = ANY(")
            .push_bind(filter.resource_ids.clone())
            .push(")");
    }
    if let Some(prefix) = &filter.resource_id_prefix {
        qb.push(" AND starts_with(")
            .push(COL_OBJECT_ID)
            .push(", ")
            .push_bind(prefix.clone())
            .push(")");
    }
    if let Some(relation) = &filter.relation {
        qb.push(" AND ").push(COL_RELATION).push(" = ").push_bind(relation.clone());
    }
    if let Some(caveat_name) = &filter.caveat_name {
        if caveat_name.is_empty() {
            qb.push(" AND ").push(COL_CAVEAT_NAME).push(" IS NULL");
        } else {
            qb.push(" AND ").push(COL_CAVEAT_NAME).push(" = ").push_bind(caveat_name.clone());
        }
    }
    if let Some(subject) = &filter.subject {
        push_subjects_filter(qb, subject);
    }
}

pub(crate) fn push_subjects_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SubjectsFilter) {
    qb.push(" AND ")
        .push(COL_SUBJECT_NAMESPACE)
        .push(" = ")
        .push_bind(filter.subject_type.clone());
    if !filter.subject_ids.is_empty() {
        qb.push(" AND ")
            .push(COL_SUBJECT_OBJECT_ID)
            .push(" = ANY(")
            .push_bind(filter.subject_ids.clone())
            .push(")");
    }
    if let Some(relation_filter) = &filter.relation {
        match (&relation_filter.non_ellipsis_relation, relation_filter.include_ellipsis) {
            (Some(relation), true) => {
                qb.push(" AND ")
                    .push(COL_SUBJECT_RELATION)
                    .push(" IN (")
                    .push_bind(ELLIPSIS)
                    .push(", ")
                    .push_bind(relation.clone())
                    .push(")");
            }
            (Some(relation), false) => {
                qb.push(" AND ")
                    .push(COL_SUBJECT_RELATION)
                    .push(" = ")
                    .push_bind(relation.clone());
            }
            (None, true) => {
                qb.push(" AND ").push(COL_SUBJECT_RELATION).push(" = ").push_bind(ELLIPSIS);
            }
            (None, false) => {}
        }
    }
}

/// The sort columns, in comparison order, for each ordering.
fn sort_columns(sort: SortOrder) -> [&'static str; 6] {
    match sort {
        SortOrder::ByResource => [
            COL_NAMESPACE,
            COL_OBJECT_ID,
            COL_RELATION,
            COL_SUBJECT_NAMESPACE,
            COL_SUBJECT_OBJECT_ID,
            COL_SUBJECT_RELATION,
        ],
        SortOrder::BySubject => [
            COL_SUBJECT_NAMESPACE,
            COL_SUBJECT_OBJECT_ID,
            COL_SUBJECT_RELATION,
            COL_NAMESPACE,
            COL_OBJECT_ID,
            COL_RELATION,
        ],
    }
}

fn cursor_values(sort: SortOrder, key: &CursorKey) -> [String; 6] {
    let (r, s) = (&key.resource, &key.subject);
    match sort {
        SortOrder::ByResource => [
            r.namespace.clone(),
            r.object_id.clone(),
            r.relation.clone(),
            s.namespace.clone(),
            s.object_id.clone(),
            s.relation.clone(),
        ],
        SortOrder::BySubject => [
            s.namespace.clone(),
            s.object_id.clone(),
            s.relation.clone(),
            r.namespace.clone(),
            r.object_id.clone(),
            r.relation.clone(),
        ],
    }
}

pub(crate) fn push_order_and_limit(
    qb: &mut QueryBuilder<'_, Postgres>,
    sort: Option<SortOrder>,
    after: Option<&Cursor>,
    limit: Option<u64>,
) {
    if let Some(sort) = sort {
        let columns = sort_columns(sort);

        // Resume strictly after the cursor's row, using a row-value
        // comparison over the full living-row key.
        if let Some(after_key) = after.and_then(|cursor| cursor.last.as_ref()) {
            qb.push(" AND (");
            for column in columns {
                qb.push(column).push(", ");
            }
            qb.push("coalesce(").push(COL_CAVEAT_NAME).push(", '')) > (");
            for value in cursor_values(sort, after_key) {
                qb.push_bind(value).push(", ");
            }
            qb.push_bind(after_key.caveat_name.clone()).push(")");
        }

        qb.push(" ORDER BY ");
        for column in columns {
            qb.push(column).push(", ");
        }
        qb.push("coalesce(").push(COL_CAVEAT_NAME).push(", '')");
    }

    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
}

// ============================================================================
// Row Decoding
// ============================================================================

pub(crate) fn decode_relationship(row: &PgRow) -> StoreResult<Relationship> {
    let caveat_name: Option<String> = row.try_get(COL_CAVEAT_NAME).map_err(errors::wrap)?;
    let caveat = match caveat_name {
        Some(caveat_name) => {
            let context: Option<serde_json::Value> =
                row.try_get(COL_CAVEAT_CONTEXT).map_err(errors::wrap)?;
            let context = match context {
                Some(serde_json::Value::Object(map)) => map,
                Some(other) => {
                    return Err(StoreError::internal_msg(format!(
                        "caveat context is not a JSON object: {other}"
                    )))
                }
                None => serde_json::Map::new(),
            };
            Some(ContextualizedCaveat { caveat_name, context })
        }
        None => None,
    };

    let integrity_key_id: Option<String> =
        row.try_get(COL_INTEGRITY_KEY_ID).map_err(errors::wrap)?;
    let integrity = match integrity_key_id {
        Some(key_id) => {
            let hash: Vec<u8> = row.try_get(COL_INTEGRITY_HASH).map_err(errors::wrap)?;
            let hashed_at = row.try_get(COL_INTEGRITY_HASHED_AT).map_err(errors::wrap)?;
            Some(RelationshipIntegrity { key_id, hash, hashed_at })
        }
        None => None,
    };

    Ok(Relationship {
        resource: ObjectAndRelation::new(
            row.try_get::<String, _>(COL_NAMESPACE).map_err(errors::wrap)?,
            row.try_get::<String, _>(COL_OBJECT_ID).map_err(errors::wrap)?,
            row.try_get::<String, _>(COL_RELATION).map_err(errors::wrap)?,
        ),
        subject: ObjectAndRelation::new(
            row.try_get::<String, _>(COL_SUBJECT_NAMESPACE).map_err(errors::wrap)?,
            row.try_get::<String, _>(COL_SUBJECT_OBJECT_ID).map_err(errors::wrap)?,
            row.try_get::<String, _>(COL_SUBJECT_RELATION).map_err(errors::wrap)?,
        ),
        caveat,
        integrity,
        description: row.try_get(COL_DESCRIPTION).map_err(errors::wrap)?,
        comment: row.try_get(COL_COMMENT).map_err(errors::wrap)?,
    })
}

fn decode_namespaces(rows: Vec<(String, Revision)>) -> StoreResult<Vec<RevisionedNamespace>> {
    rows.into_iter()
        .map(|(body, last_written)| {
            Ok(RevisionedNamespace { definition: serde_json::from_str(&body)?, last_written })
        })
        .collect()
}

fn decode_caveats(rows: Vec<(String, Revision)>) -> StoreResult<Vec<RevisionedCaveat>> {
    rows.into_iter()
        .map(|(body, last_written)| {
            Ok(RevisionedCaveat { definition: serde_json::from_str(&body)?, last_written })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_builder() -> QueryBuilder<'static, Postgres> {
        QueryBuilder::new("SELECT 1 FROM t WHERE 1 = 1")
    }

    #[test]
    fn test_filter_sql_shape() {
        let mut qb = new_builder();
        let filter = RelationshipsFilter {
            resource_type: Some("document".to_string()),
            resource_ids: vec!["a".to_string(), "b".to_string()],
            relation: Some("viewer".to_string()),
            ..Default::default()
        };
        push_relationships_filter(&mut qb, &filter);
        let sql = qb.sql();
        assert!(sql.contains("namespace = $1"));
        assert!(sql.contains("object_id = ANY($2)"));
        assert!(sql.contains("relation = $3"));
    }

    #[test]
    fn test_uncaveated_filter_uses_is_null() {
        let mut qb = new_builder();
        let filter = RelationshipsFilter {
            caveat_name: Some(String::new()),
            ..Default::default()
        };
        push_relationships_filter(&mut qb, &filter);
        assert!(qb.sql().contains("caveat_name IS NULL"));
    }

    #[test]
    fn test_subject_relation_combinations() {
        use stratum_types::SubjectRelationFilter;

        let mut qb = new_builder();
        push_subjects_filter(
            &mut qb,
            &SubjectsFilter {
                subject_type: "user".to_string(),
                subject_ids: Vec::new(),
                relation: Some(SubjectRelationFilter {
                    include_ellipsis: true,
                    non_ellipsis_relation: Some("member".to_string()),
                }),
            },
        );
        assert!(qb.sql().contains("subject_relation IN ($2, $3)"));

        let mut qb = new_builder();
        push_subjects_filter(
            &mut qb,
            &SubjectsFilter {
                subject_type: "user".to_string(),
                subject_ids: Vec::new(),
                relation: Some(SubjectRelationFilter::ellipsis_only()),
            },
        );
        assert!(qb.sql().contains("subject_relation = $2"));
    }

    #[test]
    fn test_order_and_cursor_sql() {
        let revision = Revision::new(Xid(9), PgSnapshot::complete_through(9));
        let cursor = Cursor {
            revision,
            sort: SortOrder::ByResource,
            last: Some(CursorKey {
                resource: ObjectAndRelation::new("document", "a", "viewer"),
                subject: ObjectAndRelation::for_subject("user", "alice"),
                caveat_name: String::new(),
            }),
        };

        let mut qb = new_builder();
        push_order_and_limit(&mut qb, Some(SortOrder::ByResource), Some(&cursor), Some(10));
        let sql = qb.sql();
        assert!(sql.contains(
            "(namespace, object_id, relation, subject_namespace, subject_object_id, \
             subject_relation, coalesce(caveat_name, '')) > ($1, $2, $3, $4, $5, $6, $7)"
        ));
        assert!(sql.contains("ORDER BY namespace, object_id"));
        assert!(sql.contains("LIMIT $8"));
    }

    #[test]
    fn test_by_subject_order() {
        let mut qb = new_builder();
        push_order_and_limit(&mut qb, Some(SortOrder::BySubject), None, None);
        assert!(qb.sql().contains("ORDER BY subject_namespace, subject_object_id"));
    }
}
