//! The read-write transaction handle: relationship mutations, definition
//! writes, counters, and the COPY-based bulk load fast path.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::QueryBuilder;
use tokio::sync::Mutex;

use stratum_types::{
    CaveatDefinition, NamespaceDefinition, Relationship, RelationshipUpdate,
    RelationshipUpdateOperation, RelationshipsFilter, StoreError, StoreResult,
};

use crate::iterator::RelationshipIterator;
use crate::{
    BulkRelationshipSource, DeletionProgress, QueryOptions, Reader, ReadWriteTransaction,
    RelationshipCounter, ReverseQueryOptions, RevisionedCaveat, RevisionedNamespace,
    SubjectsFilter,
};

use super::errors;
use super::pool::PooledConn;
use super::reader::{decode_relationship, push_relationships_filter, PgReader};
use super::revision::{Revision, Xid, LIVE_DELETED_XID};
use super::tables::*;
use crate::metrics::StoreMetrics;

/// A read-write transaction bound to one pooled connection. Reads go through
/// an embedded transactional [`PgReader`] and therefore observe this
/// transaction's own writes.
pub(crate) struct PgReadWriteTx {
    conn: Arc<Mutex<PooledConn>>,
    xid: Xid,
    reader: PgReader,
    tables: Arc<Tables>,
    metrics: Arc<StoreMetrics>,
}

impl PgReadWriteTx {
    pub(crate) fn new(
        conn: Arc<Mutex<PooledConn>>,
        xid: Xid,
        tables: Arc<Tables>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let reader =
            PgReader::for_transaction(Arc::clone(&conn), Arc::clone(&tables), Arc::clone(&metrics));
        Self { conn, xid, reader, tables, metrics }
    }

    /// `'<xid>'::text::xid8` bind value for this transaction.
    fn xid_text(&self) -> String {
        self.xid.0.to_string()
    }

    async fn execute(&self, qb: &mut QueryBuilder<'_, Postgres>) -> StoreResult<u64> {
        let mut guard = self.conn.lock().await;
        let result = qb.build().execute(&mut **guard).await.map_err(errors::wrap)?;
        Ok(result.rows_affected())
    }

    async fn insert_relationship(&self, rel: &Relationship) -> StoreResult<()> {
        // The insertion ordinal is deliberately absent from the column list:
        // the identity default assigns it, so successive inserts carry
        // increasing ordinals and watch can replay them in write order.
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({}) VALUES (",
            self.tables.tuple,
            TUPLE_DATA_COLS.join(", ")
        ));
        let mut fields = qb.separated(", ");
        fields.push_bind(rel.resource.namespace.clone());
        fields.push_bind(rel.resource.object_id.clone());
        fields.push_bind(rel.resource.relation.clone());
        fields.push_bind(rel.subject.namespace.clone());
        fields.push_bind(rel.subject.object_id.clone());
        fields.push_bind(rel.subject.relation.clone());
        fields.push_bind(rel.caveat.as_ref().map(|c| c.caveat_name.clone()));
        fields.push_bind(
            rel.caveat.as_ref().map(|c| serde_json::Value::Object(c.context.clone())),
        );
        fields.push_bind(rel.description.clone());
        fields.push_bind(rel.comment.clone());
        fields.push_bind(rel.integrity.as_ref().map(|i| i.key_id.clone()));
        fields.push_bind(rel.integrity.as_ref().map(|i| i.hash.clone()));
        fields.push_bind(rel.integrity.as_ref().map(|i| i.hashed_at));
        qb.push(")");

        match self.execute(&mut qb).await {
            Ok(_) => Ok(()),
            // Attach the relationship when the backend's error detail did not
            // carry it.
            Err(StoreError::CreateRelationshipExists { relationship: None }) => {
                Err(StoreError::CreateRelationshipExists {
                    relationship: Some(Box::new(rel.without_integrity())),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Appends the living-row key predicate for one relationship.
    fn push_row_key(qb: &mut QueryBuilder<'_, Postgres>, rel: &Relationship) {
        qb.push(" AND ").push(COL_NAMESPACE).push(" = ").push_bind(rel.resource.namespace.clone());
        qb.push(" AND ")
            .push(COL_OBJECT_ID)
            .push(" = ")
            .push_bind(rel.resource.object_id.clone());
        qb.push(" AND ").push(COL_RELATION).push(" = ").push_bind(rel.resource.relation.clone());
        qb.push(" AND ")
            .push(COL_SUBJECT_NAMESPACE)
            .push(" = ")
            .push_bind(rel.subject.namespace.clone());
        qb.push(" AND ")
            .push(COL_SUBJECT_OBJECT_ID)
            .push(" = ")
            .push_bind(rel.subject.object_id.clone());
        qb.push(" AND ")
            .push(COL_SUBJECT_RELATION)
            .push(" = ")
            .push_bind(rel.subject.relation.clone());
        match &rel.caveat {
            Some(caveat) => {
                qb.push(" AND ")
                    .push(COL_CAVEAT_NAME)
                    .push(" = ")
                    .push_bind(caveat.caveat_name.clone());
            }
            None => {
                qb.push(" AND ").push(COL_CAVEAT_NAME).push(" IS NULL");
            }
        }
    }

    fn push_live_guard(qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" AND ")
            .push(COL_DELETED_XID)
            .push(" = ")
            .push_bind(LIVE_DELETED_XID.to_string())
            .push("::text::xid8");
    }

    /// Deletes the live row addressed by `rel`, returning whether a row was
    /// deleted. Rows created by this same transaction are removed
    /// physically; soft-deleting them would collide with the primary key if
    /// the same key were created again before commit.
    async fn delete_row(&self, rel: &Relationship) -> StoreResult<bool> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("DELETE FROM {} WHERE ", self.tables.tuple));
        qb.push(COL_CREATED_XID).push(" = ").push_bind(self.xid_text()).push("::text::xid8");
        Self::push_row_key(&mut qb, rel);
        Self::push_live_guard(&mut qb);
        if self.execute(&mut qb).await? > 0 {
            return Ok(true);
        }

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} SET {} = ",
            self.tables.tuple, COL_DELETED_XID
        ));
        qb.push_bind(self.xid_text()).push("::text::xid8 WHERE 1 = 1");
        Self::push_row_key(&mut qb, rel);
        Self::push_live_guard(&mut qb);
        Ok(self.execute(&mut qb).await? > 0)
    }

    /// Fetches the live row with the same `(resource, subject, caveat name)`
    /// key as `rel`, if any.
    async fn find_existing(&self, rel: &Relationship) -> StoreResult<Option<Relationship>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            self.tables.tuple_select_list(),
            self.tables.tuple
        ));
        Self::push_row_key(&mut qb, rel);
        Self::push_live_guard(&mut qb);

        let mut guard = self.conn.lock().await;
        let row = qb.build().fetch_optional(&mut **guard).await.map_err(errors::wrap)?;
        drop(guard);
        row.as_ref().map(decode_relationship).transpose()
    }

    async fn soft_delete_definition(&self, table: &str, name: &str) -> StoreResult<bool> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("UPDATE {table} SET {} = ", COL_DELETED_XID));
        qb.push_bind(self.xid_text()).push("::text::xid8");
        qb.push(" WHERE ").push(COL_NAME).push(" = ").push_bind(name.to_string());
        Self::push_live_guard(&mut qb);
        Ok(self.execute(&mut qb).await? > 0)
    }

    async fn insert_definition(&self, table: &str, body_col: &str, name: &str, body: String) -> StoreResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {table} ({COL_NAME}, {body_col}) VALUES ("
        ));
        let mut fields = qb.separated(", ");
        fields.push_bind(name.to_string());
        fields.push_bind(body);
        qb.push(")");
        self.execute(&mut qb).await?;
        Ok(())
    }
}

#[async_trait]
impl Reader for PgReadWriteTx {
    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        options: QueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        self.reader.query_relationships(filter, options).await
    }

    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        options: ReverseQueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        self.reader.reverse_query_relationships(subjects_filter, options).await
    }

    async fn read_namespace(&self, name: &str) -> StoreResult<RevisionedNamespace> {
        self.reader.read_namespace(name).await
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<RevisionedNamespace>> {
        self.reader.list_namespaces().await
    }

    async fn lookup_namespaces(&self, names: &[String]) -> StoreResult<Vec<RevisionedNamespace>> {
        self.reader.lookup_namespaces(names).await
    }

    async fn read_caveat(&self, name: &str) -> StoreResult<RevisionedCaveat> {
        self.reader.read_caveat(name).await
    }

    async fn list_caveats(&self) -> StoreResult<Vec<RevisionedCaveat>> {
        self.reader.list_caveats().await
    }

    async fn lookup_caveats(&self, names: &[String]) -> StoreResult<Vec<RevisionedCaveat>> {
        self.reader.lookup_caveats(names).await
    }

    async fn count_relationships(&self, counter_name: &str) -> StoreResult<u64> {
        self.reader.count_relationships(counter_name).await
    }

    async fn lookup_counters(&self) -> StoreResult<Vec<RelationshipCounter>> {
        self.reader.lookup_counters().await
    }
}

#[async_trait]
impl ReadWriteTransaction for PgReadWriteTx {
    async fn write_relationships(&self, mutations: Vec<RelationshipUpdate>) -> StoreResult<()> {
        for mutation in &mutations {
            let rel = &mutation.relationship;
            match mutation.operation {
                RelationshipUpdateOperation::Create => {
                    self.insert_relationship(rel).await?;
                }
                RelationshipUpdateOperation::Touch => {
                    match self.find_existing(rel).await? {
                        // Identical live row: touching again is a no-op, so
                        // repeated touches leave exactly one row.
                        Some(existing) if existing.eq_ignoring_integrity(rel) => continue,
                        Some(_) => {
                            self.delete_row(rel).await?;
                            self.insert_relationship(rel).await?;
                        }
                        None => {
                            self.insert_relationship(rel).await?;
                        }
                    }
                }
                RelationshipUpdateOperation::Delete => {
                    // Deleting an absent row is not an error.
                    self.delete_row(rel).await?;
                }
            }
        }
        Ok(())
    }

    async fn delete_relationships(
        &self,
        filter: &RelationshipsFilter,
        limit: Option<u64>,
    ) -> StoreResult<DeletionProgress> {
        if filter.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: "refusing to delete with an empty filter; every row would match"
                    .to_string(),
            });
        }

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} SET {} = ",
            self.tables.tuple, COL_DELETED_XID
        ));
        qb.push_bind(self.xid_text()).push("::text::xid8");

        if let Some(limit) = limit {
            // Bound the delete through a keyed subquery so the limit applies
            // to rows, not to pages.
            qb.push(" WHERE (");
            qb.push(TUPLE_KEY_COLS.join(", "));
            qb.push(format!(", {COL_CREATED_XID}) IN (SELECT "));
            qb.push(TUPLE_KEY_COLS.join(", "));
            qb.push(format!(", {COL_CREATED_XID} FROM {} WHERE 1 = 1", self.tables.tuple));
            push_relationships_filter(&mut qb, filter);
            Self::push_live_guard(&mut qb);
            qb.push(" LIMIT ").push_bind(limit as i64).push(")");
        } else {
            qb.push(" WHERE 1 = 1");
            push_relationships_filter(&mut qb, filter);
            Self::push_live_guard(&mut qb);
        }

        let deleted = self.execute(&mut qb).await?;

        let more_remaining = match limit {
            Some(limit) if deleted >= limit => {
                let mut probe = QueryBuilder::<Postgres>::new(format!(
                    "SELECT 1 FROM {} WHERE 1 = 1",
                    self.tables.tuple
                ));
                push_relationships_filter(&mut probe, filter);
                Self::push_live_guard(&mut probe);
                probe.push(" LIMIT 1");

                let mut guard = self.conn.lock().await;
                probe
                    .build()
                    .fetch_optional(&mut **guard)
                    .await
                    .map_err(errors::wrap)?
                    .is_some()
            }
            _ => false,
        };

        Ok(DeletionProgress { deleted, more_remaining })
    }

    async fn bulk_load(&self, source: &mut dyn BulkRelationshipSource) -> StoreResult<u64> {
        // As with single inserts, the COPY column list omits the insertion
        // ordinal; the identity default numbers rows in stream order.
        let statement = format!(
            "COPY {} ({}) FROM STDIN",
            self.tables.tuple,
            TUPLE_DATA_COLS.join(", ")
        );

        let mut guard = self.conn.lock().await;
        let mut copy = guard.copy_in_raw(&statement).await.map_err(errors::wrap)?;

        let mut buffer = String::new();
        loop {
            match source.next().await {
                Ok(Some(rel)) => {
                    buffer.clear();
                    encode_copy_row(&mut buffer, &rel)?;
                    copy.send(buffer.as_bytes()).await.map_err(errors::wrap)?;
                }
                Ok(None) => break,
                // The caller observes the source's error verbatim.
                Err(err) => {
                    let _ = copy.abort("bulk source failed").await;
                    return Err(err);
                }
            }
        }

        let loaded = copy.finish().await.map_err(errors::wrap)?;
        self.metrics.record_bulk_loaded(loaded);
        Ok(loaded)
    }

    async fn write_namespaces(&self, definitions: Vec<NamespaceDefinition>) -> StoreResult<()> {
        for definition in &definitions {
            let body = serde_json::to_string(definition)?;
            let table = self.tables.namespace.clone();
            self.soft_delete_definition(&table, &definition.name).await?;
            self.insert_definition(&table, COL_CONFIG, &definition.name, body).await?;
        }
        Ok(())
    }

    async fn delete_namespaces(&self, names: &[String]) -> StoreResult<()> {
        for name in names {
            let table = self.tables.namespace.clone();
            if !self.soft_delete_definition(&table, name).await? {
                return Err(StoreError::NamespaceNotFound { name: name.clone() });
            }

            // Soft-delete every live relationship under the namespace.
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "UPDATE {} SET {} = ",
                self.tables.tuple, COL_DELETED_XID
            ));
            qb.push_bind(self.xid_text()).push("::text::xid8");
            qb.push(" WHERE ").push(COL_NAMESPACE).push(" = ").push_bind(name.clone());
            Self::push_live_guard(&mut qb);
            self.execute(&mut qb).await?;
        }
        Ok(())
    }

    async fn write_caveats(&self, definitions: Vec<CaveatDefinition>) -> StoreResult<()> {
        for definition in &definitions {
            let body = serde_json::to_string(definition)?;
            let table = self.tables.caveat.clone();
            self.soft_delete_definition(&table, &definition.name).await?;
            self.insert_definition(&table, COL_DEFINITION, &definition.name, body).await?;
        }
        Ok(())
    }

    async fn delete_caveats(&self, names: &[String]) -> StoreResult<()> {
        for name in names {
            let table = self.tables.caveat.clone();
            if !self.soft_delete_definition(&table, name).await? {
                return Err(StoreError::CaveatNotFound { name: name.clone() });
            }
        }
        Ok(())
    }

    async fn register_counter(
        &self,
        name: &str,
        filter: &RelationshipsFilter,
    ) -> StoreResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({COL_NAME}, {COL_COUNTER_FILTER}, {COL_COUNTER_COUNT}) VALUES (",
            self.tables.relationship_counter
        ));
        let mut fields = qb.separated(", ");
        fields.push_bind(name.to_string());
        fields.push_bind(serde_json::to_string(filter)?);
        fields.push_bind(0i64);
        qb.push(")");

        match self.execute(&mut qb).await {
            Ok(_) => Ok(()),
            Err(err) if errors::is_unique_violation(&err) => {
                Err(StoreError::CounterAlreadyRegistered { name: name.to_string() })
            }
            Err(err) => Err(err),
        }
    }

    async fn unregister_counter(&self, name: &str) -> StoreResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "DELETE FROM {} WHERE {COL_NAME} = ",
            self.tables.relationship_counter
        ));
        qb.push_bind(name.to_string());
        if self.execute(&mut qb).await? == 0 {
            return Err(StoreError::CounterNotRegistered { name: name.to_string() });
        }
        Ok(())
    }

    async fn store_counter_value(
        &self,
        name: &str,
        count: u64,
        computed_at: &Revision,
    ) -> StoreResult<()> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} SET {COL_COUNTER_COUNT} = ",
            self.tables.relationship_counter
        ));
        qb.push_bind(count as i64);
        qb.push(format!(", {COL_COUNTER_SNAPSHOT} = ")).push_bind(computed_at.to_string());
        qb.push(format!(" WHERE {COL_NAME} = ")).push_bind(name.to_string());
        if self.execute(&mut qb).await? == 0 {
            return Err(StoreError::CounterNotRegistered { name: name.to_string() });
        }
        Ok(())
    }
}

// ============================================================================
// COPY Encoding
// ============================================================================

/// Appends one row in PostgreSQL's COPY text format: tab-separated values,
/// newline-terminated, `\N` for NULL.
fn encode_copy_row(out: &mut String, rel: &Relationship) -> StoreResult<()> {
    push_copy_text(out, &rel.resource.namespace);
    out.push('\t');
    push_copy_text(out, &rel.resource.object_id);
    out.push('\t');
    push_copy_text(out, &rel.resource.relation);
    out.push('\t');
    push_copy_text(out, &rel.subject.namespace);
    out.push('\t');
    push_copy_text(out, &rel.subject.object_id);
    out.push('\t');
    push_copy_text(out, &rel.subject.relation);
    out.push('\t');

    match &rel.caveat {
        Some(caveat) => {
            push_copy_text(out, &caveat.caveat_name);
            out.push('\t');
            let context = serde_json::to_string(&caveat.context)?;
            push_copy_text(out, &context);
        }
        None => out.push_str("\\N\t\\N"),
    }
    out.push('\t');

    push_copy_optional(out, rel.description.as_deref());
    out.push('\t');
    push_copy_optional(out, rel.comment.as_deref());
    out.push('\t');

    match &rel.integrity {
        Some(integrity) => {
            push_copy_text(out, &integrity.key_id);
            out.push('\t');
            push_copy_bytea(out, &integrity.hash);
            out.push('\t');
            push_copy_timestamp(out, &integrity.hashed_at);
        }
        None => out.push_str("\\N\t\\N\t\\N"),
    }
    out.push('\n');
    Ok(())
}

fn push_copy_optional(out: &mut String, value: Option<&str>) {
    match value {
        Some(value) => push_copy_text(out, value),
        None => out.push_str("\\N"),
    }
}

fn push_copy_text(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn push_copy_bytea(out: &mut String, bytes: &[u8]) {
    // bytea hex input, with the backslash doubled for the COPY text layer.
    out.push_str("\\\\x");
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
}

fn push_copy_timestamp(out: &mut String, at: &DateTime<Utc>) {
    let _ = write!(out, "{}", at.format("%Y-%m-%d %H:%M:%S%.6f+00"));
}

#[cfg(test)]
mod tests {
    use stratum_types::{ContextualizedCaveat, RelationshipIntegrity};

    use super::*;

    fn rel(s: &str) -> Relationship {
        s.parse().unwrap()
    }

    #[test]
    fn test_copy_row_plain() {
        let mut out = String::new();
        encode_copy_row(&mut out, &rel("document:readme#viewer@user:alice")).unwrap();
        assert_eq!(
            out,
            "document\treadme\tviewer\tuser\talice\t...\t\\N\t\\N\t\\N\t\\N\t\\N\t\\N\t\\N\n"
        );
    }

    #[test]
    fn test_copy_row_escapes_specials() {
        let mut relationship = rel("document:readme#viewer@user:alice");
        relationship.resource.object_id = "tab\there\nand\\slash".to_string();
        let mut out = String::new();
        encode_copy_row(&mut out, &relationship).unwrap();
        assert!(out.contains("tab\\there\\nand\\\\slash"));
    }

    #[test]
    fn test_copy_row_caveat_and_integrity() {
        let mut relationship = rel("document:readme#viewer@user:alice").with_caveat(
            ContextualizedCaveat {
                caveat_name: "on_weekdays".to_string(),
                context: serde_json::from_str(r#"{"tz": "UTC"}"#).unwrap(),
            },
        );
        relationship.integrity = Some(RelationshipIntegrity {
            key_id: "k1".to_string(),
            hash: vec![0x01, 0xab],
            hashed_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        });

        let mut out = String::new();
        encode_copy_row(&mut out, &relationship).unwrap();
        assert!(out.contains("on_weekdays\t{\"tz\":\"UTC\"}"));
        assert!(out.contains("k1\t\\\\x01ab\t2024-05-01 12:00:00.000000+00"));
    }

    #[test]
    fn test_copy_row_field_count() {
        let mut out = String::new();
        encode_copy_row(&mut out, &rel("a:b#c@d:e")).unwrap();
        let fields: Vec<&str> = out.trim_end_matches('\n').split('\t').collect();
        assert_eq!(fields.len(), TUPLE_DATA_COLS.len());
    }
}
