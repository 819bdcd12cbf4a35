//! Table and column names, and the SQL fragments shared by the reader,
//! writer, garbage collector, and watch pipeline.

use super::options::TableNames;

pub(crate) const COL_XID: &str = "xid";
pub(crate) const COL_SNAPSHOT: &str = "snapshot";
pub(crate) const COL_TIMESTAMP: &str = "timestamp";

pub(crate) const COL_NAMESPACE: &str = "namespace";
pub(crate) const COL_OBJECT_ID: &str = "object_id";
pub(crate) const COL_RELATION: &str = "relation";
pub(crate) const COL_SUBJECT_NAMESPACE: &str = "subject_namespace";
pub(crate) const COL_SUBJECT_OBJECT_ID: &str = "subject_object_id";
pub(crate) const COL_SUBJECT_RELATION: &str = "subject_relation";
pub(crate) const COL_ORDINAL: &str = "ordinal";
pub(crate) const COL_CAVEAT_NAME: &str = "caveat_name";
pub(crate) const COL_CAVEAT_CONTEXT: &str = "caveat_context";
pub(crate) const COL_DESCRIPTION: &str = "description";
pub(crate) const COL_COMMENT: &str = "comment";
pub(crate) const COL_INTEGRITY_KEY_ID: &str = "integrity_key_id";
pub(crate) const COL_INTEGRITY_HASH: &str = "integrity_hash";
pub(crate) const COL_INTEGRITY_HASHED_AT: &str = "integrity_hashed_at";
pub(crate) const COL_CREATED_XID: &str = "created_xid";
pub(crate) const COL_DELETED_XID: &str = "deleted_xid";

pub(crate) const COL_NAME: &str = "name";
pub(crate) const COL_CONFIG: &str = "serialized_config";
pub(crate) const COL_DEFINITION: &str = "definition";

pub(crate) const COL_COUNTER_FILTER: &str = "serialized_filter";
pub(crate) const COL_COUNTER_COUNT: &str = "current_count";
pub(crate) const COL_COUNTER_SNAPSHOT: &str = "updated_revision_snapshot";

/// The data columns of the tuple table, in the order the reader selects and
/// the bulk loader copies them.
pub(crate) const TUPLE_DATA_COLS: &[&str] = &[
    COL_NAMESPACE,
    COL_OBJECT_ID,
    COL_RELATION,
    COL_SUBJECT_NAMESPACE,
    COL_SUBJECT_OBJECT_ID,
    COL_SUBJECT_RELATION,
    COL_CAVEAT_NAME,
    COL_CAVEAT_CONTEXT,
    COL_DESCRIPTION,
    COL_COMMENT,
    COL_INTEGRITY_KEY_ID,
    COL_INTEGRITY_HASH,
    COL_INTEGRITY_HASHED_AT,
];

/// The columns identifying one living row.
pub(crate) const TUPLE_KEY_COLS: &[&str] = &[
    COL_NAMESPACE,
    COL_OBJECT_ID,
    COL_RELATION,
    COL_SUBJECT_NAMESPACE,
    COL_SUBJECT_OBJECT_ID,
    COL_SUBJECT_RELATION,
];

/// Quotes an identifier for safe interpolation into SQL text. Table names
/// come from configuration, not user input, but `"transaction"` is a
/// reserved word and must be quoted regardless.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Resolved, quoted table names plus the query fragments derived from them.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    pub transaction: String,
    pub tuple: String,
    pub namespace: String,
    pub caveat: String,
    pub relationship_counter: String,
}

impl Tables {
    pub(crate) fn new(names: &TableNames) -> Self {
        Self {
            transaction: quote_ident(&names.transaction),
            tuple: quote_ident(&names.tuple),
            namespace: quote_ident(&names.namespace),
            caveat: quote_ident(&names.caveat),
            relationship_counter: quote_ident(&names.relationship_counter),
        }
    }

    /// `INSERT INTO "transaction" DEFAULT VALUES RETURNING ..`: allocates a
    /// new xid and captures the snapshot at allocation time.
    pub(crate) fn create_transaction_sql(&self) -> String {
        format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}::text, {}::text",
            self.transaction, COL_XID, COL_SNAPSHOT
        )
    }

    /// The newest allocated transaction, i.e. the head revision.
    pub(crate) fn head_revision_sql(&self) -> String {
        format!(
            "SELECT {}::text, {}::text FROM {} ORDER BY {} DESC LIMIT 1",
            COL_XID, COL_SNAPSHOT, self.transaction, COL_XID
        )
    }

    /// The newest transaction at or before the current quantization window
    /// boundary; `$1` is the window width in seconds.
    pub(crate) fn optimized_revision_sql(&self) -> String {
        format!(
            "SELECT {xid}::text, {snapshot}::text FROM {transaction} \
             WHERE {timestamp} <= to_timestamp(floor(extract(epoch from now()) / $1) * $1) \
             ORDER BY {xid} DESC LIMIT 1",
            xid = COL_XID,
            snapshot = COL_SNAPSHOT,
            transaction = self.transaction,
            timestamp = COL_TIMESTAMP,
        )
    }

    /// Bounds used to validate a revision: the oldest xid still inside the
    /// GC window (`$1`, seconds) and the newest allocated xid.
    pub(crate) fn revision_bounds_sql(&self) -> String {
        format!(
            "SELECT coalesce((SELECT min({xid})::text FROM {transaction} \
                    WHERE {timestamp} >= now() - ($1 * interval '1 second')), \
                    (SELECT max({xid})::text FROM {transaction})), \
                    (SELECT max({xid})::text FROM {transaction})",
            xid = COL_XID,
            transaction = self.transaction,
            timestamp = COL_TIMESTAMP,
        )
    }

    /// The comma-separated select list for relationship rows.
    pub(crate) fn tuple_select_list(&self) -> String {
        TUPLE_DATA_COLS.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("transaction"), "\"transaction\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn test_transaction_allocation_sql() {
        let tables = Tables::new(&TableNames::default());
        assert_eq!(
            tables.create_transaction_sql(),
            "INSERT INTO \"transaction\" DEFAULT VALUES RETURNING xid::text, snapshot::text"
        );
    }

    #[test]
    fn test_renamed_tables_flow_through() {
        let names = TableNames { tuple: "relation_tuple".to_string(), ..Default::default() };
        let tables = Tables::new(&names);
        assert!(tables.tuple.contains("relation_tuple"));
    }
}
