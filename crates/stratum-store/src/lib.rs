//! # Stratum Store - Revisioned Relationship Storage
//!
//! The datastore abstraction and its PostgreSQL implementation: revisioned
//! relationship storage with MVCC snapshot reads, serializable write
//! transactions, change watching, garbage collection, and an optional
//! integrity proxy that HMAC-signs every relationship.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use stratum_types::{
    CaveatDefinition, NamespaceDefinition, Relationship, RelationshipChange, RelationshipUpdate,
    RelationshipsFilter, SchemaChange, StoreError, StoreResult, SubjectsFilter,
};

pub mod iterator;
pub mod metrics;
pub mod postgres;
pub mod proxy;
pub mod schema;

pub use iterator::{Cursor, RelationshipIterator};
pub use postgres::options::{
    CredentialsProvider, PgDatastoreOptions, PoolOptions, StaticCredentials, TableNames,
};
pub use postgres::revision::{PgSnapshot, Revision, SnapshotRelation, Xid, LIVE_DELETED_XID};
pub use postgres::PgDatastore;
pub use proxy::integrity::{KeyConfig, RelationshipIntegrityProxy};
pub use proxy::readonly::ReadOnlyDatastore;
pub use schema::{
    apply_schema_changes, validate_schema_changes, AppliedSchemaChanges, CompiledSchema,
    ValidatedSchemaChanges,
};

// ============================================================================
// Query Options
// ============================================================================

/// Result ordering for relationship queries. Cursors require an explicit
/// order so that "strictly after" is well-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// `(resource namespace, object id, relation, subject)`.
    ByResource,
    /// `(subject namespace, object id, relation, resource)`.
    BySubject,
}

/// Options for a forward relationship query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<u64>,
    /// Requested ordering. `None` leaves the order to the backend plan,
    /// which is still deterministic for a given plan but carries no cursor.
    pub sort: Option<SortOrder>,
    /// Resume strictly after the given cursor position.
    pub after: Option<Cursor>,
}

/// Options for a reverse (subject-first) relationship query.
#[derive(Debug, Clone, Default)]
pub struct ReverseQueryOptions {
    pub limit: Option<u64>,
    pub sort: Option<SortOrder>,
    pub after: Option<Cursor>,
    /// Restrict results to one `(resource type, relation)` pair.
    pub resource_relation: Option<(String, String)>,
}

// ============================================================================
// Revisioned Records
// ============================================================================

/// A namespace definition together with the revision it was last written at.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionedNamespace {
    pub definition: NamespaceDefinition,
    pub last_written: Revision,
}

/// A caveat definition together with the revision it was last written at.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionedCaveat {
    pub definition: CaveatDefinition,
    pub last_written: Revision,
}

/// A registered relationship counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipCounter {
    pub name: String,
    pub filter: RelationshipsFilter,
    /// The most recently stored count.
    pub count: u64,
    /// The revision at which `count` was computed, if it ever was.
    pub computed_at: Option<Revision>,
}

// ============================================================================
// Watch
// ============================================================================

/// Options controlling a watch stream.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub emit_relationship_changes: bool,
    pub emit_schema_changes: bool,
    /// Emit heartbeat revisions carrying the current head even when nothing
    /// changed.
    pub emit_checkpoints: bool,
    /// Override for the datastore's configured buffer length.
    pub buffer_length: Option<u16>,
    /// Override for the datastore's configured buffer write timeout.
    pub buffer_write_timeout: Option<Duration>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            emit_relationship_changes: true,
            emit_schema_changes: false,
            emit_checkpoints: false,
            buffer_length: None,
            buffer_write_timeout: None,
        }
    }
}

/// All changes committed by a single transaction, delivered in commit order.
#[derive(Debug, Clone, Default)]
pub struct RevisionChanges {
    pub revision: Option<Revision>,
    pub relationship_changes: Vec<RelationshipChange>,
    pub schema_changes: Vec<SchemaChange>,
    pub is_checkpoint: bool,
}

/// The receiving half of a watch: change events and a terminal error stream,
/// each closing when the watch ends.
pub type WatchReceivers = (mpsc::Receiver<RevisionChanges>, mpsc::Receiver<StoreError>);

// ============================================================================
// Datastore Metadata
// ============================================================================

/// Availability of an optional datastore feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub enabled: bool,
    pub reason: Option<String>,
}

impl Feature {
    pub fn enabled() -> Self {
        Self { enabled: true, reason: None }
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self { enabled: false, reason: Some(reason.into()) }
    }
}

/// The feature set of a datastore instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    /// Change tailing via [`Datastore::watch`].
    pub watch: Feature,
    /// Storage of per-relationship integrity blocks.
    pub integrity_data: Feature,
}

/// Whether the datastore is ready to serve traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyState {
    pub is_ready: bool,
    pub message: Option<String>,
}

impl ReadyState {
    pub fn ready() -> Self {
        Self { is_ready: true, message: None }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self { is_ready: false, message: Some(message.into()) }
    }
}

/// Coarse statistics about the stored data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Estimated count of live relationships (from planner statistics, not
    /// an exact scan).
    pub estimated_relationship_count: u64,
    /// Names of the currently defined object types.
    pub object_definition_names: Vec<String>,
}

// ============================================================================
// Transactions
// ============================================================================

/// Options for a read-write transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RwtOptions {
    /// Disable serialization-conflict retries for this transaction.
    pub disable_retries: bool,
    /// Outer deadline, re-checked before every retry attempt.
    pub deadline: Option<Instant>,
}

/// The future returned by a transaction closure.
pub type TxFuture<'f> = Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'f>>;

/// A user transaction closure. It may be invoked multiple times when the
/// engine retries serialization conflicts, so it must be `Fn`, not `FnOnce`.
/// The handle is shared; it is only valid until the closure's future
/// resolves, after which the engine commits or rolls back.
pub type TxFn<'f> = dyn Fn(Arc<dyn ReadWriteTransaction>) -> TxFuture<'f> + Send + Sync + 'f;

/// Progress report from a filtered bulk delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionProgress {
    pub deleted: u64,
    /// True when the limit was reached and matching rows remain.
    pub more_remaining: bool,
}

/// A pull-based source of relationships for [`ReadWriteTransaction::bulk_load`].
///
/// `next` is only ever called sequentially. Returning `Ok(None)` ends the
/// stream cleanly; returning an error aborts the load and is surfaced to the
/// caller verbatim.
#[async_trait]
pub trait BulkRelationshipSource: Send {
    async fn next(&mut self) -> StoreResult<Option<Relationship>>;
}

// ============================================================================
// Core Traits
// ============================================================================

/// Read operations available at a fixed revision.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Queries relationships matching the filter.
    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        options: QueryOptions,
    ) -> StoreResult<RelationshipIterator>;

    /// Queries relationships starting from the subject side.
    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        options: ReverseQueryOptions,
    ) -> StoreResult<RelationshipIterator>;

    async fn read_namespace(&self, name: &str) -> StoreResult<RevisionedNamespace>;

    async fn list_namespaces(&self) -> StoreResult<Vec<RevisionedNamespace>>;

    async fn lookup_namespaces(&self, names: &[String]) -> StoreResult<Vec<RevisionedNamespace>>;

    async fn read_caveat(&self, name: &str) -> StoreResult<RevisionedCaveat>;

    async fn list_caveats(&self) -> StoreResult<Vec<RevisionedCaveat>>;

    async fn lookup_caveats(&self, names: &[String]) -> StoreResult<Vec<RevisionedCaveat>>;

    /// Runs the registered counter's filter and returns the live count.
    async fn count_relationships(&self, counter_name: &str) -> StoreResult<u64>;

    async fn lookup_counters(&self) -> StoreResult<Vec<RelationshipCounter>>;
}

/// Write operations available inside a read-write transaction. Reads through
/// the same handle observe the transaction's own uncommitted writes.
#[async_trait]
pub trait ReadWriteTransaction: Reader {
    /// Applies the ordered mutation list.
    async fn write_relationships(&self, mutations: Vec<RelationshipUpdate>) -> StoreResult<()>;

    /// Deletes all relationships matching the filter, up to `limit`.
    async fn delete_relationships(
        &self,
        filter: &RelationshipsFilter,
        limit: Option<u64>,
    ) -> StoreResult<DeletionProgress>;

    /// Streams the source into the backend's bulk append path. Returns the
    /// number of relationships loaded.
    async fn bulk_load(&self, source: &mut dyn BulkRelationshipSource) -> StoreResult<u64>;

    async fn write_namespaces(&self, definitions: Vec<NamespaceDefinition>) -> StoreResult<()>;

    /// Soft-deletes the named namespaces and every live relationship
    /// referencing them.
    async fn delete_namespaces(&self, names: &[String]) -> StoreResult<()>;

    async fn write_caveats(&self, definitions: Vec<CaveatDefinition>) -> StoreResult<()>;

    async fn delete_caveats(&self, names: &[String]) -> StoreResult<()>;

    async fn register_counter(
        &self,
        name: &str,
        filter: &RelationshipsFilter,
    ) -> StoreResult<()>;

    async fn unregister_counter(&self, name: &str) -> StoreResult<()>;

    /// Records a computed count for the named counter at the given revision.
    async fn store_counter_value(
        &self,
        name: &str,
        count: u64,
        computed_at: &Revision,
    ) -> StoreResult<()>;
}

/// A revisioned relationship datastore.
///
/// Proxies (integrity, read-only) implement this same trait and wrap another
/// implementation, forwarding everything they do not override.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// A reader pinned to the given revision.
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn Reader>;

    /// Runs `f` inside a serializable read-write transaction, retrying
    /// serialization conflicts up to the configured budget, and returns the
    /// committed revision.
    async fn read_write_tx(&self, f: &TxFn<'_>, options: RwtOptions) -> StoreResult<Revision>;

    /// The most recent committed revision.
    async fn head_revision(&self) -> StoreResult<Revision>;

    /// A quantized recent revision shared across concurrent readers.
    async fn optimized_revision(&self) -> StoreResult<Revision>;

    /// Validates that the revision can still be serviced.
    async fn check_revision(&self, revision: &Revision) -> StoreResult<()>;

    /// Parses a revision token previously produced by this datastore.
    fn revision_from_string(&self, token: &str) -> StoreResult<Revision>;

    /// Tails committed transactions after `after`, delivering per-revision
    /// change sets in commit order. Errors (including `Unsupported` and
    /// `BufferOverflow`) arrive on the second receiver; both close when the
    /// watch terminates.
    async fn watch(&self, after: Revision, options: WatchOptions) -> WatchReceivers;

    /// Feature availability, possibly probing the backend.
    async fn features(&self) -> StoreResult<Features>;

    /// Feature availability decidable without touching the backend.
    fn offline_features(&self) -> StoreResult<Features>;

    async fn statistics(&self) -> StoreResult<Stats>;

    async fn ready_state(&self) -> StoreResult<ReadyState>;

    /// Cancels background tasks, awaits them, and releases the pools.
    async fn close(&self) -> StoreResult<()>;
}

/// Convenience alias used wherever a shared datastore handle is passed around.
pub type SharedDatastore = Arc<dyn Datastore>;
