//! The relationship integrity proxy: HMAC-signs every relationship on its
//! way into the datastore and verifies (then strips) the signature on every
//! relationship on its way out, including watch events.
//!
//! One primary key signs new writes; previously rotated-out keys verify old
//! data until it is rewritten, each bounded by its `expired_at` time. The
//! stored hash is `0x01 || HMAC_SHA256(key, canonical_bytes)[0..16]`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use stratum_types::{
    CaveatDefinition, ChangeOperation, NamespaceDefinition, Relationship, RelationshipIntegrity,
    RelationshipUpdate, RelationshipsFilter, StoreError, StoreResult, SubjectsFilter,
};

use crate::iterator::RelationshipIterator;
use crate::postgres::revision::Revision;
use crate::{
    BulkRelationshipSource, Datastore, DeletionProgress, Features, QueryOptions, Reader,
    ReadWriteTransaction, ReadyState, RelationshipCounter, ReverseQueryOptions, RevisionedCaveat,
    RevisionedNamespace, RwtOptions, SharedDatastore, Stats, TxFn, WatchOptions, WatchReceivers,
};

type HmacSha256 = Hmac<Sha256>;

/// The version prefix for stored hashes.
const VERSION_BYTE: u8 = 0x01;
/// Bytes of MAC output kept after truncation.
const HASH_LENGTH: usize = 16;

/// Configuration for one signing key.
#[derive(Clone)]
pub struct KeyConfig {
    /// Unique identifier, stored alongside every hash the key produces.
    pub id: String,
    /// Raw key material.
    pub bytes: Vec<u8>,
    /// When the key stopped signing new data, if it has been rotated out.
    pub expired_at: Option<DateTime<Utc>>,
}

impl KeyConfig {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { id: id.into(), bytes, expired_at: None }
    }

    /// Loads key material from a file.
    pub fn from_file(id: impl Into<String>, path: impl AsRef<Path>) -> StoreResult<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(|err| StoreError::InvalidArgument {
            message: format!("unable to read key file: {err}"),
        })?;
        Ok(Self::new(id, bytes))
    }

    pub fn expired_at(mut self, at: DateTime<Utc>) -> Self {
        self.expired_at = Some(at);
        self
    }
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in debug output.
        f.debug_struct("KeyConfig")
            .field("id", &self.id)
            .field("expired_at", &self.expired_at)
            .finish_non_exhaustive()
    }
}

struct IntegrityKey {
    id: String,
    expired_at: Option<DateTime<Utc>>,
    material: Vec<u8>,
}

impl IntegrityKey {
    fn compute(&self, canonical: &[u8]) -> StoreResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.material).map_err(|_| {
            StoreError::IntegrityFailure { reason: "invalid key material".to_string() }
        })?;
        mac.update(canonical);
        let digest = mac.finalize().into_bytes();

        let mut hash = Vec::with_capacity(HASH_LENGTH + 1);
        hash.push(VERSION_BYTE);
        hash.extend_from_slice(&digest[..HASH_LENGTH]);
        Ok(hash)
    }
}

/// Shared, read-mostly key set.
struct KeySet {
    primary: Arc<IntegrityKey>,
    by_id: HashMap<String, Arc<IntegrityKey>>,
}

impl KeySet {
    fn lookup(&self, key_id: &str) -> StoreResult<&Arc<IntegrityKey>> {
        self.by_id.get(key_id).ok_or_else(|| StoreError::IntegrityFailure {
            reason: format!("relationship is signed by unknown key `{key_id}`"),
        })
    }

    fn sign(&self, rel: &Relationship, hashed_at: DateTime<Utc>) -> StoreResult<Relationship> {
        if rel.integrity.is_some() {
            return Err(StoreError::IntegrityFailure {
                reason: format!("relationship `{rel}` already carries integrity data"),
            });
        }
        // Callers expect to be able to reuse their relationships, so the
        // proxy clones before attaching anything.
        let mut signed = rel.clone();
        signed.integrity = Some(RelationshipIntegrity {
            key_id: self.primary.id.clone(),
            hash: self.primary.compute(&canonical_bytes(rel))?,
            hashed_at,
        });
        Ok(signed)
    }

    /// Verifies a relationship read back from storage and strips its
    /// integrity block.
    fn validate_and_strip(&self, rel: &mut Relationship) -> StoreResult<()> {
        let Some(integrity) = rel.integrity.take() else {
            return Err(StoreError::IntegrityFailure {
                reason: format!("relationship `{rel}` is missing required integrity data"),
            });
        };

        if integrity.hash.len() != HASH_LENGTH + 1 || integrity.hash[0] != VERSION_BYTE {
            return Err(StoreError::IntegrityFailure {
                reason: format!("relationship `{rel}` carries malformed integrity data"),
            });
        }

        let key = self.lookup(&integrity.key_id)?;
        if let Some(expired_at) = key.expired_at {
            if integrity.hashed_at > expired_at {
                return Err(StoreError::IntegrityFailure {
                    reason: format!(
                        "relationship `{rel}` was signed by key `{}` after its expiry",
                        key.id
                    ),
                });
            }
        }

        let expected = key.compute(&canonical_bytes(rel))?;
        if expected.ct_eq(&integrity.hash).unwrap_u8() != 1 {
            return Err(StoreError::IntegrityFailure {
                reason: format!("relationship `{rel}` failed integrity verification"),
            });
        }
        Ok(())
    }
}

/// Deterministic byte encoding of a relationship without its integrity
/// block: length-delimited UTF-8 sections, with the caveat context
/// serialized as JSON with lexicographically ordered keys.
fn canonical_bytes(rel: &Relationship) -> Vec<u8> {
    fn put(buf: &mut Vec<u8>, value: &str) {
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    let mut buf = Vec::new();
    put(&mut buf, &rel.resource.namespace);
    put(&mut buf, &rel.resource.object_id);
    put(&mut buf, &rel.resource.relation);
    put(&mut buf, &rel.subject.namespace);
    put(&mut buf, &rel.subject.object_id);
    put(&mut buf, &rel.subject.relation);
    match &rel.caveat {
        Some(caveat) => {
            put(&mut buf, &caveat.caveat_name);
            let context =
                serde_json::to_string(&caveat.context).unwrap_or_else(|_| "{}".to_string());
            put(&mut buf, &context);
        }
        None => {
            put(&mut buf, "");
            put(&mut buf, "");
        }
    }
    put(&mut buf, rel.description.as_deref().unwrap_or(""));
    put(&mut buf, rel.comment.as_deref().unwrap_or(""));
    buf
}

/// A datastore proxy that signs relationships on write and verifies them on
/// read. Forwards everything else to the wrapped datastore.
pub struct RelationshipIntegrityProxy {
    inner: SharedDatastore,
    keys: Arc<KeySet>,
}

impl RelationshipIntegrityProxy {
    /// Builds the proxy over `inner`. `primary` signs all new data; each
    /// expired key verifies data hashed before its `expired_at`.
    pub fn new(
        inner: SharedDatastore,
        primary: KeyConfig,
        expired: Vec<KeyConfig>,
    ) -> StoreResult<Self> {
        let features = inner.offline_features()?;
        if !features.integrity_data.enabled {
            return Err(StoreError::Unsupported {
                feature: "relationship integrity data".to_string(),
            });
        }

        if primary.id.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: "the primary key id cannot be empty".to_string(),
            });
        }
        if primary.bytes.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: "the primary key material cannot be empty".to_string(),
            });
        }
        if primary.expired_at.is_some() {
            return Err(StoreError::InvalidArgument {
                message: "the primary key cannot carry an expiration".to_string(),
            });
        }

        let primary_key = Arc::new(IntegrityKey {
            id: primary.id.clone(),
            expired_at: None,
            material: primary.bytes,
        });
        let mut by_id = HashMap::with_capacity(expired.len() + 1);
        by_id.insert(primary.id, Arc::clone(&primary_key));

        for key in expired {
            if key.id.is_empty() {
                return Err(StoreError::InvalidArgument {
                    message: "expired key ids cannot be empty".to_string(),
                });
            }
            if key.bytes.is_empty() {
                return Err(StoreError::InvalidArgument {
                    message: format!("expired key `{}` has empty material", key.id),
                });
            }
            let Some(expired_at) = key.expired_at else {
                return Err(StoreError::InvalidArgument {
                    message: format!("expired key `{}` is missing its expiration time", key.id),
                });
            };
            if by_id
                .insert(
                    key.id.clone(),
                    Arc::new(IntegrityKey {
                        id: key.id.clone(),
                        expired_at: Some(expired_at),
                        material: key.bytes,
                    }),
                )
                .is_some()
            {
                return Err(StoreError::InvalidArgument {
                    message: format!("duplicate integrity key id `{}`", key.id),
                });
            }
        }

        tracing::debug!(
            primary_key_id = %primary_key.id,
            expired_keys = by_id.len() - 1,
            "created relationship integrity proxy"
        );

        Ok(Self { inner, keys: Arc::new(KeySet { primary: primary_key, by_id }) })
    }
}

#[async_trait]
impl Datastore for RelationshipIntegrityProxy {
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn Reader> {
        Box::new(IntegrityReader {
            inner: self.inner.snapshot_reader(revision),
            keys: Arc::clone(&self.keys),
        })
    }

    async fn read_write_tx(&self, f: &TxFn<'_>, options: RwtOptions) -> StoreResult<Revision> {
        let keys = Arc::clone(&self.keys);
        self.inner
            .read_write_tx(
                &move |tx| {
                    let wrapped: Arc<dyn ReadWriteTransaction> =
                        Arc::new(IntegrityTx { inner: tx, keys: Arc::clone(&keys) });
                    f(wrapped)
                },
                options,
            )
            .await
    }

    async fn head_revision(&self) -> StoreResult<Revision> {
        self.inner.head_revision().await
    }

    async fn optimized_revision(&self) -> StoreResult<Revision> {
        self.inner.optimized_revision().await
    }

    async fn check_revision(&self, revision: &Revision) -> StoreResult<()> {
        self.inner.check_revision(revision).await
    }

    fn revision_from_string(&self, token: &str) -> StoreResult<Revision> {
        self.inner.revision_from_string(token)
    }

    /// Watch events pass through verification: every non-delete change is
    /// validated and stripped before the event is forwarded.
    async fn watch(&self, after: Revision, options: WatchOptions) -> WatchReceivers {
        let (mut inner_changes, mut inner_errors) = self.inner.watch(after, options).await;
        let (changes_tx, changes_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let keys = Arc::clone(&self.keys);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changes = inner_changes.recv() => {
                        let Some(mut changes) = changes else { break };
                        let mut failed = None;
                        for change in &mut changes.relationship_changes {
                            if change.operation != ChangeOperation::Delete {
                                if let Err(err) =
                                    keys.validate_and_strip(&mut change.relationship)
                                {
                                    failed = Some(err);
                                    break;
                                }
                            } else {
                                change.relationship.integrity = None;
                            }
                        }
                        if let Some(err) = failed {
                            let _ = errors_tx.send(err).await;
                            return;
                        }
                        if changes_tx.send(changes).await.is_err() {
                            return;
                        }
                    }
                    err = inner_errors.recv() => {
                        let Some(err) = err else { break };
                        let _ = errors_tx.send(err).await;
                        return;
                    }
                }
            }
        });

        (changes_rx, errors_rx)
    }

    async fn features(&self) -> StoreResult<Features> {
        self.inner.features().await
    }

    fn offline_features(&self) -> StoreResult<Features> {
        self.inner.offline_features()
    }

    async fn statistics(&self) -> StoreResult<Stats> {
        self.inner.statistics().await
    }

    async fn ready_state(&self) -> StoreResult<ReadyState> {
        self.inner.ready_state().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

/// Reader wrapper that verifies and strips every relationship it yields.
struct IntegrityReader {
    inner: Box<dyn Reader>,
    keys: Arc<KeySet>,
}

impl IntegrityReader {
    fn wrap_iterator(&self, iterator: RelationshipIterator) -> RelationshipIterator {
        iterator.map_items(verifier(Arc::clone(&self.keys)))
    }
}

fn verifier(
    keys: Arc<KeySet>,
) -> impl FnMut(StoreResult<Relationship>) -> StoreResult<Relationship> + Send + 'static {
    move |item| {
        let mut rel = item?;
        keys.validate_and_strip(&mut rel)?;
        Ok(rel)
    }
}

#[async_trait]
impl Reader for IntegrityReader {
    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        options: QueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        let iterator = self.inner.query_relationships(filter, options).await?;
        Ok(self.wrap_iterator(iterator))
    }

    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        options: ReverseQueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        let iterator = self.inner.reverse_query_relationships(subjects_filter, options).await?;
        Ok(self.wrap_iterator(iterator))
    }

    async fn read_namespace(&self, name: &str) -> StoreResult<RevisionedNamespace> {
        self.inner.read_namespace(name).await
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<RevisionedNamespace>> {
        self.inner.list_namespaces().await
    }

    async fn lookup_namespaces(&self, names: &[String]) -> StoreResult<Vec<RevisionedNamespace>> {
        self.inner.lookup_namespaces(names).await
    }

    async fn read_caveat(&self, name: &str) -> StoreResult<RevisionedCaveat> {
        self.inner.read_caveat(name).await
    }

    async fn list_caveats(&self) -> StoreResult<Vec<RevisionedCaveat>> {
        self.inner.list_caveats().await
    }

    async fn lookup_caveats(&self, names: &[String]) -> StoreResult<Vec<RevisionedCaveat>> {
        self.inner.lookup_caveats(names).await
    }

    async fn count_relationships(&self, counter_name: &str) -> StoreResult<u64> {
        self.inner.count_relationships(counter_name).await
    }

    async fn lookup_counters(&self) -> StoreResult<Vec<RelationshipCounter>> {
        self.inner.lookup_counters().await
    }
}

/// Transaction wrapper: signs outgoing relationships, verifies reads.
struct IntegrityTx {
    inner: Arc<dyn ReadWriteTransaction>,
    keys: Arc<KeySet>,
}

/// Bulk source adapter that signs each relationship as it is pulled.
struct SigningSource<'a> {
    inner: &'a mut dyn BulkRelationshipSource,
    keys: Arc<KeySet>,
}

#[async_trait]
impl BulkRelationshipSource for SigningSource<'_> {
    async fn next(&mut self) -> StoreResult<Option<Relationship>> {
        match self.inner.next().await? {
            Some(rel) => Ok(Some(self.keys.sign(&rel, Utc::now())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Reader for IntegrityTx {
    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        options: QueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        let iterator = self.inner.query_relationships(filter, options).await?;
        Ok(iterator.map_items(verifier(Arc::clone(&self.keys))))
    }

    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        options: ReverseQueryOptions,
    ) -> StoreResult<RelationshipIterator> {
        let iterator = self.inner.reverse_query_relationships(subjects_filter, options).await?;
        Ok(iterator.map_items(verifier(Arc::clone(&self.keys))))
    }

    async fn read_namespace(&self, name: &str) -> StoreResult<RevisionedNamespace> {
        self.inner.read_namespace(name).await
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<RevisionedNamespace>> {
        self.inner.list_namespaces().await
    }

    async fn lookup_namespaces(&self, names: &[String]) -> StoreResult<Vec<RevisionedNamespace>> {
        self.inner.lookup_namespaces(names).await
    }

    async fn read_caveat(&self, name: &str) -> StoreResult<RevisionedCaveat> {
        self.inner.read_caveat(name).await
    }

    async fn list_caveats(&self) -> StoreResult<Vec<RevisionedCaveat>> {
        self.inner.list_caveats().await
    }

    async fn lookup_caveats(&self, names: &[String]) -> StoreResult<Vec<RevisionedCaveat>> {
        self.inner.lookup_caveats(names).await
    }

    async fn count_relationships(&self, counter_name: &str) -> StoreResult<u64> {
        self.inner.count_relationships(counter_name).await
    }

    async fn lookup_counters(&self) -> StoreResult<Vec<RelationshipCounter>> {
        self.inner.lookup_counters().await
    }
}

#[async_trait]
impl ReadWriteTransaction for IntegrityTx {
    async fn write_relationships(&self, mutations: Vec<RelationshipUpdate>) -> StoreResult<()> {
        let hashed_at = Utc::now();
        let mut signed = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            signed.push(RelationshipUpdate {
                operation: mutation.operation,
                relationship: self.keys.sign(&mutation.relationship, hashed_at)?,
            });
        }
        self.inner.write_relationships(signed).await
    }

    async fn delete_relationships(
        &self,
        filter: &RelationshipsFilter,
        limit: Option<u64>,
    ) -> StoreResult<DeletionProgress> {
        self.inner.delete_relationships(filter, limit).await
    }

    async fn bulk_load(&self, source: &mut dyn BulkRelationshipSource) -> StoreResult<u64> {
        let mut signing = SigningSource { inner: source, keys: Arc::clone(&self.keys) };
        self.inner.bulk_load(&mut signing).await
    }

    async fn write_namespaces(&self, definitions: Vec<NamespaceDefinition>) -> StoreResult<()> {
        self.inner.write_namespaces(definitions).await
    }

    async fn delete_namespaces(&self, names: &[String]) -> StoreResult<()> {
        self.inner.delete_namespaces(names).await
    }

    async fn write_caveats(&self, definitions: Vec<CaveatDefinition>) -> StoreResult<()> {
        self.inner.write_caveats(definitions).await
    }

    async fn delete_caveats(&self, names: &[String]) -> StoreResult<()> {
        self.inner.delete_caveats(names).await
    }

    async fn register_counter(
        &self,
        name: &str,
        filter: &RelationshipsFilter,
    ) -> StoreResult<()> {
        self.inner.register_counter(name, filter).await
    }

    async fn unregister_counter(&self, name: &str) -> StoreResult<()> {
        self.inner.unregister_counter(name).await
    }

    async fn store_counter_value(
        &self,
        name: &str,
        count: u64,
        computed_at: &Revision,
    ) -> StoreResult<()> {
        self.inner.store_counter_value(name, count, computed_at).await
    }
}
