//! A proxy that rejects every write, for read-only deployments.

use async_trait::async_trait;

use stratum_types::{StoreError, StoreResult};

use crate::postgres::revision::Revision;
use crate::{
    Datastore, Features, Reader, ReadyState, RwtOptions, SharedDatastore, Stats, TxFn,
    WatchOptions, WatchReceivers,
};

/// Wraps a datastore and fails every [`Datastore::read_write_tx`] with
/// [`StoreError::ReadOnly`]. Reads, watches, and metadata pass through.
pub struct ReadOnlyDatastore {
    inner: SharedDatastore,
}

impl ReadOnlyDatastore {
    pub fn new(inner: SharedDatastore) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Datastore for ReadOnlyDatastore {
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn Reader> {
        self.inner.snapshot_reader(revision)
    }

    async fn read_write_tx(&self, _f: &TxFn<'_>, _options: RwtOptions) -> StoreResult<Revision> {
        Err(StoreError::ReadOnly)
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

    async fn watch(&self, after: Revision, options: WatchOptions) -> WatchReceivers {
        self.inner.watch(after, options).await
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
