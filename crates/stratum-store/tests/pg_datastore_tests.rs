//! End-to-end tests against a live PostgreSQL instance.
//!
//! These tests require a database reachable through `DATABASE_URL` (for the
//! watch tests the server must run with `track_commit_timestamp=on`), so
//! they are `#[ignore]`d by default:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/stratum_test cargo test -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use stratum_store::{
    BulkRelationshipSource, Datastore, KeyConfig, PgDatastore, PgDatastoreOptions, QueryOptions,
    RelationshipIntegrityProxy, RwtOptions, SharedDatastore, SortOrder, WatchOptions,
};
use stratum_types::{
    Relationship, RelationshipUpdate, RelationshipsFilter, StoreError,
};

fn database_url() -> String {
    std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/stratum_test".to_string())
}

/// A unique namespace per test run, so runs do not interfere.
fn unique_namespace(test: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{test}_{nanos:x}")
}

async fn open_datastore(options: PgDatastoreOptions) -> PgDatastore {
    let ds = PgDatastore::connect(&database_url(), options)
        .await
        .expect("failed to connect to the test database");
    ds.run_migrations().await.expect("failed to migrate the test database");
    ds
}

async fn open_default() -> PgDatastore {
    open_datastore(PgDatastoreOptions::default().with_gc_enabled(false)).await
}

fn rel(s: &str) -> Relationship {
    s.parse().unwrap()
}

async fn write_one(ds: &dyn Datastore, relationship: Relationship) -> stratum_store::Revision {
    ds.read_write_tx(
        &move |tx| {
            let relationship = relationship.clone();
            Box::pin(async move {
                tx.write_relationships(vec![RelationshipUpdate::touch(relationship)]).await
            })
        },
        RwtOptions::default(),
    )
    .await
    .expect("write transaction failed")
}

struct VecSource {
    rels: std::vec::IntoIter<Relationship>,
}

#[async_trait]
impl BulkRelationshipSource for VecSource {
    async fn next(&mut self) -> Result<Option<Relationship>, StoreError> {
        Ok(self.rels.next())
    }
}

// S1: create + read-your-writes.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn create_and_read_your_writes() {
    let ds = open_default().await;
    let ns = unique_namespace("ryw");
    let relationship = rel(&format!("{ns}:readme#viewer@user:alice"));

    let seen_inside = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let revision = {
        let relationship = relationship.clone();
        let seen_inside = Arc::clone(&seen_inside);
        let ns = ns.clone();
        ds.read_write_tx(
            &move |tx| {
                let relationship = relationship.clone();
                let seen_inside = Arc::clone(&seen_inside);
                let ns = ns.clone();
                Box::pin(async move {
                    tx.write_relationships(vec![RelationshipUpdate::create(relationship.clone())])
                        .await?;

                    // The same transaction observes its own write.
                    let found = tx
                        .query_relationships(
                            RelationshipsFilter::for_resource_type(ns),
                            QueryOptions::default(),
                        )
                        .await?
                        .collect_remaining()
                        .await?;
                    seen_inside.store(
                        found.iter().any(|f| f.eq_ignoring_integrity(&relationship)),
                        std::sync::atomic::Ordering::SeqCst,
                    );
                    Ok(())
                })
            },
            RwtOptions::default(),
        )
        .await
        .unwrap()
    };
    assert!(seen_inside.load(std::sync::atomic::Ordering::SeqCst));

    // And so does a snapshot reader at the committed revision.
    let found = ds
        .snapshot_reader(revision)
        .query_relationships(RelationshipsFilter::for_resource_type(ns), QueryOptions::default())
        .await
        .unwrap()
        .collect_remaining()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].eq_ignoring_integrity(&relationship));

    ds.close().await.unwrap();
}

// S2: creating the same relationship twice fails with the offending tuple.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn create_already_exists() {
    let ds = open_default().await;
    let ns = unique_namespace("dup");
    let relationship = rel(&format!("{ns}:a#view@user:b"));

    write_one(&ds, relationship.clone()).await;

    let result = ds
        .read_write_tx(
            &move |tx| {
                let relationship = relationship.clone();
                Box::pin(async move {
                    tx.write_relationships(vec![RelationshipUpdate::create(relationship)]).await
                })
            },
            RwtOptions::default(),
        )
        .await;

    match result {
        Err(StoreError::CreateRelationshipExists { relationship: Some(offending) }) => {
            assert_eq!(offending.resource.namespace, ns);
            assert_eq!(offending.resource.object_id, "a");
            assert_eq!(offending.subject.object_id, "b");
        }
        other => panic!("expected CreateRelationshipExists with payload, got {other:?}"),
    }

    ds.close().await.unwrap();
}

// S3: bulk load, filtered delete, point-in-time counts, and GC staleness.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn bulk_load_delete_and_gc_staleness() {
    let ds = open_datastore(
        PgDatastoreOptions::default()
            .with_gc_enabled(false)
            .with_gc_window(Duration::from_secs(1)),
    )
    .await;
    let ns = unique_namespace("bulk");

    let mut rels = Vec::with_capacity(10_000);
    for i in 0..5_000 {
        rels.push(rel(&format!("{ns}:a{i:05}#viewer@user:u{i:05}")));
    }
    for i in 0..5_000 {
        rels.push(rel(&format!("{ns}:b{i:05}#viewer@user:u{i:05}")));
    }

    let r1 = {
        let rels = rels.clone();
        ds.read_write_tx(
            &move |tx| {
                let rels = rels.clone();
                Box::pin(async move {
                    let mut source = VecSource { rels: rels.into_iter() };
                    let loaded = tx.bulk_load(&mut source).await?;
                    assert_eq!(loaded, 10_000);
                    Ok(())
                })
            },
            RwtOptions::default(),
        )
        .await
        .unwrap()
    };

    // Delete the "a" half by id prefix.
    let r2 = {
        let ns = ns.clone();
        ds.read_write_tx(
            &move |tx| {
                let ns = ns.clone();
                Box::pin(async move {
                    let filter = RelationshipsFilter {
                        resource_type: Some(ns),
                        resource_id_prefix: Some("a".to_string()),
                        ..Default::default()
                    };
                    let progress = tx.delete_relationships(&filter, None).await?;
                    assert_eq!(progress.deleted, 5_000);
                    assert!(!progress.more_remaining);
                    Ok(())
                })
            },
            RwtOptions::default(),
        )
        .await
        .unwrap()
    };

    let count_at = |revision: stratum_store::Revision| {
        let ds = ds.clone();
        let ns = ns.clone();
        async move {
            ds.snapshot_reader(revision)
                .query_relationships(
                    RelationshipsFilter::for_resource_type(ns),
                    QueryOptions::default(),
                )
                .await
                .unwrap()
                .collect_remaining()
                .await
                .unwrap()
                .len()
        }
    };
    assert_eq!(count_at(r1.clone()).await, 10_000);
    assert_eq!(count_at(r2.clone()).await, 5_000);

    // Once the window elapses and GC runs, R1 is no longer serviceable,
    // while a revision inside the window still is.
    tokio::time::sleep(Duration::from_secs(2)).await;
    // A fresh transaction moves the horizon past R1.
    let r3 = write_one(&ds, rel(&format!("{ns}:horizon#viewer@user:tick"))).await;
    ds.collect_garbage().await.unwrap();

    assert!(matches!(
        ds.check_revision(&r1).await,
        Err(StoreError::RevisionStale { .. })
    ));
    ds.check_revision(&r3).await.unwrap();

    ds.close().await.unwrap();
}

// S4: watch delivers per-revision groups in commit order.
#[tokio::test]
#[ignore = "requires PostgreSQL with track_commit_timestamp=on via DATABASE_URL"]
async fn watch_orders_events_by_commit() {
    let ds = open_default().await;
    let ns = unique_namespace("watch");

    let start = ds.head_revision().await.unwrap();
    let (mut changes, mut errors) = ds.watch(start, WatchOptions::default()).await;

    let rels = [
        rel(&format!("{ns}:one#viewer@user:alice")),
        rel(&format!("{ns}:two#viewer@user:bob")),
        rel(&format!("{ns}:three#viewer@user:carol")),
    ];
    let mut revisions = Vec::new();
    for relationship in &rels {
        revisions.push(write_one(&ds, relationship.clone()).await);
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("timed out waiting for a watch event")
            .expect("watch closed early");
        // Other tests may be writing concurrently; keep only our namespace.
        if event
            .relationship_changes
            .iter()
            .any(|change| change.relationship.resource.namespace == ns)
        {
            received.push(event);
        }
    }

    for (i, event) in received.iter().enumerate() {
        let revision = event.revision.clone().expect("change events carry a revision");
        assert!(
            revision.equivalent(&revisions[i]),
            "event {i} arrived out of commit order"
        );
        assert_eq!(event.relationship_changes.len(), 1);
        assert!(event.relationship_changes[0].relationship.eq_ignoring_integrity(&rels[i]));
    }

    assert!(errors.try_recv().is_err(), "watch reported an unexpected error");
    ds.close().await.unwrap();
}

// Within one revision, changes replay in the order the write inserted them.
#[tokio::test]
#[ignore = "requires PostgreSQL with track_commit_timestamp=on via DATABASE_URL"]
async fn watch_preserves_insertion_order_within_revision() {
    let ds = open_default().await;
    let ns = unique_namespace("inorder");

    let start = ds.head_revision().await.unwrap();
    let (mut changes, _errors) = ds.watch(start, WatchOptions::default()).await;

    // Deliberately not alphabetical, so index order would not mask a
    // missing insertion order.
    let ids = ["zeta", "alpha", "mike", "delta", "omega"];
    let rels: Vec<Relationship> =
        ids.iter().map(|id| rel(&format!("{ns}:{id}#viewer@user:alice"))).collect();
    {
        let rels = rels.clone();
        ds.read_write_tx(
            &move |tx| {
                let rels = rels.clone();
                Box::pin(async move {
                    tx.write_relationships(
                        rels.into_iter().map(RelationshipUpdate::create).collect(),
                    )
                    .await
                })
            },
            RwtOptions::default(),
        )
        .await
        .unwrap();
    }

    let event = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("timed out waiting for a watch event")
            .expect("watch closed early");
        if event
            .relationship_changes
            .iter()
            .any(|change| change.relationship.resource.namespace == ns)
        {
            break event;
        }
    };

    let observed: Vec<String> = event
        .relationship_changes
        .iter()
        .map(|change| change.relationship.resource.object_id.clone())
        .collect();
    let expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(observed, expected, "changes must replay in write insertion order");

    ds.close().await.unwrap();
}

// S5: integrity key rotation.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn integrity_key_rotation() {
    let ds = open_default().await;
    let ns = unique_namespace("rot");
    let shared: SharedDatastore = Arc::new(ds.clone());

    let old_material = b"previous-signing-key".to_vec();
    let new_material = b"current-signing-key".to_vec();

    // Historical writes signed by K1.
    let signed_with_k1 = RelationshipIntegrityProxy::new(
        Arc::clone(&shared),
        KeyConfig::new("k1", old_material.clone()),
        Vec::new(),
    )
    .unwrap();
    let relationship = rel(&format!("{ns}:doc#viewer@user:alice"));
    let r1 = write_one(&signed_with_k1, relationship.clone()).await;

    // After rotation: K2 signs, K1 verifies anything hashed before expiry.
    let rotated = RelationshipIntegrityProxy::new(
        Arc::clone(&shared),
        KeyConfig::new("k2", new_material.clone()),
        vec![KeyConfig::new("k1", old_material.clone())
            .expired_at(Utc::now() + chrono::Duration::hours(1))],
    )
    .unwrap();

    let found = rotated
        .snapshot_reader(r1.clone())
        .query_relationships(
            RelationshipsFilter::for_resource_type(ns.clone()),
            QueryOptions::default(),
        )
        .await
        .unwrap()
        .collect_remaining()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].integrity.is_none(), "verified reads strip integrity");

    // New writes are signed by K2.
    let relationship_two = rel(&format!("{ns}:doc2#viewer@user:bob"));
    let r2 = write_one(&rotated, relationship_two.clone()).await;
    let raw = ds
        .snapshot_reader(r2)
        .query_relationships(
            RelationshipsFilter {
                resource_type: Some(ns.clone()),
                resource_ids: vec!["doc2".to_string()],
                ..Default::default()
            },
            QueryOptions::default(),
        )
        .await
        .unwrap()
        .collect_remaining()
        .await
        .unwrap();
    assert_eq!(raw[0].integrity.as_ref().unwrap().key_id, "k2");

    // If K1's expiry predates the hashes, the old rows are rejected.
    let expired_early = RelationshipIntegrityProxy::new(
        Arc::clone(&shared),
        KeyConfig::new("k2", new_material),
        vec![KeyConfig::new("k1", old_material)
            .expired_at(Utc::now() - chrono::Duration::hours(1))],
    )
    .unwrap();
    let mut iterator = expired_early
        .snapshot_reader(r1)
        .query_relationships(RelationshipsFilter::for_resource_type(ns), QueryOptions::default())
        .await
        .unwrap();
    match iterator.next().await {
        Some(Err(StoreError::IntegrityFailure { .. })) => {}
        other => panic!("expected IntegrityFailure, got {other:?}"),
    }

    ds.close().await.unwrap();
}

// S6: concurrent serialization conflicts converge under retry.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn serialization_retry_converges() {
    let ds = open_datastore(
        PgDatastoreOptions::default().with_gc_enabled(false).with_max_retries(3),
    )
    .await;
    let ns = unique_namespace("race");

    let write = |comment: &'static str| {
        let ds = ds.clone();
        let ns = ns.clone();
        async move {
            let mut relationship = rel(&format!("{ns}:contended#viewer@user:alice"));
            relationship.comment = Some(comment.to_string());
            write_one(&ds, relationship).await
        }
    };

    let (ra, rb) = tokio::join!(write("writer-a"), write("writer-b"));
    assert!(!ra.equivalent(&rb), "the writers must commit at distinct revisions");

    let (later, later_comment) =
        if rb.at_or_after(&ra) { (rb, "writer-b") } else { (ra, "writer-a") };

    let found = ds
        .snapshot_reader(later)
        .query_relationships(RelationshipsFilter::for_resource_type(ns), QueryOptions::default())
        .await
        .unwrap()
        .collect_remaining()
        .await
        .unwrap();
    assert_eq!(found.len(), 1, "touch idempotence: exactly one live row");
    assert_eq!(found[0].comment.as_deref(), Some(later_comment));

    ds.close().await.unwrap();
}

// Revision monotonicity: sequential commits are totally ordered.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn revisions_are_monotonic() {
    let ds = open_default().await;
    let ns = unique_namespace("mono");

    let mut previous: Option<stratum_store::Revision> = None;
    for i in 0..5 {
        let revision = write_one(&ds, rel(&format!("{ns}:doc{i}#viewer@user:alice"))).await;
        if let Some(previous) = &previous {
            assert!(revision.at_or_after(previous));
            assert!(!previous.at_or_after(&revision) || previous.equivalent(&revision));
        }
        previous = Some(revision);
    }

    ds.close().await.unwrap();
}

// Cursors resume strictly after the last yielded row, across readers.
#[tokio::test]
#[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
async fn cursor_pagination_resumes() {
    let ds = open_default().await;
    let ns = unique_namespace("page");

    let mut revision = None;
    for i in 0..5 {
        revision = Some(write_one(&ds, rel(&format!("{ns}:doc{i}#viewer@user:alice"))).await);
    }
    let revision = revision.unwrap();

    let options = QueryOptions {
        limit: Some(2),
        sort: Some(SortOrder::ByResource),
        after: None,
    };
    let mut first_page = ds
        .snapshot_reader(revision.clone())
        .query_relationships(RelationshipsFilter::for_resource_type(ns.clone()), options)
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(item) = first_page.next().await {
        seen.push(item.unwrap().resource.object_id);
    }
    assert_eq!(seen, vec!["doc0", "doc1"]);

    let cursor = first_page.cursor().unwrap();
    let mut rest = ds
        .snapshot_reader(revision)
        .query_relationships(
            RelationshipsFilter::for_resource_type(ns),
            QueryOptions {
                limit: None,
                sort: Some(SortOrder::ByResource),
                after: Some(cursor),
            },
        )
        .await
        .unwrap();
    while let Some(item) = rest.next().await {
        seen.push(item.unwrap().resource.object_id);
    }
    assert_eq!(seen, vec!["doc0", "doc1", "doc2", "doc3", "doc4"]);

    ds.close().await.unwrap();
}
