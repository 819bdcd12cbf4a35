//! Streaming relationship iterators and their resumption cursors.
//!
//! Iterators are forward-only and single-pass: each row is decoded as it
//! arrives from the backend and the iterator tracks the key of the last row
//! it yielded. A [`Cursor`] captures that key together with the revision and
//! sort order, so a later query can resume strictly after it, including
//! from a different process.

use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use stratum_types::{ObjectAndRelation, Relationship, StoreError, StoreResult};

use crate::postgres::revision::Revision;
use crate::SortOrder;

/// The row key a cursor resumes after: the full living-row identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorKey {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    pub caveat_name: String,
}

impl CursorKey {
    fn for_relationship(rel: &Relationship) -> Self {
        Self {
            resource: rel.resource.clone(),
            subject: rel.subject.clone(),
            caveat_name: rel.caveat_name().to_string(),
        }
    }
}

/// A stable position within an ordered result set.
///
/// Encoded as URL-safe base64 over a JSON body; the revision rides along so
/// a resumed query can verify it is reading the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub revision: Revision,
    pub sort: SortOrder,
    /// `None` means "the start of the result set".
    pub last: Option<CursorKey>,
}

impl Cursor {
    pub fn encode(&self) -> StoreResult<String> {
        let body = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(body))
    }

    pub fn decode(token: &str) -> StoreResult<Cursor> {
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|err| StoreError::InvalidArgument {
            message: format!("malformed cursor token: {err}"),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| StoreError::InvalidArgument {
            message: format!("malformed cursor body: {err}"),
        })
    }
}

/// A forward, single-pass stream of relationships.
///
/// Dropping the iterator closes it and releases its connection.
pub struct RelationshipIterator {
    stream: BoxStream<'static, StoreResult<Relationship>>,
    /// Revision the query ran at; absent inside read-write transactions,
    /// which have no committed revision yet and therefore no cursors.
    revision: Option<Revision>,
    sort: Option<SortOrder>,
    last: Option<CursorKey>,
}

impl RelationshipIterator {
    pub fn new(
        stream: BoxStream<'static, StoreResult<Relationship>>,
        revision: Option<Revision>,
        sort: Option<SortOrder>,
    ) -> Self {
        Self { stream, revision, sort, last: None }
    }

    /// An iterator over an already-materialized result set.
    pub fn from_vec(
        rows: Vec<StoreResult<Relationship>>,
        revision: Option<Revision>,
        sort: Option<SortOrder>,
    ) -> Self {
        Self::new(futures::stream::iter(rows).boxed(), revision, sort)
    }

    /// Yields the next relationship, or `None` at the end of the stream.
    pub async fn next(&mut self) -> Option<StoreResult<Relationship>> {
        let item = self.stream.next().await;
        if let Some(Ok(rel)) = &item {
            self.last = Some(CursorKey::for_relationship(rel));
        }
        item
    }

    /// The current position. Fails unless the query requested an explicit
    /// sort order (cursors are meaningless without one) and ran at a
    /// committed revision.
    pub fn cursor(&self) -> StoreResult<Cursor> {
        let sort = self.sort.ok_or_else(|| StoreError::InvalidArgument {
            message: "cursors require a query with an explicit sort order".to_string(),
        })?;
        let revision = self.revision.clone().ok_or_else(|| StoreError::InvalidArgument {
            message: "cursors are not available inside an uncommitted transaction".to_string(),
        })?;
        Ok(Cursor { revision, sort, last: self.last.clone() })
    }

    /// Closes the iterator, releasing its connection. Equivalent to
    /// dropping it.
    pub fn close(self) {}

    /// Applies a transform to every item the iterator yields, preserving
    /// cursor tracking. Used by proxies that rewrite rows in flight.
    pub fn map_items(
        self,
        f: impl FnMut(StoreResult<Relationship>) -> StoreResult<Relationship> + Send + 'static,
    ) -> RelationshipIterator {
        let Self { stream, revision, sort, last } = self;
        RelationshipIterator { stream: stream.map(f).boxed(), revision, sort, last }
    }

    /// Drains the remainder of the stream into a vector.
    pub async fn collect_remaining(mut self) -> StoreResult<Vec<Relationship>> {
        let mut rows = Vec::new();
        while let Some(item) = self.next().await {
            rows.push(item?);
        }
        Ok(rows)
    }
}

impl Stream for RelationshipIterator {
    type Item = StoreResult<Relationship>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.stream.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(rel))) = &polled {
            self.last = Some(CursorKey::for_relationship(rel));
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use crate::postgres::revision::{PgSnapshot, Xid};

    use super::*;

    fn rel(s: &str) -> Relationship {
        s.parse().unwrap()
    }

    fn revision() -> Revision {
        Revision::new(Xid(42), PgSnapshot::complete_through(42))
    }

    #[tokio::test]
    async fn test_iterator_tracks_cursor_position() {
        let rows = vec![
            Ok(rel("document:a#viewer@user:alice")),
            Ok(rel("document:b#viewer@user:bob")),
        ];
        let mut it =
            RelationshipIterator::from_vec(rows, Some(revision()), Some(SortOrder::ByResource));

        it.next().await.unwrap().unwrap();
        let cursor = it.cursor().unwrap();
        assert_eq!(cursor.last.as_ref().unwrap().resource.object_id, "a");

        it.next().await.unwrap().unwrap();
        let cursor = it.cursor().unwrap();
        assert_eq!(cursor.last.as_ref().unwrap().resource.object_id, "b");

        assert!(it.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cursor_requires_sort_order() {
        let it = RelationshipIterator::from_vec(Vec::new(), Some(revision()), None);
        assert!(matches!(it.cursor(), Err(StoreError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_cursor_requires_committed_revision() {
        let it = RelationshipIterator::from_vec(Vec::new(), None, Some(SortOrder::ByResource));
        assert!(matches!(it.cursor(), Err(StoreError::InvalidArgument { .. })));
    }

    #[test]
    fn test_cursor_token_round_trip() {
        let cursor = Cursor {
            revision: revision(),
            sort: SortOrder::BySubject,
            last: Some(CursorKey {
                resource: ObjectAndRelation::new("document", "a", "viewer"),
                subject: ObjectAndRelation::for_subject("user", "alice"),
                caveat_name: String::new(),
            }),
        };
        let token = cursor.encode().unwrap();
        let decoded = Cursor::decode(&token).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(Cursor::decode("not base64 ***").is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode(b"{\"nope\":1}")).is_err());
    }

    #[tokio::test]
    async fn test_error_passthrough() {
        let rows = vec![
            Ok(rel("document:a#viewer@user:alice")),
            Err(StoreError::internal_msg("backend failure")),
        ];
        let mut it =
            RelationshipIterator::from_vec(rows, Some(revision()), Some(SortOrder::ByResource));
        assert!(it.next().await.unwrap().is_ok());
        assert!(it.next().await.unwrap().is_err());
    }
}
