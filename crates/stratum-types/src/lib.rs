//! # Stratum Types
//!
//! Shared type definitions for the stratum revisioned relationship store.
//!
//! This crate provides the domain types used across the stratum workspace,
//! ensuring a single source of truth and preventing circular dependencies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod filters;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use filters::{RelationshipsFilter, SubjectRelationFilter, SubjectsFilter};
pub use schema::{
    AllowedSubjectType, CaveatDefinition, CaveatParameterType, NamespaceDefinition,
    RelationDefinition,
};

/// The sentinel relation used on a subject to denote "the object itself"
/// rather than a sub-relation of it.
pub const ELLIPSIS: &str = "...";

// ============================================================================
// Core Domain Types
// ============================================================================

/// An object reference paired with a relation, e.g. `document:readme#viewer`.
///
/// Used both as the resource side of a relationship and, with [`ELLIPSIS`] as
/// the relation, as the subject side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    /// The object type, e.g. `document`.
    pub namespace: String,
    /// The object identifier, e.g. `readme`.
    pub object_id: String,
    /// The relation, e.g. `viewer`, or [`ELLIPSIS`] for subjects.
    pub relation: String,
}

impl ObjectAndRelation {
    pub fn new(
        namespace: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            object_id: object_id.into(),
            relation: relation.into(),
        }
    }

    /// A subject reference without a sub-relation.
    pub fn for_subject(namespace: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::new(namespace, object_id, ELLIPSIS)
    }

    /// Returns true if the relation is the [`ELLIPSIS`] sentinel.
    pub fn is_ellipsis(&self) -> bool {
        self.relation == ELLIPSIS
    }
}

impl Default for ObjectAndRelation {
    fn default() -> Self {
        Self { namespace: String::new(), object_id: String::new(), relation: ELLIPSIS.to_string() }
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ellipsis() {
            write!(f, "{}:{}", self.namespace, self.object_id)
        } else {
            write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
        }
    }
}

/// A caveat reference attached to a relationship: a named boolean expression
/// plus the context map it is evaluated with at check time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextualizedCaveat {
    pub caveat_name: String,
    /// Arbitrary JSON object handed to the caveat expression at check time.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl ContextualizedCaveat {
    pub fn named(caveat_name: impl Into<String>) -> Self {
        Self { caveat_name: caveat_name.into(), context: serde_json::Map::new() }
    }
}

/// The HMAC authentication block attached to a relationship by the integrity
/// proxy. `hash` is the version byte followed by the truncated MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipIntegrity {
    /// Identifier of the key that produced the hash.
    pub key_id: String,
    /// `version_byte || HMAC_SHA256(key, canonical_bytes)[0..16]`.
    pub hash: Vec<u8>,
    /// When the hash was computed.
    pub hashed_at: DateTime<Utc>,
}

/// A relationship tuple: the fundamental authorization edge
/// `resource#relation@subject[caveat]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<ContextualizedCaveat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<RelationshipIntegrity>,
    /// Free-form description, if the deployment records one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form comment, if the deployment records one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Relationship {
    pub fn new(resource: ObjectAndRelation, subject: ObjectAndRelation) -> Self {
        Self {
            resource,
            subject,
            caveat: None,
            integrity: None,
            description: None,
            comment: None,
        }
    }

    /// The caveat name, or the empty string when uncaveated. Uniqueness of
    /// live rows is defined over `(resource, subject, caveat_name)`.
    pub fn caveat_name(&self) -> &str {
        self.caveat.as_ref().map(|c| c.caveat_name.as_str()).unwrap_or("")
    }

    /// Returns true if the two relationships address the same live row:
    /// same resource, subject, and caveat name.
    pub fn same_row_key(&self, other: &Relationship) -> bool {
        self.resource == other.resource
            && self.subject == other.subject
            && self.caveat_name() == other.caveat_name()
    }

    /// Equality over everything a TOUCH considers, including the caveat
    /// context; integrity blocks are ignored.
    pub fn eq_ignoring_integrity(&self, other: &Relationship) -> bool {
        self.resource == other.resource
            && self.subject == other.subject
            && self.caveat == other.caveat
            && self.description == other.description
            && self.comment == other.comment
    }

    /// A copy with the integrity block cleared.
    pub fn without_integrity(&self) -> Relationship {
        let mut cloned = self.clone();
        cloned.integrity = None;
        cloned
    }

    pub fn with_caveat(mut self, caveat: ContextualizedCaveat) -> Self {
        self.caveat = Some(caveat);
        self
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.subject)?;
        if let Some(caveat) = &self.caveat {
            write!(f, "[{}]", caveat.caveat_name)?;
        }
        Ok(())
    }
}

impl FromStr for Relationship {
    type Err = StoreError;

    /// Parses the core `ns:id#rel@sns:sid[#srel]` textual form. Caveats and
    /// integrity are not representable in the string form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidArgument {
            message: format!("invalid relationship string: `{s}`"),
        };

        let (resource_str, subject_str) = s.split_once('@').ok_or_else(invalid)?;
        let parse_object = |part: &str, default_relation: &str| -> StoreResult<ObjectAndRelation> {
            let (object, relation) = match part.split_once('#') {
                Some((object, relation)) if !relation.is_empty() && !relation.contains('#') => {
                    (object, relation.to_string())
                }
                Some(_) => return Err(invalid()),
                None => (part, default_relation.to_string()),
            };
            let (namespace, object_id) = object.split_once(':').ok_or_else(invalid)?;
            if namespace.is_empty() || object_id.is_empty() {
                return Err(invalid());
            }
            Ok(ObjectAndRelation::new(namespace, object_id, relation))
        };

        let resource = parse_object(resource_str, "")?;
        if resource.relation.is_empty() {
            return Err(invalid());
        }
        let subject = parse_object(subject_str, ELLIPSIS)?;
        Ok(Relationship::new(resource, subject))
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// The kind of mutation applied to a relationship by a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipUpdateOperation {
    /// Insert; fails with `CreateRelationshipExists` if a live row exists.
    Create,
    /// Upsert; never fails on an existing row.
    Touch,
    /// Remove the live row, if any.
    Delete,
}

/// An ordered `(operation, relationship)` pair within a write transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: RelationshipUpdateOperation,
    pub relationship: Relationship,
}

impl RelationshipUpdate {
    pub fn create(relationship: Relationship) -> Self {
        Self { operation: RelationshipUpdateOperation::Create, relationship }
    }

    pub fn touch(relationship: Relationship) -> Self {
        Self { operation: RelationshipUpdateOperation::Touch, relationship }
    }

    pub fn delete(relationship: Relationship) -> Self {
        Self { operation: RelationshipUpdateOperation::Delete, relationship }
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// The kind of change observed by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    /// The relationship became live at the event's revision.
    Create,
    /// The relationship stopped being live at the event's revision.
    Delete,
}

/// A single relationship change within a revision's change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub operation: ChangeOperation,
    pub relationship: Relationship,
}

/// A schema change within a revision's change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaChange {
    ChangedNamespace(NamespaceDefinition),
    ChangedCaveat(CaveatDefinition),
    DeletedNamespace(String),
    DeletedCaveat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let rel: Relationship = "document:readme#viewer@user:alice".parse().unwrap();
        assert_eq!(rel.resource.namespace, "document");
        assert_eq!(rel.resource.object_id, "readme");
        assert_eq!(rel.resource.relation, "viewer");
        assert_eq!(rel.subject.namespace, "user");
        assert_eq!(rel.subject.object_id, "alice");
        assert_eq!(rel.subject.relation, ELLIPSIS);
        assert_eq!(rel.to_string(), "document:readme#viewer@user:alice");
    }

    #[test]
    fn test_parse_subject_with_relation() {
        let rel: Relationship = "group:eng#member@group:all#member".parse().unwrap();
        assert_eq!(rel.subject.relation, "member");
        assert_eq!(rel.to_string(), "group:eng#member@group:all#member");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "document:readme#viewer",
            "document:readme@user:alice",
            "document#viewer@user:alice",
            ":readme#viewer@user:alice",
            "document:readme##@user:alice",
            "",
        ] {
            assert!(bad.parse::<Relationship>().is_err(), "expected failure for `{bad}`");
        }
    }

    #[test]
    fn test_same_row_key_ignores_context() {
        let base: Relationship = "document:plan#viewer@user:bob".parse().unwrap();
        let mut caveated = base.clone();
        caveated.caveat = Some(ContextualizedCaveat::named("on_weekdays"));

        let mut other_context = caveated.clone();
        other_context
            .caveat
            .as_mut()
            .unwrap()
            .context
            .insert("tz".to_string(), serde_json::json!("UTC"));

        // Same caveat name, different context: same row key, not equal.
        assert!(caveated.same_row_key(&other_context));
        assert!(!caveated.eq_ignoring_integrity(&other_context));

        // Uncaveated vs caveated: different row key.
        assert!(!base.same_row_key(&caveated));
    }

    #[test]
    fn test_without_integrity() {
        let mut rel: Relationship = "document:a#view@user:b".parse().unwrap();
        rel.integrity = Some(RelationshipIntegrity {
            key_id: "k1".to_string(),
            hash: vec![1u8; 17],
            hashed_at: Utc::now(),
        });
        let stripped = rel.without_integrity();
        assert!(stripped.integrity.is_none());
        assert!(rel.integrity.is_some());
    }
}
