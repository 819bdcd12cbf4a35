//! Filter types for querying and deleting relationships.

use serde::{Deserialize, Serialize};

use crate::{Relationship, ELLIPSIS};

/// A filter over relationships. All fields are optional and combine
/// conjunctively; an entirely empty filter is rejected by the operations that
/// would otherwise match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipsFilter {
    /// Match the resource type exactly.
    pub resource_type: Option<String>,
    /// Match any of the given resource ids. Empty means "any id".
    #[serde(default)]
    pub resource_ids: Vec<String>,
    /// Match resource ids by prefix.
    pub resource_id_prefix: Option<String>,
    /// Match the resource relation exactly.
    pub relation: Option<String>,
    /// Restrict to relationships whose subject matches.
    pub subject: Option<SubjectsFilter>,
    /// Match the caveat name exactly.
    pub caveat_name: Option<String>,
}

impl RelationshipsFilter {
    pub fn for_resource_type(resource_type: impl Into<String>) -> Self {
        Self { resource_type: Some(resource_type.into()), ..Default::default() }
    }

    /// A filter matching exactly the row key of the given relationship.
    pub fn for_relationship(rel: &Relationship) -> Self {
        Self {
            resource_type: Some(rel.resource.namespace.clone()),
            resource_ids: vec![rel.resource.object_id.clone()],
            resource_id_prefix: None,
            relation: Some(rel.resource.relation.clone()),
            subject: Some(SubjectsFilter::for_subject(&rel.subject)),
            caveat_name: None,
        }
    }

    /// Returns true if no field restricts the result set.
    pub fn is_empty(&self) -> bool {
        self.resource_type.is_none()
            && self.resource_ids.is_empty()
            && self.resource_id_prefix.is_none()
            && self.relation.is_none()
            && self.subject.is_none()
            && self.caveat_name.is_none()
    }

    /// In-process evaluation of the filter against a relationship. The
    /// backend evaluates the same predicate in SQL; this form exists for
    /// counters and tests.
    pub fn matches(&self, rel: &Relationship) -> bool {
        if let Some(resource_type) = &self.resource_type {
            if rel.resource.namespace != *resource_type {
                return false;
            }
        }
        if !self.resource_ids.is_empty() && !self.resource_ids.contains(&rel.resource.object_id) {
            return false;
        }
        if let Some(prefix) = &self.resource_id_prefix {
            if !rel.resource.object_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(relation) = &self.relation {
            if rel.resource.relation != *relation {
                return false;
            }
        }
        if let Some(caveat_name) = &self.caveat_name {
            if rel.caveat_name() != caveat_name {
                return false;
            }
        }
        if let Some(subject) = &self.subject {
            if !subject.matches(rel) {
                return false;
            }
        }
        true
    }
}

/// A filter over the subject side of relationships, also usable standalone
/// for reverse queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectsFilter {
    /// The subject type to match. Required.
    pub subject_type: String,
    /// Match any of the given subject ids. Empty means "any id".
    #[serde(default)]
    pub subject_ids: Vec<String>,
    /// Restrict the subject relation. `None` matches any.
    pub relation: Option<SubjectRelationFilter>,
}

impl SubjectsFilter {
    pub fn for_subject_type(subject_type: impl Into<String>) -> Self {
        Self { subject_type: subject_type.into(), subject_ids: Vec::new(), relation: None }
    }

    pub fn for_subject(subject: &crate::ObjectAndRelation) -> Self {
        Self {
            subject_type: subject.namespace.clone(),
            subject_ids: vec![subject.object_id.clone()],
            relation: Some(if subject.is_ellipsis() {
                SubjectRelationFilter::ellipsis_only()
            } else {
                SubjectRelationFilter::relation_only(subject.relation.clone())
            }),
        }
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        if rel.subject.namespace != self.subject_type {
            return false;
        }
        if !self.subject_ids.is_empty() && !self.subject_ids.contains(&rel.subject.object_id) {
            return false;
        }
        match &self.relation {
            None => true,
            Some(filter) => filter.matches(&rel.subject.relation),
        }
    }
}

/// Which subject relations a [`SubjectsFilter`] admits: the ellipsis
/// sentinel, one concrete relation, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectRelationFilter {
    pub include_ellipsis: bool,
    pub non_ellipsis_relation: Option<String>,
}

impl SubjectRelationFilter {
    pub fn ellipsis_only() -> Self {
        Self { include_ellipsis: true, non_ellipsis_relation: None }
    }

    pub fn relation_only(relation: impl Into<String>) -> Self {
        Self { include_ellipsis: false, non_ellipsis_relation: Some(relation.into()) }
    }

    pub fn matches(&self, subject_relation: &str) -> bool {
        if subject_relation == ELLIPSIS {
            self.include_ellipsis
        } else {
            self.non_ellipsis_relation.as_deref() == Some(subject_relation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(s: &str) -> Relationship {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_filter() {
        assert!(RelationshipsFilter::default().is_empty());
        assert!(!RelationshipsFilter::for_resource_type("document").is_empty());
    }

    #[test]
    fn test_filter_matches() {
        let filter = RelationshipsFilter {
            resource_type: Some("document".to_string()),
            relation: Some("viewer".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&rel("document:readme#viewer@user:alice")));
        assert!(!filter.matches(&rel("document:readme#editor@user:alice")));
        assert!(!filter.matches(&rel("folder:root#viewer@user:alice")));
    }

    #[test]
    fn test_resource_id_prefix() {
        let filter = RelationshipsFilter {
            resource_type: Some("document".to_string()),
            resource_id_prefix: Some("plan-".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&rel("document:plan-2024#viewer@user:alice")));
        assert!(!filter.matches(&rel("document:readme#viewer@user:alice")));
    }

    #[test]
    fn test_subject_relation_filter() {
        let ellipsis = SubjectRelationFilter::ellipsis_only();
        assert!(ellipsis.matches(ELLIPSIS));
        assert!(!ellipsis.matches("member"));

        let member = SubjectRelationFilter::relation_only("member");
        assert!(member.matches("member"));
        assert!(!member.matches(ELLIPSIS));

        let both = SubjectRelationFilter {
            include_ellipsis: true,
            non_ellipsis_relation: Some("member".to_string()),
        };
        assert!(both.matches(ELLIPSIS));
        assert!(both.matches("member"));
        assert!(!both.matches("owner"));
    }

    #[test]
    fn test_exact_relationship_filter() {
        let target = rel("group:eng#member@group:all#member");
        let filter = RelationshipsFilter::for_relationship(&target);
        assert!(filter.matches(&target));
        assert!(!filter.matches(&rel("group:eng#member@group:all")));
        assert!(!filter.matches(&rel("group:eng#member@user:alice")));
    }
}
