//! Persisted schema definition types: object (namespace) definitions and
//! caveat definitions.
//!
//! These are the records the schema applier diffs and writes. The schema
//! *language* and its compiler live outside this workspace; what arrives here
//! is already-compiled structure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A persisted object type definition: the type's name plus its relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
}

impl NamespaceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), relations: Vec::new() }
    }

    pub fn with_relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// A relation (or permission) on an object definition.
///
/// A relation either admits direct subjects (`allowed_subject_types`
/// non-empty), is computed as a union of other relations on the same type
/// (`union_of` non-empty), or both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    #[serde(default)]
    pub allowed_subject_types: Vec<AllowedSubjectType>,
    /// Names of sibling relations whose subjects are included in this one.
    #[serde(default)]
    pub union_of: Vec<String>,
}

impl RelationDefinition {
    pub fn direct(name: impl Into<String>, allowed: Vec<AllowedSubjectType>) -> Self {
        Self { name: name.into(), allowed_subject_types: allowed, union_of: Vec::new() }
    }

    pub fn union(name: impl Into<String>, of: Vec<String>) -> Self {
        Self { name: name.into(), allowed_subject_types: Vec::new(), union_of: of }
    }
}

/// A subject type admitted by a relation, e.g. `user` (the object itself) or
/// `group#member` (a sub-relation), optionally gated by a caveat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedSubjectType {
    pub namespace: String,
    /// `None` admits the object itself (the ellipsis form); `Some` admits a
    /// sub-relation of the subject type.
    #[serde(default)]
    pub relation: Option<String>,
    /// When set, relationships of this shape must carry the named caveat.
    #[serde(default)]
    pub required_caveat: Option<String>,
}

impl AllowedSubjectType {
    pub fn plain(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), relation: None, required_caveat: None }
    }

    pub fn sub_relation(namespace: impl Into<String>, relation: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), relation: Some(relation.into()), required_caveat: None }
    }

    pub fn caveated(mut self, caveat: impl Into<String>) -> Self {
        self.required_caveat = Some(caveat.into());
        self
    }
}

/// A persisted caveat definition: a named boolean expression over typed
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatDefinition {
    pub name: String,
    /// Parameter names to their declared types. Ordered for deterministic
    /// serialization.
    #[serde(default)]
    pub parameters: BTreeMap<String, CaveatParameterType>,
    /// The source text of the boolean expression.
    pub expression: String,
}

impl CaveatDefinition {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self { name: name.into(), parameters: BTreeMap::new(), expression: expression.into() }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, ty: CaveatParameterType) -> Self {
        self.parameters.insert(name.into(), ty);
        self
    }
}

/// The type of a caveat parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaveatParameterType {
    Bool,
    Int,
    Uint,
    Double,
    String,
    Bytes,
    Timestamp,
    Duration,
    IpAddress,
    List(Box<CaveatParameterType>),
    Map(Box<CaveatParameterType>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_serialization_round_trip() {
        let def = NamespaceDefinition::new("document")
            .with_relation(RelationDefinition::direct(
                "viewer",
                vec![
                    AllowedSubjectType::plain("user"),
                    AllowedSubjectType::sub_relation("group", "member"),
                ],
            ))
            .with_relation(RelationDefinition::union("view", vec!["viewer".to_string()]));

        let serialized = serde_json::to_string(&def).unwrap();
        let parsed: NamespaceDefinition = serde_json::from_str(&serialized).unwrap();
        assert_eq!(def, parsed);
        assert!(parsed.relation("viewer").is_some());
        assert!(parsed.relation("owner").is_none());
    }

    #[test]
    fn test_caveat_parameters_are_ordered() {
        let def = CaveatDefinition::new("ip_allowlist", "ip.in_cidr(allowed)")
            .with_parameter("ip", CaveatParameterType::IpAddress)
            .with_parameter("allowed", CaveatParameterType::String);

        // BTreeMap keys serialize in lexicographic order, which keeps the
        // persisted form stable across writes.
        let serialized = serde_json::to_string(&def).unwrap();
        let allowed_pos = serialized.find("allowed").unwrap();
        let ip_pos = serialized.find("\"ip\"").unwrap();
        assert!(allowed_pos < ip_pos);
    }
}
