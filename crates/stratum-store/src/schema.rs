//! Schema change validation and application.
//!
//! A compiled schema (object definitions plus caveat definitions) is first
//! validated structurally, with no database access, and then applied inside
//! a read-write transaction by diffing it against the persisted definitions.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use stratum_types::{
    CaveatDefinition, NamespaceDefinition, RelationshipsFilter, StoreError, StoreResult,
    SubjectsFilter,
};

use crate::{QueryOptions, ReadWriteTransaction, ReverseQueryOptions};

/// A compiled schema, as produced by an external schema compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledSchema {
    pub object_definitions: Vec<NamespaceDefinition>,
    pub caveat_definitions: Vec<CaveatDefinition>,
}

/// A schema that has passed structural validation and may be applied.
#[derive(Debug, Clone)]
pub struct ValidatedSchemaChanges {
    compiled: CompiledSchema,
    additive_only: bool,
}

/// Summary of an applied schema change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSchemaChanges {
    pub new_object_names: Vec<String>,
    pub removed_object_names: Vec<String>,
    pub new_caveat_names: Vec<String>,
    pub removed_caveat_names: Vec<String>,
    /// Count of definitions written or removed.
    pub total_operation_count: usize,
}

fn name_regex() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,61}[a-z0-9]$").expect("static regex"))
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidSchema { message: message.into() }
}

/// Validates the compiled schema without touching the datastore: legal
/// names, unique definitions, resolvable references, acyclic computed
/// relations, and well-formed caveats.
pub fn validate_schema_changes(
    compiled: CompiledSchema,
    additive_only: bool,
) -> StoreResult<ValidatedSchemaChanges> {
    let mut namespaces: HashMap<&str, &NamespaceDefinition> = HashMap::new();
    for definition in &compiled.object_definitions {
        if !name_regex().is_match(&definition.name) {
            return Err(invalid(format!("illegal object definition name `{}`", definition.name)));
        }
        if namespaces.insert(definition.name.as_str(), definition).is_some() {
            return Err(invalid(format!("duplicate object definition `{}`", definition.name)));
        }
    }

    let mut caveats: HashSet<&str> = HashSet::new();
    for caveat in &compiled.caveat_definitions {
        if !name_regex().is_match(&caveat.name) {
            return Err(invalid(format!("illegal caveat name `{}`", caveat.name)));
        }
        if !caveats.insert(caveat.name.as_str()) {
            return Err(invalid(format!("duplicate caveat `{}`", caveat.name)));
        }
        if caveat.expression.trim().is_empty() {
            return Err(invalid(format!("caveat `{}` has an empty expression", caveat.name)));
        }
        if caveat.parameters.is_empty() {
            return Err(invalid(format!("caveat `{}` declares no parameters", caveat.name)));
        }
        for parameter in caveat.parameters.keys() {
            if !name_regex().is_match(parameter) {
                return Err(invalid(format!(
                    "caveat `{}` has an illegal parameter name `{parameter}`",
                    caveat.name
                )));
            }
        }
    }

    for definition in &compiled.object_definitions {
        let mut relation_names: HashSet<&str> = HashSet::new();
        for relation in &definition.relations {
            if !name_regex().is_match(&relation.name) {
                return Err(invalid(format!(
                    "illegal relation name `{}` on `{}`",
                    relation.name, definition.name
                )));
            }
            if !relation_names.insert(relation.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate relation `{}` on `{}`",
                    relation.name, definition.name
                )));
            }
            if relation.allowed_subject_types.is_empty() && relation.union_of.is_empty() {
                return Err(invalid(format!(
                    "relation `{}#{}` admits no subjects",
                    definition.name, relation.name
                )));
            }

            for allowed in &relation.allowed_subject_types {
                let Some(subject_definition) = namespaces.get(allowed.namespace.as_str()) else {
                    return Err(invalid(format!(
                        "relation `{}#{}` references undefined type `{}`",
                        definition.name, relation.name, allowed.namespace
                    )));
                };
                if let Some(sub_relation) = &allowed.relation {
                    if subject_definition.relation(sub_relation).is_none() {
                        return Err(invalid(format!(
                            "relation `{}#{}` references undefined relation `{}#{}`",
                            definition.name, relation.name, allowed.namespace, sub_relation
                        )));
                    }
                }
                if let Some(required_caveat) = &allowed.required_caveat {
                    if !caveats.contains(required_caveat.as_str()) {
                        return Err(invalid(format!(
                            "relation `{}#{}` requires undefined caveat `{required_caveat}`",
                            definition.name, relation.name
                        )));
                    }
                }
            }

            for member in &relation.union_of {
                if definition.relation(member).is_none() {
                    return Err(invalid(format!(
                        "relation `{}#{}` includes undefined sibling `{member}`",
                        definition.name, relation.name
                    )));
                }
            }
        }

        check_union_cycles(definition)?;
    }

    Ok(ValidatedSchemaChanges { compiled, additive_only })
}

/// Rejects cycles through computed-relation unions, which would make
/// membership undecidable.
fn check_union_cycles(definition: &NamespaceDefinition) -> StoreResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Visiting,
        Done,
    }

    fn visit<'a>(
        definition: &'a NamespaceDefinition,
        relation: &'a str,
        states: &mut HashMap<&'a str, State>,
    ) -> StoreResult<()> {
        match states.get(relation) {
            Some(State::Done) => return Ok(()),
            Some(State::Visiting) => {
                return Err(invalid(format!(
                    "relation `{}#{relation}` participates in a cycle",
                    definition.name
                )))
            }
            None => {}
        }
        states.insert(relation, State::Visiting);
        if let Some(relation_definition) = definition.relation(relation) {
            for member in &relation_definition.union_of {
                visit(definition, member, states)?;
            }
        }
        states.insert(relation, State::Done);
        Ok(())
    }

    let mut states = HashMap::new();
    for relation in &definition.relations {
        visit(definition, &relation.name, &mut states)?;
    }
    Ok(())
}

/// The difference between the persisted schema and a compiled one.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SchemaDelta {
    pub new_namespaces: Vec<NamespaceDefinition>,
    pub changed_namespaces: Vec<NamespaceDefinition>,
    pub removed_namespaces: Vec<String>,
    pub new_caveats: Vec<CaveatDefinition>,
    pub changed_caveats: Vec<CaveatDefinition>,
    pub removed_caveats: Vec<String>,
}

pub(crate) fn compute_schema_delta(
    existing_namespaces: &[NamespaceDefinition],
    existing_caveats: &[CaveatDefinition],
    compiled: &CompiledSchema,
) -> SchemaDelta {
    let mut delta = SchemaDelta::default();

    let existing_ns: HashMap<&str, &NamespaceDefinition> =
        existing_namespaces.iter().map(|d| (d.name.as_str(), d)).collect();
    let compiled_ns: HashSet<&str> =
        compiled.object_definitions.iter().map(|d| d.name.as_str()).collect();

    for definition in &compiled.object_definitions {
        match existing_ns.get(definition.name.as_str()) {
            None => delta.new_namespaces.push(definition.clone()),
            Some(existing) if *existing != definition => {
                delta.changed_namespaces.push(definition.clone())
            }
            Some(_) => {}
        }
    }
    for existing in existing_namespaces {
        if !compiled_ns.contains(existing.name.as_str()) {
            delta.removed_namespaces.push(existing.name.clone());
        }
    }

    let existing_cav: HashMap<&str, &CaveatDefinition> =
        existing_caveats.iter().map(|d| (d.name.as_str(), d)).collect();
    let compiled_cav: HashSet<&str> =
        compiled.caveat_definitions.iter().map(|d| d.name.as_str()).collect();

    for caveat in &compiled.caveat_definitions {
        match existing_cav.get(caveat.name.as_str()) {
            None => delta.new_caveats.push(caveat.clone()),
            Some(existing) if *existing != caveat => delta.changed_caveats.push(caveat.clone()),
            Some(_) => {}
        }
    }
    for existing in existing_caveats {
        if !compiled_cav.contains(existing.name.as_str()) {
            delta.removed_caveats.push(existing.name.clone());
        }
    }

    delta
}

/// An update is backward compatible when it only adds: every existing
/// relation survives with all of its allowed subject types and union
/// members.
pub(crate) fn is_backward_compatible(
    old: &NamespaceDefinition,
    new: &NamespaceDefinition,
) -> bool {
    old.relations.iter().all(|old_relation| {
        let Some(new_relation) = new.relation(&old_relation.name) else {
            return false;
        };
        old_relation
            .allowed_subject_types
            .iter()
            .all(|allowed| new_relation.allowed_subject_types.contains(allowed))
            && old_relation.union_of.iter().all(|member| new_relation.union_of.contains(member))
    })
}

pub(crate) fn is_caveat_backward_compatible(
    old: &CaveatDefinition,
    new: &CaveatDefinition,
) -> bool {
    old.expression == new.expression
        && old
            .parameters
            .iter()
            .all(|(name, ty)| new.parameters.get(name).map(|t| t == ty).unwrap_or(false))
}

/// Applies validated schema changes inside the given transaction and
/// returns a summary. With `additive_only`, removals and non-backward-
/// compatible changes are rejected before anything is written.
pub async fn apply_schema_changes(
    tx: &dyn ReadWriteTransaction,
    validated: &ValidatedSchemaChanges,
) -> StoreResult<AppliedSchemaChanges> {
    let existing_namespaces: Vec<NamespaceDefinition> =
        tx.list_namespaces().await?.into_iter().map(|r| r.definition).collect();
    let existing_caveats: Vec<CaveatDefinition> =
        tx.list_caveats().await?.into_iter().map(|r| r.definition).collect();

    let delta = compute_schema_delta(&existing_namespaces, &existing_caveats, &validated.compiled);

    if validated.additive_only {
        if let Some(removed) = delta.removed_namespaces.first() {
            return Err(invalid(format!(
                "object definition `{removed}` cannot be removed in additive-only mode"
            )));
        }
        if let Some(removed) = delta.removed_caveats.first() {
            return Err(invalid(format!(
                "caveat `{removed}` cannot be removed in additive-only mode"
            )));
        }
        let existing_ns: HashMap<&str, &NamespaceDefinition> =
            existing_namespaces.iter().map(|d| (d.name.as_str(), d)).collect();
        for changed in &delta.changed_namespaces {
            if let Some(old) = existing_ns.get(changed.name.as_str()) {
                if !is_backward_compatible(old, changed) {
                    return Err(invalid(format!(
                        "object definition `{}` changes are not backward compatible",
                        changed.name
                    )));
                }
            }
        }
        let existing_cav: HashMap<&str, &CaveatDefinition> =
            existing_caveats.iter().map(|d| (d.name.as_str(), d)).collect();
        for changed in &delta.changed_caveats {
            if let Some(old) = existing_cav.get(changed.name.as_str()) {
                if !is_caveat_backward_compatible(old, changed) {
                    return Err(invalid(format!(
                        "caveat `{}` changes are not backward compatible",
                        changed.name
                    )));
                }
            }
        }
    }

    // Removed namespaces must hold no live relationships, on either side.
    for removed in &delta.removed_namespaces {
        let mut forward = tx
            .query_relationships(
                RelationshipsFilter::for_resource_type(removed.clone()),
                QueryOptions { limit: Some(1), ..Default::default() },
            )
            .await?;
        if forward.next().await.transpose()?.is_some() {
            return Err(StoreError::NamespaceNotEmpty { name: removed.clone() });
        }

        let mut reverse = tx
            .reverse_query_relationships(
                SubjectsFilter::for_subject_type(removed.clone()),
                ReverseQueryOptions { limit: Some(1), ..Default::default() },
            )
            .await?;
        if reverse.next().await.transpose()?.is_some() {
            return Err(StoreError::NamespaceNotEmpty { name: removed.clone() });
        }
    }

    let mut summary = AppliedSchemaChanges {
        new_object_names: delta.new_namespaces.iter().map(|d| d.name.clone()).collect(),
        removed_object_names: delta.removed_namespaces.clone(),
        new_caveat_names: delta.new_caveats.iter().map(|d| d.name.clone()).collect(),
        removed_caveat_names: delta.removed_caveats.clone(),
        total_operation_count: 0,
    };
    summary.total_operation_count = delta.new_namespaces.len()
        + delta.changed_namespaces.len()
        + delta.removed_namespaces.len()
        + delta.new_caveats.len()
        + delta.changed_caveats.len()
        + delta.removed_caveats.len();

    // Caveats first so namespace definitions can reference them on write.
    let mut caveats_to_write = delta.new_caveats;
    caveats_to_write.extend(delta.changed_caveats);
    if !caveats_to_write.is_empty() {
        tx.write_caveats(caveats_to_write).await?;
    }

    let mut namespaces_to_write = delta.new_namespaces;
    namespaces_to_write.extend(delta.changed_namespaces);
    if !namespaces_to_write.is_empty() {
        tx.write_namespaces(namespaces_to_write).await?;
    }

    if !delta.removed_namespaces.is_empty() {
        tx.delete_namespaces(&delta.removed_namespaces).await?;
    }
    if !delta.removed_caveats.is_empty() {
        tx.delete_caveats(&delta.removed_caveats).await?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use stratum_types::{AllowedSubjectType, CaveatParameterType, RelationDefinition};

    use super::*;

    fn document_schema() -> CompiledSchema {
        CompiledSchema {
            object_definitions: vec![
                NamespaceDefinition::new("user"),
                NamespaceDefinition::new("document")
                    .with_relation(RelationDefinition::direct(
                        "viewer",
                        vec![AllowedSubjectType::plain("user")],
                    ))
                    .with_relation(RelationDefinition::direct(
                        "editor",
                        vec![AllowedSubjectType::plain("user")],
                    ))
                    .with_relation(RelationDefinition::union(
                        "can_view",
                        vec!["viewer".to_string(), "editor".to_string()],
                    )),
            ],
            caveat_definitions: vec![CaveatDefinition::new("on_weekdays", "day < 6")
                .with_parameter("day", CaveatParameterType::Int)],
        }
    }

    #[test]
    fn test_valid_schema_passes() {
        assert!(validate_schema_changes(document_schema(), false).is_ok());
    }

    #[test]
    fn test_undefined_subject_type_rejected() {
        let schema = CompiledSchema {
            object_definitions: vec![NamespaceDefinition::new("document").with_relation(
                RelationDefinition::direct("viewer", vec![AllowedSubjectType::plain("ghost")]),
            )],
            caveat_definitions: Vec::new(),
        };
        assert!(matches!(
            validate_schema_changes(schema, false),
            Err(StoreError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_union_cycle_rejected() {
        let schema = CompiledSchema {
            object_definitions: vec![NamespaceDefinition::new("document")
                .with_relation(RelationDefinition::union("a", vec!["b".to_string()]))
                .with_relation(RelationDefinition::union("b", vec!["a".to_string()]))],
            caveat_definitions: Vec::new(),
        };
        let err = validate_schema_changes(schema, false).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_illegal_names_rejected() {
        for bad in ["Document", "9doc", "d", "has space"] {
            let schema = CompiledSchema {
                object_definitions: vec![NamespaceDefinition::new(bad)],
                caveat_definitions: Vec::new(),
            };
            assert!(validate_schema_changes(schema, false).is_err(), "accepted `{bad}`");
        }
    }

    #[test]
    fn test_caveat_requires_parameters_and_expression() {
        let no_params = CompiledSchema {
            caveat_definitions: vec![CaveatDefinition::new("c_empty", "true")],
            object_definitions: Vec::new(),
        };
        assert!(validate_schema_changes(no_params, false).is_err());

        let empty_expr = CompiledSchema {
            caveat_definitions: vec![CaveatDefinition::new("c_empty", "  ")
                .with_parameter("x", CaveatParameterType::Bool)],
            object_definitions: Vec::new(),
        };
        assert!(validate_schema_changes(empty_expr, false).is_err());
    }

    #[test]
    fn test_delta_classifies_new_changed_removed() {
        let compiled = document_schema();
        let existing = vec![
            NamespaceDefinition::new("user"),
            NamespaceDefinition::new("folder"),
            NamespaceDefinition::new("document").with_relation(RelationDefinition::direct(
                "viewer",
                vec![AllowedSubjectType::plain("user")],
            )),
        ];
        let delta = compute_schema_delta(&existing, &[], &compiled);

        assert!(delta.new_namespaces.is_empty());
        assert_eq!(delta.changed_namespaces.len(), 1);
        assert_eq!(delta.changed_namespaces[0].name, "document");
        assert_eq!(delta.removed_namespaces, vec!["folder".to_string()]);
        assert_eq!(delta.new_caveats.len(), 1);
    }

    #[test]
    fn test_backward_compatibility() {
        let old = NamespaceDefinition::new("document").with_relation(
            RelationDefinition::direct("viewer", vec![AllowedSubjectType::plain("user")]),
        );

        // Adding a relation or a subject type is compatible.
        let added = old
            .clone()
            .with_relation(RelationDefinition::direct(
                "editor",
                vec![AllowedSubjectType::plain("user")],
            ));
        assert!(is_backward_compatible(&old, &added));

        let mut widened = old.clone();
        widened.relations[0]
            .allowed_subject_types
            .push(AllowedSubjectType::sub_relation("group", "member"));
        assert!(is_backward_compatible(&old, &widened));

        // Dropping a relation or narrowing subjects is not.
        let empty = NamespaceDefinition::new("document");
        assert!(!is_backward_compatible(&old, &empty));

        let mut narrowed = old.clone();
        narrowed.relations[0].allowed_subject_types.clear();
        assert!(!is_backward_compatible(&old, &narrowed));
    }

    #[test]
    fn test_caveat_compatibility() {
        let old = CaveatDefinition::new("c_ip", "ip.in_cidr(range)")
            .with_parameter("ip", CaveatParameterType::IpAddress);

        let widened = old.clone().with_parameter("range", CaveatParameterType::String);
        assert!(is_caveat_backward_compatible(&old, &widened));

        let mut retyped = old.clone();
        retyped.parameters.insert("ip".to_string(), CaveatParameterType::String);
        assert!(!is_caveat_backward_compatible(&old, &retyped));

        let mut rewritten = old.clone();
        rewritten.expression = "true".to_string();
        assert!(!is_caveat_backward_compatible(&old, &rewritten));
    }
}
