//! Classification of backend errors into [`StoreError`] kinds, plus
//! connection-string redaction for user-visible messages.

use regex::Regex;
use sqlx::postgres::PgDatabaseError;
use std::sync::OnceLock;

use stratum_types::{ObjectAndRelation, Relationship, StoreError};

/// SQLSTATE for a serialization failure under SERIALIZABLE isolation.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// The constraints that guard the one-live-row-per-key invariant. A unique
/// violation on any of these means a CREATE raced an existing relationship.
pub(crate) const LIVING_TUPLE_CONSTRAINTS: &[&str] = &["uq_tuple_living", "pk_tuple"];

/// Classifies a backend error with no additional context.
pub(crate) fn wrap(err: sqlx::Error) -> StoreError {
    classify(err)
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string());
            match code.as_deref() {
                Some(SERIALIZATION_FAILURE) => StoreError::Serialization { source: Box::new(err) },
                Some(UNIQUE_VIOLATION)
                    if db
                        .constraint()
                        .map(|c| LIVING_TUPLE_CONSTRAINTS.contains(&c))
                        .unwrap_or(false) =>
                {
                    let relationship = db
                        .try_downcast_ref::<PgDatabaseError>()
                        .and_then(|pg| pg.detail())
                        .and_then(parse_duplicate_key_detail)
                        .map(Box::new);
                    StoreError::CreateRelationshipExists { relationship }
                }
                _ => StoreError::internal(err),
            }
        }
        // The backend reports an abruptly closed connection when the caller
        // canceled mid-flight; surface that as a cancellation so it is never
        // retried or logged as a backend fault.
        sqlx::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => StoreError::Canceled,
            _ => StoreError::internal(err),
        },
        _ => StoreError::internal(err),
    }
}

/// Whether an already-classified error originated in a unique-constraint
/// violation (used by writers that map duplicates onto domain errors other
/// than `CreateRelationshipExists`, e.g. counter registration).
pub(crate) fn is_unique_violation(err: &StoreError) -> bool {
    let StoreError::Internal { source: Some(source), .. } = err else {
        return false;
    };
    source
        .downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false)
}

/// Best-effort recovery of the offending relationship from a duplicate-key
/// detail message of the form
/// `Key (namespace, object_id, …)=(document, readme, …) already exists.`
/// Values containing commas defeat the split; callers treat `None` as
/// "unrecoverable".
fn parse_duplicate_key_detail(detail: &str) -> Option<Relationship> {
    static DETAIL_RE: OnceLock<Regex> = OnceLock::new();
    let re = DETAIL_RE.get_or_init(|| {
        Regex::new(r"Key \([^)]*\)=\((?P<values>[^)]*)\) already exists").expect("static regex")
    });

    let captures = re.captures(detail)?;
    let values: Vec<&str> = captures.name("values")?.as_str().split(", ").collect();
    if values.len() < 6 {
        return None;
    }

    Some(Relationship::new(
        ObjectAndRelation::new(values[0], values[1], values[2]),
        ObjectAndRelation::new(values[3], values[4], values[5]),
    ))
}

/// Elides connection details from an error, logging the redacted full text
/// only at trace level, and returns a generic error safe to surface.
pub(crate) fn redact_conn_string(base: &str, err: sqlx::Error, url: &str) -> StoreError {
    static PORT_RE: OnceLock<Regex> = OnceLock::new();
    let port_re = PORT_RE
        .get_or_init(|| Regex::new(r#"invalid port "(.+)" after host"#).expect("static regex"));

    let mut filtered = err.to_string().replace(url, "(redacted)");
    filtered = port_re.replace_all(&filtered, "(redacted)").into_owned();
    tracing::trace!(error = %filtered, "{base}");

    StoreError::internal_msg(format!(
        "{base}; run with trace-level logging to view details (may contain sensitive information)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duplicate_key_detail() {
        let detail = "Key (namespace, object_id, relation, subject_namespace, \
                      subject_object_id, subject_relation)=(document, readme, viewer, user, \
                      alice, ...) already exists.";
        let rel = parse_duplicate_key_detail(detail).unwrap();
        assert_eq!(rel.resource.namespace, "document");
        assert_eq!(rel.resource.object_id, "readme");
        assert_eq!(rel.resource.relation, "viewer");
        assert_eq!(rel.subject.namespace, "user");
        assert_eq!(rel.subject.object_id, "alice");
        assert_eq!(rel.subject.relation, "...");
    }

    #[test]
    fn test_parse_duplicate_key_detail_rejects_short_keys() {
        assert!(parse_duplicate_key_detail("Key (name)=(foo) already exists.").is_none());
        assert!(parse_duplicate_key_detail("not a duplicate key message").is_none());
    }

    #[test]
    fn test_io_errors_map_to_canceled() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(matches!(classify(err), StoreError::Canceled));

        let err = sqlx::Error::Io(std::io::Error::other("disk on fire"));
        assert!(matches!(classify(err), StoreError::Internal { .. }));
    }
}
