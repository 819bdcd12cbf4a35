//! Error types for datastore operations.
//!
//! Every fallible operation in the workspace returns [`StoreResult`]. The
//! variants carry enough structure for callers to map them onto their own
//! surfaces (gRPC codes, retry loops) without string matching.

use std::time::Duration;

use thiserror::Error;

use crate::Relationship;

/// Result type alias for datastore operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed error cause preserved from the backend or a lower layer.
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the datastore and its proxies.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend aborted the transaction due to a serialization conflict.
    /// Transient; the transaction engine retries these.
    #[error("serialization conflict while performing the transaction; the operation can be retried")]
    Serialization {
        #[source]
        source: ErrorCause,
    },

    /// A CREATE was attempted for a relationship that already has a live row.
    #[error("{}", fmt_create_exists(.relationship))]
    CreateRelationshipExists {
        /// The offending relationship, when the backend could recover it.
        relationship: Option<Box<Relationship>>,
    },

    /// The revision references a transaction that has aged out of the
    /// garbage-collection window.
    #[error("revision `{revision}` has expired and can no longer be serviced")]
    RevisionStale { revision: String },

    /// The revision token could not be parsed or references an unknown
    /// transaction.
    #[error("invalid revision `{token}`: {reason}")]
    InvalidRevision { token: String, reason: String },

    #[error("object definition `{name}` not found")]
    NamespaceNotFound { name: String },

    #[error("caveat `{name}` not found")]
    CaveatNotFound { name: String },

    /// A namespace deletion was blocked because live relationships still
    /// reference the definition.
    #[error("cannot delete object definition `{name}`: relationships still reference it")]
    NamespaceNotEmpty { name: String },

    #[error("counter `{name}` is already registered")]
    CounterAlreadyRegistered { name: String },

    #[error("counter `{name}` is not registered")]
    CounterNotRegistered { name: String },

    /// MAC mismatch, unknown key, or use of an expired key past its expiry.
    /// Fatal for the request; never retried.
    #[error("relationship integrity violation: {reason}")]
    IntegrityFailure { reason: String },

    /// A watch consumer failed to drain its buffer within the configured
    /// write timeout.
    #[error("watch buffer full: consumer failed to drain within {timeout:?}")]
    BufferOverflow { timeout: Duration },

    /// A write was attempted against a read-only deployment.
    #[error("the datastore is read-only")]
    ReadOnly,

    /// The requested feature is not available on this deployment.
    #[error("feature `{feature}` is not supported by this datastore")]
    Unsupported { feature: String },

    /// The caller canceled the operation.
    #[error("operation canceled")]
    Canceled,

    /// The caller's deadline elapsed before the operation completed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// The compiled schema failed validation.
    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    /// The caller supplied an argument the datastore cannot act on.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A retried transaction exhausted its retry budget.
    #[error("max retries exceeded ({attempts} attempts)")]
    MaxRetriesExceeded {
        attempts: u8,
        #[source]
        source: Box<StoreError>,
    },

    /// A backend error with no better classification.
    #[error("datastore error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },
}

fn fmt_create_exists(relationship: &Option<Box<Relationship>>) -> String {
    match relationship {
        Some(rel) => format!(
            "could not CREATE relationship `{rel}`, as it already existed; \
             if this is persistent, switch to TOUCH operations"
        ),
        None => "could not CREATE one or more relationships, as they already existed; \
                 if this is persistent, switch to TOUCH operations"
            .to_string(),
    }
}

impl StoreError {
    /// Wraps an arbitrary cause as an `Internal` error.
    pub fn internal(source: impl Into<ErrorCause>) -> Self {
        let source = source.into();
        StoreError::Internal { message: source.to_string(), source: Some(source) }
    }

    /// An `Internal` error carrying only a message.
    pub fn internal_msg(message: impl Into<String>) -> Self {
        StoreError::Internal { message: message.into(), source: None }
    }

    /// Whether the transaction engine may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization { .. })
    }

    /// The machine-readable reason string surfaced to API clients, when the
    /// error kind has one.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            StoreError::Serialization { .. } => Some("ERROR_REASON_SERIALIZATION_FAILURE"),
            StoreError::CreateRelationshipExists { .. } => {
                Some("ERROR_REASON_ATTEMPT_TO_RECREATE_RELATIONSHIP")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = StoreError::Serialization { source: "40001".into() };
        assert!(err.is_retryable());
        assert_eq!(err.reason(), Some("ERROR_REASON_SERIALIZATION_FAILURE"));

        assert!(!StoreError::Canceled.is_retryable());
        assert!(!StoreError::DeadlineExceeded.is_retryable());
        assert!(!StoreError::CreateRelationshipExists { relationship: None }.is_retryable());
    }

    #[test]
    fn test_create_exists_display_carries_relationship() {
        let rel: Relationship = "document:readme#viewer@user:alice".parse().unwrap();
        let err = StoreError::CreateRelationshipExists { relationship: Some(Box::new(rel)) };
        assert!(err.to_string().contains("document:readme#viewer@user:alice"));
        assert_eq!(err.reason(), Some("ERROR_REASON_ATTEMPT_TO_RECREATE_RELATIONSHIP"));
    }

    #[test]
    fn test_max_retries_preserves_cause() {
        let cause = StoreError::Serialization { source: "conflict".into() };
        let err = StoreError::MaxRetriesExceeded { attempts: 3, source: Box::new(cause) };
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_retryable());
    }
}
