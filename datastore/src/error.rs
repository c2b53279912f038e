//! Unified error handling for the data store.

use crate::config::ConfigError;

/// Errors surfaced by data store operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataStoreError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("DataStore is not configured")]
    NotConfigured,

    #[error("Storage adapter has been terminated")]
    AdapterTerminated,

    #[error("Precondition failed for {model} {id}: {predicate}")]
    PredicateConditionFailed {
        model: String,
        id: String,
        predicate: String,
    },

    #[error("Malformed predicate: {0}")]
    MalformedPredicate(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Storage I/O failure: {0}")]
    StorageIo(String),

    #[error("Remote rejected {model} {id}: {reason}")]
    ConflictUnresolved {
        model: String,
        id: String,
        reason: String,
    },

    #[error("Remote reconciliation failed: {0}")]
    RemoteFailure(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataStoreError {
    /// Whether the outbox may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataStoreError::StorageIo(_) | DataStoreError::RemoteFailure(_)
        )
    }

    /// Whether this is a validation error raised before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DataStoreError::InvalidSchema(_)
                | DataStoreError::IllegalState(_)
                | DataStoreError::NotConfigured
                | DataStoreError::AdapterTerminated
                | DataStoreError::MalformedPredicate(_)
                | DataStoreError::InvalidModel(_)
        )
    }
}

impl From<harbor_engine::Error> for DataStoreError {
    fn from(err: harbor_engine::Error) -> Self {
        use harbor_engine::Error;
        match err {
            Error::InvalidSchema(msg) => DataStoreError::InvalidSchema(msg),
            Error::MalformedPredicate(msg) => DataStoreError::MalformedPredicate(msg),
            Error::InvalidSnapshot(msg) => DataStoreError::StorageIo(msg),
            other => DataStoreError::InvalidModel(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for DataStoreError {
    fn from(err: sqlx::Error) -> Self {
        DataStoreError::StorageIo(err.to_string())
    }
}

impl From<serde_json::Error> for DataStoreError {
    fn from(err: serde_json::Error) -> Self {
        DataStoreError::StorageIo(format!("corrupt row: {}", err))
    }
}

/// Result type alias for data store operations.
pub type Result<T> = std::result::Result<T, DataStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_onto_taxonomy() {
        let err: DataStoreError = harbor_engine::Error::InvalidSchema("dup".into()).into();
        assert_eq!(err, DataStoreError::InvalidSchema("dup".into()));

        let err: DataStoreError = harbor_engine::Error::MalformedPredicate("x".into()).into();
        assert!(matches!(err, DataStoreError::MalformedPredicate(_)));

        let err: DataStoreError = harbor_engine::Error::InvalidId("t1".into()).into();
        assert!(matches!(err, DataStoreError::InvalidModel(msg) if msg.contains("t1")));
    }

    #[test]
    fn retry_classification() {
        assert!(DataStoreError::StorageIo("disk full".into()).is_retryable());
        assert!(DataStoreError::RemoteFailure("503".into()).is_retryable());
        assert!(!DataStoreError::PredicateConditionFailed {
            model: "Todo".into(),
            id: "1".into(),
            predicate: "ALL".into(),
        }
        .is_retryable());
        assert!(!DataStoreError::ConflictUnresolved {
            model: "Todo".into(),
            id: "1".into(),
            reason: "version".into(),
        }
        .is_retryable());
        assert!(DataStoreError::MalformedPredicate("x".into()).is_validation());
        assert!(!DataStoreError::StorageIo("x".into()).is_validation());
    }

    #[test]
    fn error_display() {
        let err = DataStoreError::PredicateConditionFailed {
            model: "Todo".into(),
            id: "abc".into(),
            predicate: "status = \"X\"".into(),
        };
        assert_eq!(err.to_string(), "Precondition failed for Todo abc: status = \"X\"");
    }
}
