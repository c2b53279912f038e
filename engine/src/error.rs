//! Error types for the Harbor engine.

use crate::ModelName;
use thiserror::Error;

/// All possible errors from the Harbor engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("model not found in schema registry: {0}")]
    ModelNotFound(ModelName),

    #[error("field '{field}' does not exist on model {model}")]
    FieldNotFound { model: ModelName, field: String },

    // Predicate errors
    #[error("malformed predicate: {0}")]
    MalformedPredicate(String),

    // Record errors
    #[error("missing required field '{field}' on model {model}")]
    MissingRequiredField { model: ModelName, field: String },

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid model id '{0}': ids must be UUIDs")]
    InvalidId(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("failed to parse {kind} from '{input}'")]
    InvalidTemporal { kind: &'static str, input: String },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether this error describes a caller mistake in the model definitions
    /// or record contents, as opposed to a malformed filter.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidSchema(_) | Error::ModelNotFound(_) | Error::FieldNotFound { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
