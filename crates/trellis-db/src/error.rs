//! Store-runtime errors.
//!
//! Every recoverable condition carries a stable `kind` string so callers
//! can branch without parsing messages. Domain errors from `trellis-core`
//! pass through transparently.

use thiserror::Error;
use trellis_core::CoreError;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum DbError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("entity `{id}` not found in collection `{collection}`")]
    EntityNotFound { collection: String, id: String },
    #[error("collection `{collection}` is not in the schema")]
    CollectionNotFound { collection: String },
    #[error("write rule `{rule}` rejected the entity in collection `{collection}`")]
    WriteRuleViolation { collection: String, rule: String },
    #[error("attribute `{attribute}` of `{collection}` is a set; use add/remove")]
    SetAssignment {
        collection: String,
        attribute: String,
    },
    #[error("invalid migration operation: {reason}")]
    InvalidMigrationOperation { reason: String },
    #[error("schema version mismatch: stored {stored}, requested {requested}")]
    SchemaVersionMismatch { stored: u64, requested: u64 },
    #[error("transaction conflict on commit")]
    TransactionConflict,
    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },
    #[error("storage corrupt: {reason}")]
    Storage { reason: String },
}

impl DbError {
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Core(err) => err.kind(),
            DbError::EntityNotFound { .. } => "EntityNotFound",
            DbError::CollectionNotFound { .. } => "CollectionNotFound",
            DbError::WriteRuleViolation { .. } => "WriteRuleViolation",
            DbError::SetAssignment { .. } => "InvalidSetAssignment",
            DbError::InvalidMigrationOperation { .. } => "InvalidMigrationOperation",
            DbError::SchemaVersionMismatch { .. } => "SchemaVersionMismatch",
            DbError::TransactionConflict => "TransactionConflict",
            DbError::InvalidOptions { .. } => "InvalidOptions",
            DbError::Storage { .. } => "Storage",
        }
    }
}
