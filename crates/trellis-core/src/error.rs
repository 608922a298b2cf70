//! Domain errors (parsing, validation, schema shape).
//!
//! Bounded and stable: these represent refusal states of the data model,
//! not storage or transaction failures. Each carries a stable `kind` string
//! that callers can match on without parsing messages.

use thiserror::Error;

/// Canonical error enum for the domain layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error("entity id `{raw}` is invalid: {reason}")]
    InvalidEntityId { raw: String, reason: String },
    #[error("internal entity id `{raw}` is invalid: {reason}")]
    InvalidInternalEntityId { raw: String, reason: String },
    #[error("client id `{raw}` is invalid: {reason}")]
    InvalidClientId { raw: String, reason: String },
    #[error("collection `{collection}` has no attribute `{attribute}`")]
    UnknownAttribute {
        collection: String,
        attribute: String,
    },
    #[error("session variable `{name}` is not bound")]
    SessionVariableNotFound { name: String },
    #[error("attribute `{attribute}` expects {expected}, got {found}")]
    ValueMismatch {
        attribute: String,
        expected: String,
        found: String,
    },
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidEntityId { .. } => "InvalidEntityId",
            CoreError::InvalidInternalEntityId { .. } => "InvalidInternalEntityId",
            CoreError::InvalidClientId { .. } => "InvalidClientId",
            CoreError::UnknownAttribute { .. } => "UnknownAttribute",
            CoreError::SessionVariableNotFound { .. } => "SessionVariableNotFound",
            CoreError::ValueMismatch { .. } => "ValueTypeMismatch",
        }
    }
}
