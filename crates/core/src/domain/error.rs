// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid pay status transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Malformed document in {collection}/{key}: {reason}")]
    MalformedDocument {
        collection: String,
        key: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, DomainError>;
