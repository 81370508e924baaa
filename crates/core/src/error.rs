// Central Error Type for transaction coordination

use thiserror::Error;

/// Coordinator-level error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// Status and registry disagree, or a propagation rule was violated.
    /// Fatal to the calling operation; never retried.
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// Commit requested on a physical transaction already marked rollback-only.
    /// Callers must treat this exactly like an explicit rollback.
    #[error("Unexpected rollback: {0}")]
    UnexpectedRollback(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Read-only violation: {0}")]
    ReadOnlyViolation(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),
}

impl TxError {
    /// True when the physical outcome was a rollback even though a commit was asked for
    pub fn is_unexpected_rollback(&self) -> bool {
        matches!(self, TxError::UnexpectedRollback(_))
    }
}

/// Result type alias using TxError
pub type Result<T> = std::result::Result<T, TxError>;

impl From<serde_json::Error> for TxError {
    fn from(err: serde_json::Error) -> Self {
        TxError::Resource(format!("Serialization error: {}", err))
    }
}

// Note: sqlx::Error conversion is handled in infra-sqlite crate
// by converting to TxError::Resource(String)

/// Error returned by the member/log and order services
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Payment declined for lack of funds; the order stays WAITING and commits
    #[error("Not enough money to pay order {order_id}")]
    NotEnoughMoney { order_id: String },

    #[error("Audit log write failed: {0}")]
    LogWriteFailed(String),

    #[error("Payment failed: {0}")]
    Payment(#[from] crate::port::PaymentError),

    #[error(transparent)]
    Transaction(#[from] TxError),

    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),
}

impl ServiceError {
    /// Transaction-layer error underneath, if any
    pub fn as_tx_error(&self) -> Option<&TxError> {
        match self {
            ServiceError::Transaction(e) => Some(e),
            _ => None,
        }
    }
}

impl crate::application::TransactionalError for ServiceError {
    fn failure_class(&self) -> crate::application::FailureClass {
        match self {
            ServiceError::NotEnoughMoney { .. } => crate::application::FailureClass::Business,
            _ => crate::application::FailureClass::Fault,
        }
    }

    fn category(&self) -> &str {
        match self {
            ServiceError::NotEnoughMoney { .. } => "not_enough_money",
            ServiceError::LogWriteFailed(_) => "log_write_failed",
            ServiceError::Payment(_) => "payment",
            ServiceError::Transaction(e) => crate::application::TransactionalError::category(e),
            ServiceError::Domain(_) => "domain",
        }
    }
}
