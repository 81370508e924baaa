// Domain Layer - Pure value types and entities

pub mod error;
pub mod member;
pub mod order;
pub mod propagation;

// Re-exports
pub use error::DomainError;
pub use member::{LogEntry, Member, Username};
pub use order::{Order, OrderId, PayStatus};
pub use propagation::{Propagation, TransactionDefinition, TransactionId};
