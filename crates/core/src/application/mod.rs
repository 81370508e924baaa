// Application Layer - Transaction coordination and services built on it

pub mod context;
pub mod coordinator;
pub mod documents;
pub mod member;
pub mod order;
pub mod template;

// Re-exports
pub use context::{PhysicalTransaction, TransactionContext};
pub use coordinator::{CoordinatorConfig, TransactionCoordinator, TransactionStatus};
pub use member::{LogRepository, MemberRepository, MemberService, LOG_FAILURE_MARKER};
pub use order::{OrderRepository, OrderService};
pub use template::{run_in, FailureClass, RollbackPolicy, TransactionTemplate, TransactionalError};
