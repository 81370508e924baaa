// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod payment_gateway;
pub mod time_provider;
pub mod transaction;

// Re-exports
pub use id_provider::{IdProvider, UuidProvider};
pub use payment_gateway::{PaymentDecision, PaymentError, PaymentGateway};
pub use time_provider::{SystemTimeProvider, TimeProvider};
pub use transaction::{PhysicalConnection, Statement, StatementOutcome, TransactionalResource};
