// txnest Core - Propagation coordinator, registry & unit-of-work wrapper
// NO infrastructure dependencies (hexagonal layout: adapters live in infra-* crates)

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{Result, ServiceError, TxError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
