// txnest Infrastructure - SQLite Adapter
// Implements: TransactionalResource / PhysicalConnection over a `records` table

mod connection;
mod error;
mod migration;
mod resource;

pub use connection::{create_pool, SqlitePoolConfig};
pub use migration::run_migrations;
pub use resource::{SqliteConnection, SqliteResource};

// Note: sqlx::Error conversion is handled by a helper function (error.rs)
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for TxError here)
