// SQLite Connection Pool Setup

use crate::error::map_sqlx_error;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use txnest_core::error::Result;

/// Pool sizing and lock waiting
///
/// Every open physical transaction holds one pooled connection until it
/// completes, so `max_connections` bounds how deep REQUIRES_NEW can nest.
#[derive(Debug, Clone)]
pub struct SqlitePoolConfig {
    pub max_connections: u32,
    /// How long a statement waits on another connection's write lock
    pub busy_timeout: Duration,
    /// How long `begin` waits for a free connection before reporting exhaustion
    pub acquire_timeout: Duration,
}

impl Default for SqlitePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(2),
        }
    }
}

/// Create SQLite connection pool with WAL mode
pub async fn create_pool(database_url: &str, config: &SqlitePoolConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(map_sqlx_error)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)?;

    info!(
        database_url,
        max_connections = config.max_connections,
        "SQLite pool ready"
    );
    Ok(pool)
}
