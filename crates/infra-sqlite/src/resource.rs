// SQLite TransactionalResource Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction as SqlxTransaction};
use tracing::debug;
use txnest_core::error::{Result, TxError};
use txnest_core::port::{PhysicalConnection, Statement, StatementOutcome, TransactionalResource};

/// Opens one pooled connection + `BEGIN` per physical transaction
#[derive(Clone)]
pub struct SqliteResource {
    pool: SqlitePool,
}

impl SqliteResource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TransactionalResource for SqliteResource {
    async fn begin(&self) -> Result<Box<dyn PhysicalConnection>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        debug!(
            pool_size = self.pool.size(),
            idle = self.pool.num_idle(),
            "Opened SQLite transaction"
        );
        Ok(Box::new(SqliteConnection { tx }))
    }
}

/// Live SQLite transaction; dropped without commit it rolls back
pub struct SqliteConnection {
    tx: SqlxTransaction<'static, Sqlite>,
}

impl SqliteConnection {
    async fn put(&mut self, collection: &str, key: &str, document: &serde_json::Value) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO records (collection, key, body) VALUES (?, ?, ?)
            ON CONFLICT (collection, key) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(document.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE collection = ? AND key = ?")
                .bind(collection)
                .bind(key)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(TxError::from)
    }

    async fn delete(&mut self, collection: &str, key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn scan(&mut self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, body FROM records WHERE collection = ? ORDER BY key")
                .bind(collection)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|(key, body)| -> Result<(String, serde_json::Value)> {
                Ok((key, serde_json::from_str(&body)?))
            })
            .collect()
    }

    async fn run_savepoint_sql(&mut self, verb: &str, name: &str) -> Result<()> {
        let name = savepoint_identifier(name)?;
        sqlx::query(&format!("{} {}", verb, name))
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Savepoint names are spliced into SQL; only plain identifiers pass
fn savepoint_identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(TxError::IllegalTransactionState(format!(
            "Invalid savepoint name: {:?}",
            name
        )))
    }
}

#[async_trait]
impl PhysicalConnection for SqliteConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome> {
        match statement {
            Statement::Put {
                collection,
                key,
                document,
            } => self
                .put(collection, key, document)
                .await
                .map(StatementOutcome::Affected),
            Statement::Get { collection, key } => {
                self.get(collection, key).await.map(StatementOutcome::Document)
            }
            Statement::Delete { collection, key } => self
                .delete(collection, key)
                .await
                .map(StatementOutcome::Affected),
            Statement::Scan { collection } => {
                self.scan(collection).await.map(StatementOutcome::Documents)
            }
        }
    }

    async fn create_savepoint(&mut self, name: &str) -> Result<()> {
        self.run_savepoint_sql("SAVEPOINT", name).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.run_savepoint_sql("ROLLBACK TO SAVEPOINT", name).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.run_savepoint_sql("RELEASE SAVEPOINT", name).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
