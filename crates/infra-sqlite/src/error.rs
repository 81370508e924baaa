// sqlx::Error -> TxError mapping

use txnest_core::error::TxError;

/// Convert sqlx::Error to TxError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> TxError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => TxError::Resource(format!(
                        "Unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "5" | "517" => {
                        // SQLITE_BUSY: another connection holds the write lock
                        TxError::Resource(format!(
                            "Database locked (SQLITE_BUSY): {}",
                            db_err.message()
                        ))
                    }
                    "6" => TxError::Resource(format!(
                        "Table locked (SQLITE_LOCKED): {}",
                        db_err.message()
                    )),
                    "13" => TxError::Resource(format!("Database full: {}", db_err.message())),
                    _ => TxError::Resource(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                TxError::Resource(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::PoolTimedOut => {
            TxError::ResourceExhausted("no SQLite connection available before acquire timeout".to_string())
        }
        sqlx::Error::PoolClosed => TxError::Resource("Connection pool closed".to_string()),
        sqlx::Error::RowNotFound => TxError::Resource("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => TxError::Resource(format!("Column not found: {}", col)),
        _ => TxError::Resource(format!("Database error: {}", err)),
    }
}
