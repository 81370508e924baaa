// Typed document access on the caller's transaction

use crate::application::context::TransactionContext;
use crate::domain::DomainError;
use crate::error::Result;
use crate::port::Statement;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Insert or replace `value` under `collection/key`
pub async fn save<T: Serialize>(
    ctx: &TransactionContext,
    collection: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let document = serde_json::to_value(value)?;
    ctx.execute(&Statement::put(collection, key, document)).await?;
    Ok(())
}

pub async fn find<T: DeserializeOwned>(
    ctx: &TransactionContext,
    collection: &str,
    key: &str,
) -> Result<Option<T>> {
    match ctx
        .execute(&Statement::get(collection, key))
        .await?
        .into_document()
    {
        Some(document) => decode(collection, key, document).map(Some),
        None => Ok(None),
    }
}

/// Every document of a collection, ordered by key
pub async fn find_all<T: DeserializeOwned>(
    ctx: &TransactionContext,
    collection: &str,
) -> Result<Vec<T>> {
    ctx.execute(&Statement::scan(collection))
        .await?
        .into_documents()
        .into_iter()
        .map(|(key, document)| decode(collection, &key, document))
        .collect()
}

/// Returns true when a document was removed
pub async fn delete(ctx: &TransactionContext, collection: &str, key: &str) -> Result<bool> {
    let outcome = ctx.execute(&Statement::delete(collection, key)).await?;
    Ok(outcome.rows_affected() > 0)
}

fn decode<T: DeserializeOwned>(collection: &str, key: &str, document: serde_json::Value) -> Result<T> {
    serde_json::from_value(document).map_err(|e| {
        DomainError::MalformedDocument {
            collection: collection.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
