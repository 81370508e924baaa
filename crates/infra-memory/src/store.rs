// In-memory document store

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use txnest_core::error::{Result, TxError};
use txnest_core::port::{PhysicalConnection, Statement, StatementOutcome, TransactionalResource};

/// (collection, key)
type RecordKey = (String, String);

/// Pending writes of one connection; `None` is a delete
type Overlay = BTreeMap<RecordKey, Option<Value>>;

#[derive(Default)]
struct Shared {
    committed: Mutex<BTreeMap<RecordKey, Value>>,
    open: AtomicUsize,
}

impl Shared {
    fn committed(&self) -> Result<MutexGuard<'_, BTreeMap<RecordKey, Value>>> {
        self.committed
            .lock()
            .map_err(|_| TxError::Resource("memory store lock poisoned".to_string()))
    }
}

/// Committed documents plus a bounded number of open connections
///
/// Each connection buffers its writes and applies them atomically on commit.
/// Other connections only ever see committed data. Concurrent writers to the
/// same key are last-commit-wins.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    max_connections: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to open more than `max` connections at once
    pub fn with_max_connections(max: usize) -> Self {
        Self {
            shared: Arc::default(),
            max_connections: Some(max),
        }
    }

    /// Committed document, read outside any transaction
    pub fn committed_document(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let committed = self.shared.committed()?;
        Ok(committed
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    /// Committed documents of one collection, ordered by key
    pub fn committed_documents(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let committed = self.shared.committed()?;
        Ok(collection_range(&committed, collection)
            .map(|((_, key), doc)| (key.clone(), doc.clone()))
            .collect())
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.max_connections.unwrap_or(usize::MAX);
        self.shared
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < max).then_some(open + 1)
            })
            .map(|_| ())
            .map_err(|open| {
                TxError::ResourceExhausted(format!(
                    "memory store allows {} connection(s), {} open",
                    max, open
                ))
            })
    }
}

fn collection_range<'a, V>(
    map: &'a BTreeMap<RecordKey, V>,
    collection: &'a str,
) -> impl Iterator<Item = (&'a RecordKey, &'a V)> + 'a {
    map.range((collection.to_string(), String::new())..)
        .take_while(move |((c, _), _)| c == collection)
}

#[async_trait]
impl TransactionalResource for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn PhysicalConnection>> {
        self.reserve_slot()?;
        debug!(open = self.open_connections(), "Opened memory connection");
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            overlay: Overlay::new(),
            savepoints: Vec::new(),
        }))
    }
}

/// One physical transaction on the memory store
pub struct MemoryConnection {
    shared: Arc<Shared>,
    overlay: Overlay,
    savepoints: Vec<(String, Overlay)>,
}

impl MemoryConnection {
    fn get(&self, key: &RecordKey) -> Result<Option<Value>> {
        if let Some(pending) = self.overlay.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.shared.committed()?.get(key).cloned())
    }

    fn scan(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let mut merged: BTreeMap<String, Value> = {
            let committed = self.shared.committed()?;
            collection_range(&committed, collection)
                .map(|((_, key), doc)| (key.clone(), doc.clone()))
                .collect()
        };

        for ((_, key), pending) in collection_range(&self.overlay, collection) {
            match pending {
                Some(doc) => {
                    merged.insert(key.clone(), doc.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn savepoint_position(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                TxError::IllegalTransactionState(format!("No savepoint named {}", name))
            })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PhysicalConnection for MemoryConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome> {
        match statement {
            Statement::Put {
                collection,
                key,
                document,
            } => {
                self.overlay
                    .insert((collection.clone(), key.clone()), Some(document.clone()));
                Ok(StatementOutcome::Affected(1))
            }
            Statement::Get { collection, key } => {
                let key = (collection.clone(), key.clone());
                Ok(StatementOutcome::Document(self.get(&key)?))
            }
            Statement::Delete { collection, key } => {
                let key = (collection.clone(), key.clone());
                let existed = self.get(&key)?.is_some();
                self.overlay.insert(key, None);
                Ok(StatementOutcome::Affected(u64::from(existed)))
            }
            Statement::Scan { collection } => {
                Ok(StatementOutcome::Documents(self.scan(collection)?))
            }
        }
    }

    async fn create_savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push((name.to_string(), self.overlay.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position + 1);
        self.overlay = self.savepoints[position].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let overlay = std::mem::take(&mut self.overlay);
        let writes = overlay.len();
        let mut committed = self.shared.committed()?;
        for (key, pending) in overlay {
            match pending {
                Some(doc) => {
                    committed.insert(key, doc);
                }
                None => {
                    committed.remove(&key);
                }
            }
        }
        debug!(writes, "Applied memory overlay");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(discarded = self.overlay.len(), "Discarded memory overlay");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_applies_overlay() {
        let store = MemoryStore::new();
        let mut conn = store.begin().await.unwrap();

        conn.execute(&Statement::put("members", "kim", json!({"n": 1})))
            .await
            .unwrap();
        // Read-your-writes
        let own = conn
            .execute(&Statement::get("members", "kim"))
            .await
            .unwrap()
            .into_document();
        assert_eq!(own, Some(json!({"n": 1})));
        assert_eq!(store.committed_document("members", "kim").unwrap(), None);

        conn.commit().await.unwrap();
        assert_eq!(
            store.committed_document("members", "kim").unwrap(),
            Some(json!({"n": 1}))
        );
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_overlay() {
        let store = MemoryStore::new();
        let mut conn = store.begin().await.unwrap();
        conn.execute(&Statement::put("members", "kim", json!({})))
            .await
            .unwrap();
        conn.rollback().await.unwrap();

        assert!(store.committed_documents("members").unwrap().is_empty());
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_other_connections_read_committed_only() {
        let store = MemoryStore::new();
        let mut writer = store.begin().await.unwrap();
        let mut reader = store.begin().await.unwrap();

        writer
            .execute(&Statement::put("logs", "a", json!("x")))
            .await
            .unwrap();
        let seen = reader
            .execute(&Statement::scan("logs"))
            .await
            .unwrap()
            .into_documents();
        assert!(seen.is_empty());

        writer.commit().await.unwrap();
        let seen = reader
            .execute(&Statement::scan("logs"))
            .await
            .unwrap()
            .into_documents();
        assert_eq!(seen, vec![("a".to_string(), json!("x"))]);
    }

    #[tokio::test]
    async fn test_scan_merges_overlay_and_stays_in_collection() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        for (collection, key) in [("members", "b"), ("members", "c"), ("membersx", "a")] {
            setup
                .execute(&Statement::put(collection, key, json!(key)))
                .await
                .unwrap();
        }
        setup.commit().await.unwrap();

        let mut conn = store.begin().await.unwrap();
        conn.execute(&Statement::put("members", "a", json!("new")))
            .await
            .unwrap();
        let removed = conn
            .execute(&Statement::delete("members", "c"))
            .await
            .unwrap();
        assert_eq!(removed.rows_affected(), 1);

        let keys: Vec<String> = conn
            .execute(&Statement::scan("members"))
            .await
            .unwrap()
            .into_documents()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_savepoints_restore_overlay() {
        let store = MemoryStore::new();
        let mut conn = store.begin().await.unwrap();

        conn.execute(&Statement::put("orders", "1", json!(1)))
            .await
            .unwrap();
        conn.create_savepoint("sp_1").await.unwrap();
        conn.execute(&Statement::put("orders", "2", json!(2)))
            .await
            .unwrap();
        conn.create_savepoint("sp_2").await.unwrap();
        conn.execute(&Statement::put("orders", "3", json!(3)))
            .await
            .unwrap();

        conn.rollback_to_savepoint("sp_1").await.unwrap();
        // Later savepoints are gone
        assert!(conn.release_savepoint("sp_2").await.is_err());
        conn.release_savepoint("sp_1").await.unwrap();
        conn.commit().await.unwrap();

        assert_eq!(
            store.committed_documents("orders").unwrap(),
            vec![("1".to_string(), json!(1))]
        );
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let store = MemoryStore::with_max_connections(1);
        let first = store.begin().await.unwrap();

        assert!(matches!(
            store.begin().await,
            Err(TxError::ResourceExhausted(_))
        ));

        drop(first);
        assert!(store.begin().await.is_ok());
    }
}
