// Resource Handle port: physical transactions against an external store

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque unit of work executed on a physical connection.
///
/// The coordinator never inspects statements; only adapters and the
/// registry's read-only guard look at them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    /// Insert or replace a document
    Put {
        collection: String,
        key: String,
        document: serde_json::Value,
    },
    /// Read one document
    Get { collection: String, key: String },
    /// Remove one document
    Delete { collection: String, key: String },
    /// Read every document of a collection, ordered by key
    Scan { collection: String },
}

impl Statement {
    pub fn put(
        collection: impl Into<String>,
        key: impl Into<String>,
        document: serde_json::Value,
    ) -> Self {
        Statement::Put {
            collection: collection.into(),
            key: key.into(),
            document,
        }
    }

    pub fn get(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Statement::Get {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn delete(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Statement::Delete {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn scan(collection: impl Into<String>) -> Self {
        Statement::Scan {
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Statement::Put { collection, .. }
            | Statement::Get { collection, .. }
            | Statement::Delete { collection, .. }
            | Statement::Scan { collection } => collection,
        }
    }

    /// True for statements that modify the store
    pub fn is_write(&self) -> bool {
        matches!(self, Statement::Put { .. } | Statement::Delete { .. })
    }
}

/// Result of executing a statement
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    /// Number of documents written or removed
    Affected(u64),
    Document(Option<serde_json::Value>),
    /// (key, document) pairs ordered by key
    Documents(Vec<(String, serde_json::Value)>),
}

impl StatementOutcome {
    pub fn rows_affected(&self) -> u64 {
        match self {
            StatementOutcome::Affected(n) => *n,
            _ => 0,
        }
    }

    pub fn into_document(self) -> Option<serde_json::Value> {
        match self {
            StatementOutcome::Document(doc) => doc,
            _ => None,
        }
    }

    pub fn into_documents(self) -> Vec<(String, serde_json::Value)> {
        match self {
            StatementOutcome::Documents(docs) => docs,
            _ => Vec::new(),
        }
    }
}

/// One live physical transaction on an exclusively owned connection
#[async_trait]
pub trait PhysicalConnection: Send {
    /// Execute a statement inside this transaction
    async fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome>;

    /// Create a named savepoint
    async fn create_savepoint(&mut self, name: &str) -> Result<()>;

    /// Undo everything written since the savepoint (the savepoint stays)
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    /// Forget the savepoint, keeping its writes
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Source of independent physical transactions
#[async_trait]
pub trait TransactionalResource: Send + Sync {
    /// Begin a new physical transaction on its own connection
    ///
    /// # Errors
    /// - TxError::ResourceExhausted if no independent connection is available
    /// - TxError::Resource if the store refuses to begin
    async fn begin(&self) -> Result<Box<dyn PhysicalConnection>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::TxError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Physical call recorded by the mock, tagged with the connection number (1-based)
    #[derive(Debug, Clone, PartialEq)]
    pub enum ResourceEvent {
        Begin(usize),
        Execute(usize, Statement),
        Savepoint(usize, String),
        RollbackToSavepoint(usize, String),
        ReleaseSavepoint(usize, String),
        Commit(usize),
        Rollback(usize),
    }

    #[derive(Default)]
    struct Shared {
        journal: Mutex<Vec<ResourceEvent>>,
        opened: AtomicUsize,
        open_now: AtomicUsize,
        fail_commit: Mutex<bool>,
        fail_rollback: Mutex<bool>,
    }

    impl Shared {
        fn record(&self, event: ResourceEvent) {
            self.journal.lock().unwrap().push(event);
        }
    }

    /// Mock resource recording every physical call
    #[derive(Clone, Default)]
    pub struct MockResource {
        shared: Arc<Shared>,
        max_connections: Option<usize>,
    }

    impl MockResource {
        pub fn new() -> Self {
            Self::default()
        }

        /// Refuse to open more than `max` concurrent connections
        pub fn with_max_connections(max: usize) -> Self {
            Self {
                shared: Arc::default(),
                max_connections: Some(max),
            }
        }

        /// Make every subsequent physical commit fail
        pub fn fail_commits(&self, fail: bool) {
            *self.shared.fail_commit.lock().unwrap() = fail;
        }

        /// Make every subsequent physical rollback fail
        pub fn fail_rollbacks(&self, fail: bool) {
            *self.shared.fail_rollback.lock().unwrap() = fail;
        }

        pub fn events(&self) -> Vec<ResourceEvent> {
            self.shared.journal.lock().unwrap().clone()
        }

        pub fn begin_count(&self) -> usize {
            self.count(|e| matches!(e, ResourceEvent::Begin(_)))
        }

        pub fn commit_count(&self) -> usize {
            self.count(|e| matches!(e, ResourceEvent::Commit(_)))
        }

        pub fn rollback_count(&self) -> usize {
            self.count(|e| matches!(e, ResourceEvent::Rollback(_)))
        }

        /// Connections currently checked out
        pub fn open_connections(&self) -> usize {
            self.shared.open_now.load(Ordering::SeqCst)
        }

        fn count(&self, pred: impl Fn(&ResourceEvent) -> bool) -> usize {
            self.shared
                .journal
                .lock()
                .unwrap()
                .iter()
                .filter(|e| pred(e))
                .count()
        }
    }

    #[async_trait]
    impl TransactionalResource for MockResource {
        async fn begin(&self) -> Result<Box<dyn PhysicalConnection>> {
            if let Some(max) = self.max_connections {
                if self.shared.open_now.load(Ordering::SeqCst) >= max {
                    return Err(TxError::ResourceExhausted(format!(
                        "mock resource allows {} connection(s)",
                        max
                    )));
                }
            }
            self.shared.open_now.fetch_add(1, Ordering::SeqCst);
            let number = self.shared.opened.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.record(ResourceEvent::Begin(number));
            Ok(Box::new(MockConnection {
                number,
                shared: self.shared.clone(),
            }))
        }
    }

    /// Connection handed out by MockResource
    pub struct MockConnection {
        number: usize,
        shared: Arc<Shared>,
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.shared.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PhysicalConnection for MockConnection {
        async fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome> {
            self.shared
                .record(ResourceEvent::Execute(self.number, statement.clone()));
            Ok(match statement {
                Statement::Put { .. } | Statement::Delete { .. } => StatementOutcome::Affected(1),
                Statement::Get { .. } => StatementOutcome::Document(None),
                Statement::Scan { .. } => StatementOutcome::Documents(Vec::new()),
            })
        }

        async fn create_savepoint(&mut self, name: &str) -> Result<()> {
            self.shared
                .record(ResourceEvent::Savepoint(self.number, name.to_string()));
            Ok(())
        }

        async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
            self.shared.record(ResourceEvent::RollbackToSavepoint(
                self.number,
                name.to_string(),
            ));
            Ok(())
        }

        async fn release_savepoint(&mut self, name: &str) -> Result<()> {
            self.shared
                .record(ResourceEvent::ReleaseSavepoint(self.number, name.to_string()));
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            if *self.shared.fail_commit.lock().unwrap() {
                return Err(TxError::Resource(format!(
                    "mock commit failure on connection {}",
                    self.number
                )));
            }
            self.shared.record(ResourceEvent::Commit(self.number));
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            if *self.shared.fail_rollback.lock().unwrap() {
                return Err(TxError::Resource(format!(
                    "mock rollback failure on connection {}",
                    self.number
                )));
            }
            self.shared.record(ResourceEvent::Rollback(self.number));
            Ok(())
        }
    }
}
