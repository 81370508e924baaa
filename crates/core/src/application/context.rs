// Transaction Synchronization Registry (call-scoped)

use crate::domain::{TransactionDefinition, TransactionId};
use crate::error::{Result, TxError};
use crate::port::{PhysicalConnection, Statement, StatementOutcome};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Liveness token held by an open `TransactionStatus`
pub(crate) type ScopeToken = Arc<()>;

/// Role of one logical transaction on a physical transaction
#[derive(Debug)]
pub(crate) enum ScopeKind {
    /// Created the physical transaction, possibly suspending another one
    Owner { suspended: Option<TransactionId> },
    Participant,
    /// Rollback-only state at savepoint creation is restored on rollback to it
    Savepoint {
        name: String,
        rollback_only_before: bool,
    },
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    holder: Weak<()>,
}

impl Scope {
    /// The status was dropped without commit or rollback
    fn is_abandoned(&self) -> bool {
        self.holder.strong_count() == 0
    }
}

/// A live physical transaction: one resource connection plus its shared flags.
///
/// Owned by the registry, both while active and while parked by REQUIRES_NEW.
pub struct PhysicalTransaction {
    id: TransactionId,
    name: Option<String>,
    read_only: bool,
    rollback_only: bool,
    started_at: i64, // epoch ms
    savepoint_counter: u32,
    scopes: Vec<Scope>,
    connection: Box<dyn PhysicalConnection>,
}

impl PhysicalTransaction {
    pub(crate) fn new(
        id: TransactionId,
        definition: &TransactionDefinition,
        started_at: i64,
        connection: Box<dyn PhysicalConnection>,
    ) -> Self {
        Self {
            id,
            name: definition.name.clone(),
            read_only: definition.read_only,
            rollback_only: false,
            started_at,
            savepoint_counter: 0,
            scopes: Vec::new(),
            connection,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub(crate) fn connection_mut(&mut self) -> &mut dyn PhysicalConnection {
        self.connection.as_mut()
    }

    pub(crate) fn next_savepoint_name(&mut self) -> String {
        self.savepoint_counter += 1;
        format!("txnest_sp_{}", self.savepoint_counter)
    }

    pub(crate) fn into_connection(self) -> Box<dyn PhysicalConnection> {
        self.connection
    }

    /// Register a logical transaction; it stays open while the token lives
    pub(crate) fn open_scope(&mut self, kind: ScopeKind) -> ScopeToken {
        let token = Arc::new(());
        self.scopes.push(Scope {
            kind,
            holder: Arc::downgrade(&token),
        });
        token
    }

    pub(crate) fn close_scope(&mut self, token: &ScopeToken) {
        let holder = Arc::downgrade(token);
        self.scopes.retain(|scope| !Weak::ptr_eq(&scope.holder, &holder));
    }

    /// `Some(suspended)` once the owning status is gone
    fn abandoned_owner(&self) -> Option<Option<TransactionId>> {
        self.scopes.iter().find_map(|scope| match &scope.kind {
            ScopeKind::Owner { suspended } if scope.is_abandoned() => Some(suspended.clone()),
            _ => None,
        })
    }

    /// Undo abandoned participants and savepoints, innermost first, down to
    /// the first scope that is still open
    async fn unwind_abandoned_scopes(&mut self) {
        loop {
            let inner_abandoned = self.scopes.last().is_some_and(|scope| {
                scope.is_abandoned() && !matches!(scope.kind, ScopeKind::Owner { .. })
            });
            if !inner_abandoned {
                return;
            }
            let Some(scope) = self.scopes.pop() else {
                return;
            };

            match scope.kind {
                ScopeKind::Participant => {
                    warn!(tx_id = %self.id, "Participating transaction abandoned - marking existing transaction as rollback-only");
                    self.rollback_only = true;
                }
                ScopeKind::Savepoint {
                    name,
                    rollback_only_before,
                } => {
                    warn!(tx_id = %self.id, savepoint = %name, "Nested transaction abandoned - rolling back to savepoint");
                    let rolled_back = match self.connection.rollback_to_savepoint(&name).await {
                        Ok(()) => self.connection.release_savepoint(&name).await,
                        Err(err) => Err(err),
                    };
                    match rolled_back {
                        Ok(()) => self.rollback_only = rollback_only_before,
                        Err(err) => {
                            error!(tx_id = %self.id, savepoint = %name, error = %err, "Rollback to savepoint failed");
                            self.rollback_only = true;
                        }
                    }
                }
                ScopeKind::Owner { .. } => return,
            }
        }
    }
}

impl std::fmt::Debug for PhysicalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalTransaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("rollback_only", &self.rollback_only)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Registry state behind the context handle
#[derive(Debug, Default)]
pub(crate) struct Registry {
    active: Option<PhysicalTransaction>,
    /// Parked by REQUIRES_NEW, most recent last
    suspended: Vec<PhysicalTransaction>,
}

impl Registry {
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn active(&self) -> Option<&PhysicalTransaction> {
        self.active.as_ref()
    }

    pub(crate) fn active_mut(&mut self) -> Option<&mut PhysicalTransaction> {
        self.active.as_mut()
    }

    pub(crate) fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|tx| tx.id())
    }

    pub(crate) fn is_rollback_only(&self) -> bool {
        self.active.as_ref().is_some_and(|tx| tx.rollback_only)
    }

    pub(crate) fn mark_rollback_only(&mut self) -> Result<()> {
        match self.active.as_mut() {
            Some(tx) => {
                tx.rollback_only = true;
                Ok(())
            }
            None => Err(TxError::IllegalTransactionState(
                "Cannot mark rollback-only: no active transaction".to_string(),
            )),
        }
    }

    /// Put the rollback-only mark back to its state before a savepoint
    pub(crate) fn reset_rollback_only(&mut self, marked_before: bool) {
        if let Some(tx) = self.active.as_mut() {
            tx.rollback_only = marked_before;
        }
    }

    pub(crate) fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    pub(crate) fn push(&mut self, tx: PhysicalTransaction) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(TxError::IllegalTransactionState(format!(
                "Transaction {} is already active; cannot activate {}",
                active.id, tx.id
            )));
        }
        self.active = Some(tx);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<PhysicalTransaction> {
        self.active.take()
    }

    /// Park the active transaction so an independent one can start
    pub(crate) fn suspend(&mut self) -> Result<TransactionId> {
        let tx = self.pop().ok_or_else(|| {
            TxError::IllegalTransactionState("No active transaction to suspend".to_string())
        })?;
        let id = tx.id.clone();
        self.suspended.push(tx);
        Ok(id)
    }

    /// Re-activate the most recently parked transaction, which must be `expected`
    pub(crate) fn resume(&mut self, expected: &str) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(TxError::IllegalTransactionState(format!(
                "Transaction {} is still active; cannot resume {}",
                active.id, expected
            )));
        }
        match self.suspended.last() {
            Some(tx) if tx.id == expected => {
                self.active = self.suspended.pop();
                Ok(())
            }
            Some(tx) => Err(TxError::IllegalTransactionState(format!(
                "Cannot resume {}: {} was suspended after it",
                expected, tx.id
            ))),
            None => Err(TxError::IllegalTransactionState(format!(
                "No suspended transaction {} to resume",
                expected
            ))),
        }
    }

    /// Unwind logical transactions whose status was dropped without commit or
    /// rollback, e.g. by a cancelled future.
    ///
    /// An abandoned owner rolls back physically and its suspended transaction
    /// is resumed; abandoned savepoints and participants are undone on the
    /// transaction that becomes active.
    pub(crate) async fn unwind_abandoned(&mut self) {
        loop {
            let suspended = match self.active.as_ref().map(PhysicalTransaction::abandoned_owner) {
                Some(Some(suspended)) => suspended,
                Some(None) => break,
                None => return,
            };
            if let Some(tx) = self.active.take() {
                warn!(tx_id = %tx.id, "Transaction abandoned before completion - rolling back");
                let tx_id = tx.id.clone();
                if let Err(err) = tx.into_connection().rollback().await {
                    error!(tx_id = %tx_id, error = %err, "Physical rollback failed");
                }
            }
            if let Some(parked) = suspended {
                debug!(tx_id = %parked, "Resuming suspended transaction");
                if let Err(err) = self.resume(&parked) {
                    error!(tx_id = %parked, error = %err, "Could not resume suspended transaction");
                    return;
                }
            }
        }

        if let Some(tx) = self.active.as_mut() {
            tx.unwind_abandoned_scopes().await;
        }
    }
}

/// Call-scoped transaction registry.
///
/// Create one per logical call path (request, task) and pass it explicitly
/// through every transactional operation. Clones share state and belong to
/// the same call path; driving one context from concurrently running tasks is
/// unsupported and surfaces as `IllegalTransactionState` on completion.
#[derive(Clone, Default)]
pub struct TransactionContext {
    inner: Arc<Mutex<Registry>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().await
    }

    /// Is a physical transaction active on this call path?
    pub async fn is_active(&self) -> bool {
        self.lock().await.is_active()
    }

    /// Has the active physical transaction been marked rollback-only?
    pub async fn is_rollback_only(&self) -> bool {
        self.lock().await.is_rollback_only()
    }

    /// Force the active physical transaction to roll back
    pub async fn mark_rollback_only(&self) -> Result<()> {
        self.lock().await.mark_rollback_only()
    }

    pub async fn is_read_only(&self) -> bool {
        self.lock()
            .await
            .active()
            .is_some_and(PhysicalTransaction::is_read_only)
    }

    /// ID of the active physical transaction
    pub async fn current_transaction_id(&self) -> Option<TransactionId> {
        self.lock().await.active_id().map(str::to_string)
    }

    pub async fn current_transaction_name(&self) -> Option<String> {
        self.lock()
            .await
            .active()
            .and_then(|tx| tx.name().map(str::to_string))
    }

    /// Number of physical transactions parked by REQUIRES_NEW on this call path
    pub async fn suspended_count(&self) -> usize {
        self.lock().await.suspended_count()
    }

    /// Activate a physical transaction; fails if one is already active
    pub async fn push(&self, tx: PhysicalTransaction) -> Result<()> {
        self.lock().await.push(tx)
    }

    /// Detach the active physical transaction, if any
    pub async fn pop(&self) -> Option<PhysicalTransaction> {
        self.lock().await.pop()
    }

    /// Execute a statement on the active physical transaction
    ///
    /// # Errors
    /// - TxError::IllegalTransactionState if no transaction is active
    /// - TxError::ReadOnlyViolation for writes inside a read-only transaction
    pub async fn execute(&self, statement: &Statement) -> Result<StatementOutcome> {
        let mut registry = self.lock().await;
        registry.unwind_abandoned().await;
        let tx = registry.active_mut().ok_or_else(|| {
            TxError::IllegalTransactionState(format!(
                "No active transaction for statement on '{}'",
                statement.collection()
            ))
        })?;

        if tx.read_only && statement.is_write() {
            return Err(TxError::ReadOnlyViolation(format!(
                "write to '{}' inside read-only transaction {}",
                statement.collection(),
                tx.id
            )));
        }

        debug!(
            tx_id = %tx.id,
            collection = %statement.collection(),
            write = statement.is_write(),
            "Executing statement"
        );
        tx.connection.execute(statement).await
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext").finish_non_exhaustive()
    }
}
