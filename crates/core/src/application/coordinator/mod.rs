// Propagation Coordinator
//
// Decides per logical transaction whether to join, suspend-and-replace, or
// start the physical transaction, and turns participant failures into
// rollback-only marks on the shared physical transaction.

pub mod config;
pub mod status;

pub use config::CoordinatorConfig;
pub use status::TransactionStatus;

use crate::application::context::{PhysicalTransaction, Registry, ScopeKind, TransactionContext};
use crate::domain::{Propagation, TransactionDefinition};
use crate::error::{Result, TxError};
use crate::port::{IdProvider, TimeProvider, TransactionalResource};
use status::StatusKind;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Propagation coordinator.
///
/// Public surface is exactly `begin`, `commit` and `rollback`; every call takes
/// the caller's `TransactionContext` explicitly.
pub struct TransactionCoordinator {
    resource: Arc<dyn TransactionalResource>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    config: CoordinatorConfig,
}

impl TransactionCoordinator {
    pub fn new(
        resource: Arc<dyn TransactionalResource>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            resource,
            id_provider,
            time_provider,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Open a logical transaction according to its propagation behavior
    ///
    /// # Errors
    /// - TxError::IllegalTransactionState for MANDATORY without an ambient
    ///   transaction, or a failed read-only validation
    /// - TxError::ResourceExhausted if a new physical transaction cannot get a connection
    pub async fn begin(
        &self,
        ctx: &TransactionContext,
        definition: impl Into<TransactionDefinition>,
    ) -> Result<TransactionStatus> {
        let definition = definition.into();
        let mut registry = ctx.lock().await;
        registry.unwind_abandoned().await;

        if registry.is_active() {
            return self.handle_existing_transaction(&mut registry, definition).await;
        }

        match definition.propagation {
            Propagation::Mandatory => Err(TxError::IllegalTransactionState(format!(
                "No existing transaction found for transaction marked with propagation '{}'",
                definition.propagation
            ))),
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested => {
                debug!(definition = %definition, "Creating new transaction");
                let mut tx = self.open_physical(&definition).await?;
                let id = tx.id().to_string();
                let scope = tx.open_scope(ScopeKind::Owner { suspended: None });
                registry.push(tx)?;
                Ok(TransactionStatus::new_owner(id, definition, None, scope))
            }
        }
    }

    async fn handle_existing_transaction(
        &self,
        registry: &mut Registry,
        definition: TransactionDefinition,
    ) -> Result<TransactionStatus> {
        let (existing_id, existing_read_only) = match registry.active() {
            Some(tx) => (tx.id().to_string(), tx.is_read_only()),
            None => {
                return Err(TxError::IllegalTransactionState(
                    "Existing transaction vanished during begin".to_string(),
                ))
            }
        };

        match definition.propagation {
            Propagation::RequiresNew => {
                debug!(
                    suspended_tx = %existing_id,
                    definition = %definition,
                    "Suspending current transaction, creating new transaction"
                );
                let suspended = registry.suspend()?;
                match self.open_physical(&definition).await {
                    Ok(mut tx) => {
                        let id = tx.id().to_string();
                        let scope = tx.open_scope(ScopeKind::Owner {
                            suspended: Some(suspended.clone()),
                        });
                        registry.push(tx)?;
                        Ok(TransactionStatus::new_owner(id, definition, Some(suspended), scope))
                    }
                    Err(err) => {
                        warn!(
                            suspended_tx = %existing_id,
                            error = %err,
                            "Could not begin independent transaction, resuming suspended transaction"
                        );
                        registry.resume(&suspended)?;
                        Err(err)
                    }
                }
            }
            Propagation::Nested => {
                let tx = registry.active_mut().ok_or_else(|| {
                    TxError::IllegalTransactionState("No transaction for savepoint".to_string())
                })?;
                let name = tx.next_savepoint_name();
                tx.connection_mut().create_savepoint(&name).await?;
                let rollback_only_before = tx.is_rollback_only();
                let scope = tx.open_scope(ScopeKind::Savepoint {
                    name: name.clone(),
                    rollback_only_before,
                });
                debug!(tx_id = %existing_id, savepoint = %name, "Creating nested transaction");
                Ok(TransactionStatus::savepoint(
                    existing_id,
                    name,
                    rollback_only_before,
                    definition,
                    scope,
                ))
            }
            Propagation::Required | Propagation::Mandatory => {
                if self.config.validate_existing_transaction
                    && existing_read_only
                    && !definition.read_only
                {
                    return Err(TxError::IllegalTransactionState(format!(
                        "Participating transaction with definition [{}] is not marked as read-only but existing transaction {} is",
                        definition, existing_id
                    )));
                }
                let scope = registry
                    .active_mut()
                    .ok_or_else(|| missing(&existing_id))?
                    .open_scope(ScopeKind::Participant);
                debug!(tx_id = %existing_id, definition = %definition, "Participating in existing transaction");
                Ok(TransactionStatus::participant(existing_id, definition, scope))
            }
        }
    }

    /// Close a logical transaction with commit intent
    ///
    /// Rolls back instead when the status or its physical transaction is
    /// rollback-only.
    ///
    /// # Errors
    /// - TxError::UnexpectedRollback if the owner commits a transaction a participant marked rollback-only
    /// - TxError::IllegalTransactionState if the status is not the active transaction
    pub async fn commit(&self, ctx: &TransactionContext, status: TransactionStatus) -> Result<()> {
        let mut registry = ctx.lock().await;
        registry.unwind_abandoned().await;
        verify_active(&registry, &status)?;

        if status.is_rollback_only() {
            debug!(tx_id = %status.transaction_id, "Transactional code has requested rollback");
            return self.process_rollback(&mut registry, status, false).await;
        }

        if registry.is_rollback_only() {
            debug!(
                tx_id = %status.transaction_id,
                "Global transaction is marked as rollback-only but transactional code requested commit"
            );
            return self.process_rollback(&mut registry, status, true).await;
        }

        self.process_commit(&mut registry, status).await
    }

    /// Close a logical transaction with rollback intent
    ///
    /// # Errors
    /// - TxError::IllegalTransactionState if the status is not the active transaction
    pub async fn rollback(
        &self,
        ctx: &TransactionContext,
        status: TransactionStatus,
    ) -> Result<()> {
        let mut registry = ctx.lock().await;
        registry.unwind_abandoned().await;
        verify_active(&registry, &status)?;
        self.process_rollback(&mut registry, status, false).await
    }

    async fn process_commit(
        &self,
        registry: &mut Registry,
        status: TransactionStatus,
    ) -> Result<()> {
        close_scope(registry, &status);
        let tx_id = status.transaction_id;
        match status.kind {
            StatusKind::Participant => {
                // Owner decides the physical outcome
                debug!(tx_id = %tx_id, "Participant commit, leaving physical transaction open");
                Ok(())
            }
            StatusKind::Savepoint { name, .. } => {
                debug!(tx_id = %tx_id, savepoint = %name, "Releasing transaction savepoint");
                active_tx(registry, &tx_id)?
                    .connection_mut()
                    .release_savepoint(&name)
                    .await
            }
            StatusKind::New { suspended } => {
                let tx = registry.pop().ok_or_else(|| missing(&tx_id))?;
                let result = self.commit_physical(tx).await;
                resume_after_completion(registry, &tx_id, result, suspended.as_deref())
            }
        }
    }

    async fn process_rollback(
        &self,
        registry: &mut Registry,
        status: TransactionStatus,
        unexpected: bool,
    ) -> Result<()> {
        close_scope(registry, &status);
        let tx_id = status.transaction_id;
        match status.kind {
            StatusKind::Participant => {
                warn!(
                    tx_id = %tx_id,
                    "Participating transaction failed - marking existing transaction as rollback-only"
                );
                registry.mark_rollback_only()?;
                if unexpected && self.config.fail_early_on_global_rollback_only {
                    return Err(TxError::UnexpectedRollback(format!(
                        "Transaction {} has been marked as rollback-only",
                        tx_id
                    )));
                }
                Ok(())
            }
            StatusKind::Savepoint {
                name,
                rollback_only_before,
            } => {
                debug!(tx_id = %tx_id, savepoint = %name, "Rolling back transaction to savepoint");
                let connection = active_tx(registry, &tx_id)?.connection_mut();
                connection.rollback_to_savepoint(&name).await?;
                // Marks set inside the savepoint are undone with its work
                registry.reset_rollback_only(rollback_only_before);
                active_tx(registry, &tx_id)?
                    .connection_mut()
                    .release_savepoint(&name)
                    .await?;

                if unexpected {
                    warn!(tx_id = %tx_id, savepoint = %name, "Commit requested on rollback-only transaction; rolled back to savepoint");
                    return Err(TxError::UnexpectedRollback(format!(
                        "Nested transaction in {} rolled back to savepoint {} because it has been marked as rollback-only",
                        tx_id, name
                    )));
                }
                Ok(())
            }
            StatusKind::New { suspended } => {
                let tx = registry.pop().ok_or_else(|| missing(&tx_id))?;
                let result = self.rollback_physical(tx).await;
                resume_after_completion(registry, &tx_id, result, suspended.as_deref())?;

                if unexpected {
                    warn!(tx_id = %tx_id, "Commit requested on rollback-only transaction; rolled back");
                    return Err(TxError::UnexpectedRollback(format!(
                        "Transaction {} rolled back because it has been marked as rollback-only",
                        tx_id
                    )));
                }
                Ok(())
            }
        }
    }

    async fn open_physical(&self, definition: &TransactionDefinition) -> Result<PhysicalTransaction> {
        let connection = self.resource.begin().await?;
        let tx = PhysicalTransaction::new(
            self.id_provider.generate_id(),
            definition,
            self.time_provider.now_millis(),
            connection,
        );
        info!(
            tx_id = %tx.id(),
            definition = %definition,
            "Began physical transaction"
        );
        Ok(tx)
    }

    async fn commit_physical(&self, tx: PhysicalTransaction) -> Result<()> {
        let tx_id = tx.id().to_string();
        let duration_ms = self.time_provider.now_millis() - tx.started_at();
        match tx.into_connection().commit().await {
            Ok(()) => {
                info!(tx_id = %tx_id, duration_ms, "Committed physical transaction");
                Ok(())
            }
            Err(err) => {
                error!(tx_id = %tx_id, error = %err, "Physical commit failed");
                Err(err)
            }
        }
    }

    async fn rollback_physical(&self, tx: PhysicalTransaction) -> Result<()> {
        let tx_id = tx.id().to_string();
        let duration_ms = self.time_provider.now_millis() - tx.started_at();
        match tx.into_connection().rollback().await {
            Ok(()) => {
                info!(tx_id = %tx_id, duration_ms, "Rolled back physical transaction");
                Ok(())
            }
            Err(err) => {
                error!(tx_id = %tx_id, error = %err, "Physical rollback failed");
                Err(err)
            }
        }
    }
}

/// The status must belong to the physical transaction active on this call path
fn verify_active(registry: &Registry, status: &TransactionStatus) -> Result<()> {
    match registry.active_id() {
        Some(active) if active == status.transaction_id => Ok(()),
        Some(active) => Err(TxError::IllegalTransactionState(format!(
            "Transaction {} is not the active transaction (active: {}); completion out of order",
            status.transaction_id, active
        ))),
        None => Err(missing(&status.transaction_id)),
    }
}

fn active_tx<'a>(registry: &'a mut Registry, tx_id: &str) -> Result<&'a mut PhysicalTransaction> {
    registry.active_mut().ok_or_else(|| missing(tx_id))
}

fn missing(tx_id: &str) -> TxError {
    TxError::IllegalTransactionState(format!(
        "Physical transaction {} is absent or already completed",
        tx_id
    ))
}

fn close_scope(registry: &mut Registry, status: &TransactionStatus) {
    if let Some(tx) = registry.active_mut() {
        tx.close_scope(&status.scope);
    }
}

fn resume_if_parked(registry: &mut Registry, suspended: Option<&str>) -> Result<()> {
    if let Some(id) = suspended {
        debug!(tx_id = %id, "Resuming suspended transaction");
        registry.resume(id)?;
    }
    Ok(())
}

/// Resume whatever the physical outcome was; a failed resume wins, with the
/// physical failure logged first
fn resume_after_completion(
    registry: &mut Registry,
    tx_id: &str,
    outcome: Result<()>,
    suspended: Option<&str>,
) -> Result<()> {
    match resume_if_parked(registry, suspended) {
        Ok(()) => outcome,
        Err(resume_err) => {
            if let Err(err) = outcome {
                error!(
                    tx_id = %tx_id,
                    error = %err,
                    resume_error = %resume_err,
                    "Physical completion failed and suspended transaction could not be resumed"
                );
            }
            Err(resume_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::time_provider::mocks::MockTimeProvider;
    use crate::port::transaction::mocks::{MockResource, ResourceEvent};
    use crate::port::Statement;
    use serde_json::json;

    fn setup() -> (TransactionCoordinator, MockResource) {
        let resource = MockResource::new();
        let coordinator = TransactionCoordinator::new(
            Arc::new(resource.clone()),
            Arc::new(SequentialIdProvider::new("tx")),
            Arc::new(MockTimeProvider::new(1_000)),
        );
        (coordinator, resource)
    }

    #[tokio::test]
    async fn test_single_commit() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let status = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        assert!(status.is_new_transaction());
        assert!(ctx.is_active().await);

        coordinator.commit(&ctx, status).await.unwrap();
        assert!(!ctx.is_active().await);
        assert_eq!(resource.events(), vec![ResourceEvent::Begin(1), ResourceEvent::Commit(1)]);
    }

    #[tokio::test]
    async fn test_single_rollback() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let status = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.rollback(&ctx, status).await.unwrap();
        assert_eq!(resource.events(), vec![ResourceEvent::Begin(1), ResourceEvent::Rollback(1)]);
    }

    #[tokio::test]
    async fn test_sequential_transactions_use_separate_physical_units() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let first = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.commit(&ctx, first).await.unwrap();

        let second = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        assert!(second.is_new_transaction());
        assert_eq!(second.transaction_id(), "tx-2");
        coordinator.rollback(&ctx, second).await.unwrap();

        assert_eq!(resource.begin_count(), 2);
        assert_eq!(resource.commit_count(), 1);
        assert_eq!(resource.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_only_first_required_is_new() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let mut inners = Vec::new();
        for _ in 0..5 {
            inners.push(coordinator.begin(&ctx, Propagation::Required).await.unwrap());
        }

        assert!(outer.is_new_transaction());
        for inner in &inners {
            assert!(!inner.is_new_transaction());
            assert_eq!(inner.transaction_id(), outer.transaction_id());
        }
        assert_eq!(resource.begin_count(), 1);

        for inner in inners.into_iter().rev() {
            coordinator.commit(&ctx, inner).await.unwrap();
        }
        coordinator.commit(&ctx, outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_participant_commit_is_physical_noop() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::Required).await.unwrap();

        coordinator.commit(&ctx, inner).await.unwrap();
        assert_eq!(resource.commit_count(), 0);
        assert_eq!(resource.rollback_count(), 0);
        assert!(ctx.is_active().await);

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(resource.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_outer_rollback_after_inner_commit() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.commit(&ctx, inner).await.unwrap();
        coordinator.rollback(&ctx, outer).await.unwrap();

        assert_eq!(resource.commit_count(), 0);
        assert_eq!(resource.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_inner_rollback_marks_rollback_only() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::Required).await.unwrap();

        coordinator.rollback(&ctx, inner).await.unwrap();
        assert_eq!(resource.rollback_count(), 0, "participant must not roll back physically");
        assert!(ctx.is_rollback_only().await);

        let result = coordinator.commit(&ctx, outer).await;
        assert!(matches!(result, Err(TxError::UnexpectedRollback(_))));
        assert_eq!(resource.commit_count(), 0);
        assert_eq!(resource.rollback_count(), 1);
        assert!(!ctx.is_active().await);
    }

    #[tokio::test]
    async fn test_participant_commit_on_rollback_only_waits_for_owner() {
        let (coordinator, _resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let failing = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.rollback(&ctx, failing).await.unwrap();

        let sibling = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        assert!(coordinator.commit(&ctx, sibling).await.is_ok());
        assert!(coordinator.commit(&ctx, outer).await.unwrap_err().is_unexpected_rollback());
    }

    #[tokio::test]
    async fn test_fail_early_on_global_rollback_only() {
        let (coordinator, _resource) = setup();
        let coordinator = coordinator.with_config(CoordinatorConfig {
            fail_early_on_global_rollback_only: true,
            ..Default::default()
        });
        assert!(coordinator.config().fail_early_on_global_rollback_only);
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let failing = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.rollback(&ctx, failing).await.unwrap();

        let sibling = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        assert!(coordinator.commit(&ctx, sibling).await.unwrap_err().is_unexpected_rollback());
        assert!(coordinator.commit(&ctx, outer).await.unwrap_err().is_unexpected_rollback());
    }

    #[tokio::test]
    async fn test_local_rollback_only_rolls_back_without_error() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let mut status = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        status.set_rollback_only();
        coordinator.commit(&ctx, status).await.unwrap();

        assert_eq!(resource.commit_count(), 0);
        assert_eq!(resource.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_requires_new_suspends_and_resumes_exact_transaction() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let outer_id = outer.transaction_id().to_string();

        let inner = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();
        assert!(inner.is_new_transaction());
        assert!(inner.has_suspended());
        assert_eq!(inner.suspended_transaction_id(), Some(outer_id.as_str()));
        assert_eq!(inner.parent(), Some(outer_id.as_str()));
        assert_ne!(inner.transaction_id(), outer_id);
        assert_eq!(ctx.current_transaction_id().await.as_deref(), Some(inner.transaction_id()));
        assert_eq!(ctx.suspended_count().await, 1);

        coordinator.commit(&ctx, inner).await.unwrap();
        assert_eq!(ctx.current_transaction_id().await, Some(outer_id));
        assert_eq!(ctx.suspended_count().await, 0);

        // Statements after resume go to the original connection
        ctx.execute(&Statement::put("logs", "a", json!({}))).await.unwrap();
        assert!(resource
            .events()
            .contains(&ResourceEvent::Execute(1, Statement::put("logs", "a", json!({})))));

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Begin(2),
                ResourceEvent::Commit(2),
                ResourceEvent::Execute(1, Statement::put("logs", "a", json!({}))),
                ResourceEvent::Commit(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_requires_new_rollback_leaves_outer_untouched() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();

        coordinator.rollback(&ctx, inner).await.unwrap();
        assert!(!ctx.is_rollback_only().await);

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Begin(2),
                ResourceEvent::Rollback(2),
                ResourceEvent::Commit(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_requires_new_without_ambient_suspends_nothing() {
        let (coordinator, _resource) = setup();
        let ctx = TransactionContext::new();

        let status = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();
        assert!(status.is_new_transaction());
        assert!(!status.has_suspended());
        assert!(status.parent().is_none());
        coordinator.commit(&ctx, status).await.unwrap();
    }

    #[tokio::test]
    async fn test_requires_new_fails_when_resource_exhausted() {
        let resource = MockResource::with_max_connections(1);
        let coordinator = TransactionCoordinator::new(
            Arc::new(resource.clone()),
            Arc::new(SequentialIdProvider::new("tx")),
            Arc::new(MockTimeProvider::new(0)),
        );
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let result = coordinator.begin(&ctx, Propagation::RequiresNew).await;
        assert!(matches!(result, Err(TxError::ResourceExhausted(_))));

        // Not downgraded to REQUIRED, and the outer transaction is back in place
        assert_eq!(ctx.current_transaction_id().await.as_deref(), Some(outer.transaction_id()));
        assert_eq!(ctx.suspended_count().await, 0);
        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(resource.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_still_resumes_suspended() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();

        resource.fail_rollbacks(true);
        assert!(matches!(
            coordinator.rollback(&ctx, inner).await,
            Err(TxError::Resource(_))
        ));
        assert_eq!(ctx.current_transaction_id().await.as_deref(), Some(outer.transaction_id()));
        assert_eq!(ctx.suspended_count().await, 0);

        resource.fail_rollbacks(false);
        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(resource.open_connections(), 0);
    }

    #[test]
    fn test_failed_resume_outranks_physical_failure() {
        let mut registry = Registry::default();

        let result = resume_after_completion(
            &mut registry,
            "tx-2",
            Err(TxError::Resource("disk full".to_string())),
            Some("tx-1"),
        );
        assert!(matches!(result, Err(TxError::IllegalTransactionState(_))));

        let result = resume_after_completion(
            &mut registry,
            "tx-2",
            Err(TxError::Resource("disk full".to_string())),
            None,
        );
        assert!(matches!(result, Err(TxError::Resource(_))));
    }

    #[tokio::test]
    async fn test_commit_failure_still_resumes_suspended() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();

        resource.fail_commits(true);
        assert!(matches!(
            coordinator.commit(&ctx, inner).await,
            Err(TxError::Resource(_))
        ));
        assert_eq!(ctx.current_transaction_id().await.as_deref(), Some(outer.transaction_id()));

        resource.fail_commits(false);
        coordinator.commit(&ctx, outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_completion_is_illegal() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();

        let result = coordinator.commit(&ctx, outer).await;
        assert!(matches!(result, Err(TxError::IllegalTransactionState(_))));

        coordinator.rollback(&ctx, inner).await.unwrap();

        // The outer status was consumed by the failed commit; nothing can
        // complete it, so the next call unwinds it instead of joining it
        let next = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        assert!(next.is_new_transaction());
        assert_eq!(resource.rollback_count(), 2);
        coordinator.commit(&ctx, next).await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_on_foreign_context_is_illegal() {
        let (coordinator, _resource) = setup();
        let ctx = TransactionContext::new();
        let other = TransactionContext::new();

        let status = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let result = coordinator.commit(&other, status).await;
        assert!(matches!(result, Err(TxError::IllegalTransactionState(_))));
    }

    #[tokio::test]
    async fn test_mandatory_requires_existing_transaction() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let result = coordinator.begin(&ctx, Propagation::Mandatory).await;
        assert!(matches!(result, Err(TxError::IllegalTransactionState(_))));
        assert_eq!(resource.begin_count(), 0);

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::Mandatory).await.unwrap();
        assert!(!inner.is_new_transaction());
        coordinator.commit(&ctx, inner).await.unwrap();
        coordinator.commit(&ctx, outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_savepoint_rollback_keeps_outer_committable() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let nested = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        assert!(nested.has_savepoint());
        assert!(!nested.is_new_transaction());

        coordinator.rollback(&ctx, nested).await.unwrap();
        assert!(!ctx.is_rollback_only().await);

        let nested = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        coordinator.commit(&ctx, nested).await.unwrap();
        coordinator.commit(&ctx, outer).await.unwrap();

        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Savepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::RollbackToSavepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::ReleaseSavepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::Savepoint(1, "txnest_sp_2".to_string()),
                ResourceEvent::ReleaseSavepoint(1, "txnest_sp_2".to_string()),
                ResourceEvent::Commit(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_savepoint_rollback_clears_mark_set_inside_nested() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let nested = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::Required).await.unwrap();

        coordinator.rollback(&ctx, inner).await.unwrap();
        assert!(ctx.is_rollback_only().await);

        coordinator.rollback(&ctx, nested).await.unwrap();
        assert!(!ctx.is_rollback_only().await);

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(resource.commit_count(), 1);
        assert_eq!(resource.rollback_count(), 0);
    }

    #[tokio::test]
    async fn test_nested_commit_on_rollback_only_rolls_back_to_savepoint() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let nested = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.rollback(&ctx, inner).await.unwrap();

        let result = coordinator.commit(&ctx, nested).await;
        assert!(result.unwrap_err().is_unexpected_rollback());
        assert!(!ctx.is_rollback_only().await);

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Savepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::RollbackToSavepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::ReleaseSavepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::Commit(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_mark_set_before_it() {
        let (coordinator, _resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let failing = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        coordinator.rollback(&ctx, failing).await.unwrap();

        let nested = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        coordinator.rollback(&ctx, nested).await.unwrap();
        assert!(ctx.is_rollback_only().await);

        assert!(coordinator.commit(&ctx, outer).await.unwrap_err().is_unexpected_rollback());
    }

    #[tokio::test]
    async fn test_abandoned_requires_new_is_unwound_before_outer_completes() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let inner = coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap();
        drop(inner);
        // Parked, not lost
        assert_eq!(ctx.suspended_count().await, 1);
        assert_eq!(resource.open_connections(), 2);

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Begin(2),
                ResourceEvent::Rollback(2),
                ResourceEvent::Commit(1),
            ]
        );
        assert_eq!(ctx.suspended_count().await, 0);
        assert_eq!(resource.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_statement_after_abandoned_requires_new_uses_outer_connection() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        drop(coordinator.begin(&ctx, Propagation::RequiresNew).await.unwrap());

        ctx.execute(&Statement::put("logs", "a", json!({}))).await.unwrap();
        assert_eq!(ctx.current_transaction_id().await.as_deref(), Some(outer.transaction_id()));
        assert!(resource
            .events()
            .contains(&ResourceEvent::Execute(1, Statement::put("logs", "a", json!({})))));
        coordinator.commit(&ctx, outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_owner_is_never_joined() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        drop(coordinator.begin(&ctx, Propagation::Required).await.unwrap());

        let status = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        assert!(status.is_new_transaction());
        assert_eq!(status.transaction_id(), "tx-2");
        coordinator.commit(&ctx, status).await.unwrap();
        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Rollback(1),
                ResourceEvent::Begin(2),
                ResourceEvent::Commit(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_abandoned_participant_marks_rollback_only() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        drop(coordinator.begin(&ctx, Propagation::Required).await.unwrap());

        assert!(coordinator.commit(&ctx, outer).await.unwrap_err().is_unexpected_rollback());
        assert_eq!(resource.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_nested_rolls_back_to_savepoint() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let outer = coordinator.begin(&ctx, Propagation::Required).await.unwrap();
        let nested = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        ctx.execute(&Statement::put("orders", "1", json!({}))).await.unwrap();
        drop(nested);

        coordinator.commit(&ctx, outer).await.unwrap();
        assert_eq!(
            resource.events(),
            vec![
                ResourceEvent::Begin(1),
                ResourceEvent::Savepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::Execute(1, Statement::put("orders", "1", json!({}))),
                ResourceEvent::RollbackToSavepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::ReleaseSavepoint(1, "txnest_sp_1".to_string()),
                ResourceEvent::Commit(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_nested_without_ambient_behaves_like_required() {
        let (coordinator, resource) = setup();
        let ctx = TransactionContext::new();

        let status = coordinator.begin(&ctx, Propagation::Nested).await.unwrap();
        assert!(status.is_new_transaction());
        assert!(!status.has_savepoint());
        coordinator.commit(&ctx, status).await.unwrap();
        assert_eq!(resource.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_validate_existing_rejects_read_write_join_of_read_only() {
        let (coordinator, _resource) = setup();
        let coordinator = coordinator.with_config(CoordinatorConfig {
            validate_existing_transaction: true,
            ..Default::default()
        });
        let ctx = TransactionContext::new();

        let outer = coordinator
            .begin(&ctx, TransactionDefinition::new(Propagation::Required).read_only())
            .await
            .unwrap();
        let result = coordinator.begin(&ctx, Propagation::Required).await;
        assert!(matches!(result, Err(TxError::IllegalTransactionState(_))));

        let reader = coordinator
            .begin(&ctx, TransactionDefinition::new(Propagation::Required).read_only())
            .await
            .unwrap();
        coordinator.commit(&ctx, reader).await.unwrap();
        coordinator.commit(&ctx, outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_name_visible_in_context() {
        let (coordinator, _resource) = setup();
        let ctx = TransactionContext::new();

        let status = coordinator
            .begin(&ctx, TransactionDefinition::new(Propagation::Required).named("OrderService.order"))
            .await
            .unwrap();
        assert_eq!(
            ctx.current_transaction_name().await.as_deref(),
            Some("OrderService.order")
        );
        coordinator.commit(&ctx, status).await.unwrap();
    }
}
