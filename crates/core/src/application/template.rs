// Unit-of-Work Wrapper
//
// Explicit decorator around a unit of work: begin, run, commit or roll back.
// Every caller that wants transactional behavior goes through `execute`;
// there is no interception layer a same-object call could bypass.

use crate::application::coordinator::TransactionCoordinator;
use crate::application::context::TransactionContext;
use crate::domain::TransactionDefinition;
use crate::error::TxError;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// Broad classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected, recoverable business outcome (commits by default)
    Business,
    /// System fault (rolls back by default)
    Fault,
}

/// Errors a unit of work can return through the wrapper
pub trait TransactionalError: From<TxError> + std::fmt::Display {
    fn failure_class(&self) -> FailureClass;

    /// Stable category name used by `RollbackPolicy` rules
    fn category(&self) -> &str;
}

impl TransactionalError for TxError {
    fn failure_class(&self) -> FailureClass {
        FailureClass::Fault
    }

    fn category(&self) -> &str {
        match self {
            TxError::IllegalTransactionState(_) => "illegal_transaction_state",
            TxError::UnexpectedRollback(_) => "unexpected_rollback",
            TxError::ResourceExhausted(_) => "resource_exhausted",
            TxError::ReadOnlyViolation(_) => "read_only_violation",
            TxError::Resource(_) => "resource",
            TxError::Domain(_) => "domain",
        }
    }
}

/// Which failures trigger rollback
///
/// Rule order: `no_rollback_for` wins, then `rollback_for`, then the default
/// (faults roll back, business errors commit).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackPolicy {
    rollback_for: HashSet<String>,
    no_rollback_for: HashSet<String>,
    rollback_on_business: bool,
}

impl RollbackPolicy {
    /// Roll back on every error, business or fault
    pub fn on_any_error() -> Self {
        Self {
            rollback_on_business: true,
            ..Self::default()
        }
    }

    pub fn rollback_for(mut self, category: impl Into<String>) -> Self {
        self.rollback_for.insert(category.into());
        self
    }

    pub fn no_rollback_for(mut self, category: impl Into<String>) -> Self {
        self.no_rollback_for.insert(category.into());
        self
    }

    pub fn rolls_back<E: TransactionalError>(&self, err: &E) -> bool {
        let category = err.category();
        if self.no_rollback_for.contains(category) {
            return false;
        }
        if self.rollback_for.contains(category) {
            return true;
        }
        match err.failure_class() {
            FailureClass::Fault => true,
            FailureClass::Business => self.rollback_on_business,
        }
    }
}

/// Transactional decorator for units of work
#[derive(Clone)]
pub struct TransactionTemplate {
    coordinator: Arc<TransactionCoordinator>,
    definition: TransactionDefinition,
    policy: RollbackPolicy,
}

impl TransactionTemplate {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        definition: impl Into<TransactionDefinition>,
    ) -> Self {
        Self {
            coordinator,
            definition: definition.into(),
            policy: RollbackPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    pub fn policy(&self) -> &RollbackPolicy {
        &self.policy
    }

    /// Run `work` inside a logical transaction
    ///
    /// - `Ok` → commit (which may still fail with `UnexpectedRollback`)
    /// - error matching the policy → rollback, original error returned unchanged
    /// - other error → commit; a failing commit replaces the error
    /// - panic → rollback, then the panic resumes
    /// - future dropped mid-way → unwound by the next call on `ctx`
    pub async fn execute<T, E, F, Fut>(&self, ctx: &TransactionContext, work: F) -> Result<T, E>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransactionalError,
    {
        let status = self
            .coordinator
            .begin(ctx, self.definition.clone())
            .await?;

        let outcome = AssertUnwindSafe(work(ctx.clone())).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                self.coordinator.commit(ctx, status).await?;
                Ok(value)
            }
            Ok(Err(err)) if self.policy.rolls_back(&err) => {
                debug!(
                    definition = %self.definition,
                    category = err.category(),
                    "Unit of work failed, rolling back"
                );
                if let Err(rollback_err) = self.coordinator.rollback(ctx, status).await {
                    error!(
                        error = %err,
                        rollback_error = %rollback_err,
                        "Rollback after failure also failed; returning original error"
                    );
                }
                Err(err)
            }
            Ok(Err(err)) => {
                debug!(
                    definition = %self.definition,
                    category = err.category(),
                    "Unit of work failed with non-rollback error, committing"
                );
                match self.coordinator.commit(ctx, status).await {
                    Ok(()) => Err(err),
                    Err(commit_err) => {
                        error!(
                            error = %err,
                            commit_error = %commit_err,
                            "Application error overridden by commit failure"
                        );
                        Err(E::from(commit_err))
                    }
                }
            }
            Err(panic) => {
                error!(definition = %self.definition, "Unit of work panicked, rolling back");
                if let Err(rollback_err) = self.coordinator.rollback(ctx, status).await {
                    error!(rollback_error = %rollback_err, "Rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Run `work` through `template` when given, otherwise directly in the caller's transaction
pub async fn run_in<T, E, F, Fut>(
    template: Option<&TransactionTemplate>,
    ctx: &TransactionContext,
    work: F,
) -> Result<T, E>
where
    F: FnOnce(TransactionContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransactionalError,
{
    match template {
        Some(template) => template.execute(ctx, work).await,
        None => work(ctx.clone()).await,
    }
}
