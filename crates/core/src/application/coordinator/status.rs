// Logical transaction status

use crate::application::context::ScopeToken;
use crate::domain::{TransactionDefinition, TransactionId};

/// How a logical transaction relates to its physical transaction
pub(super) enum StatusKind {
    /// Created the physical transaction; resumes `suspended` when done
    New { suspended: Option<TransactionId> },
    /// Joined the ambient physical transaction
    Participant,
    /// Savepoint inside the ambient physical transaction
    Savepoint {
        name: String,
        rollback_only_before: bool,
    },
}

/// One logical transaction, handed out by `TransactionCoordinator::begin`.
///
/// Consumed by `commit`/`rollback`, so a status can only be completed once.
/// A status dropped without completion is unwound by the next coordinator
/// call (or statement) on its context.
#[must_use = "a transaction status must be committed or rolled back"]
pub struct TransactionStatus {
    pub(super) transaction_id: TransactionId,
    pub(super) definition: TransactionDefinition,
    pub(super) kind: StatusKind,
    pub(super) rollback_only: bool,
    pub(super) parent: Option<TransactionId>,
    pub(super) scope: ScopeToken,
}

impl TransactionStatus {
    pub(super) fn new_owner(
        transaction_id: TransactionId,
        definition: TransactionDefinition,
        suspended: Option<TransactionId>,
        scope: ScopeToken,
    ) -> Self {
        Self {
            transaction_id,
            definition,
            parent: suspended.clone(),
            kind: StatusKind::New { suspended },
            rollback_only: false,
            scope,
        }
    }

    pub(super) fn participant(
        transaction_id: TransactionId,
        definition: TransactionDefinition,
        scope: ScopeToken,
    ) -> Self {
        Self {
            parent: Some(transaction_id.clone()),
            transaction_id,
            definition,
            kind: StatusKind::Participant,
            rollback_only: false,
            scope,
        }
    }

    pub(super) fn savepoint(
        transaction_id: TransactionId,
        name: String,
        rollback_only_before: bool,
        definition: TransactionDefinition,
        scope: ScopeToken,
    ) -> Self {
        Self {
            parent: Some(transaction_id.clone()),
            transaction_id,
            definition,
            kind: StatusKind::Savepoint {
                name,
                rollback_only_before,
            },
            rollback_only: false,
            scope,
        }
    }

    /// ID of the physical transaction this status uses
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Did this logical transaction create its physical transaction?
    pub fn is_new_transaction(&self) -> bool {
        matches!(self.kind, StatusKind::New { .. })
    }

    pub fn has_savepoint(&self) -> bool {
        matches!(self.kind, StatusKind::Savepoint { .. })
    }

    /// Did this logical transaction park the previously active physical transaction?
    pub fn has_suspended(&self) -> bool {
        matches!(self.kind, StatusKind::New { suspended: Some(_) })
    }

    pub fn suspended_transaction_id(&self) -> Option<&str> {
        match &self.kind {
            StatusKind::New {
                suspended: Some(id),
            } => Some(id),
            _ => None,
        }
    }

    /// Local rollback-only flag (set by the owning code, not by participants)
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Request rollback as the outcome of this logical transaction
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Physical transaction that was ambient when this status was created (diagnostics only)
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }
}

impl std::fmt::Debug for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("transaction_id", &self.transaction_id)
            .field("definition", &self.definition.to_string())
            .field("new_transaction", &self.is_new_transaction())
            .field("savepoint", &self.has_savepoint())
            .field("suspended", &self.suspended_transaction_id())
            .field("rollback_only", &self.rollback_only)
            .field("parent", &self.parent)
            .finish()
    }
}
