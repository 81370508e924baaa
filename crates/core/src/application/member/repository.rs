// Member & audit log repositories

use crate::application::context::TransactionContext;
use crate::application::coordinator::TransactionCoordinator;
use crate::application::documents;
use crate::application::template::{run_in, TransactionTemplate};
use crate::domain::{LogEntry, Member, Propagation, TransactionDefinition};
use crate::error::ServiceError;
use std::sync::Arc;
use tracing::{info, warn};

pub const MEMBERS: &str = "members";
pub const LOGS: &str = "logs";

/// Log messages containing this marker fail after the entry is written
pub const LOG_FAILURE_MARKER: &str = "log-failure";

fn write_template(
    coordinator: &Arc<TransactionCoordinator>,
    propagation: Option<Propagation>,
) -> Option<TransactionTemplate> {
    propagation.map(|p| TransactionTemplate::new(coordinator.clone(), p))
}

fn read_template(coordinator: Arc<TransactionCoordinator>, name: &str) -> TransactionTemplate {
    TransactionTemplate::new(
        coordinator,
        TransactionDefinition::new(Propagation::Required)
            .read_only()
            .named(name),
    )
}

/// Member store
///
/// `writes: None` makes `save` run directly in the caller's transaction.
pub struct MemberRepository {
    writes: Option<TransactionTemplate>,
    reads: TransactionTemplate,
}

impl MemberRepository {
    pub fn new(coordinator: Arc<TransactionCoordinator>, writes: Option<Propagation>) -> Self {
        Self {
            writes: write_template(&coordinator, writes),
            reads: read_template(coordinator, "MemberRepository.find"),
        }
    }

    pub async fn save(&self, ctx: &TransactionContext, member: &Member) -> Result<(), ServiceError> {
        run_in(self.writes.as_ref(), ctx, |ctx| self.insert(ctx, member)).await
    }

    pub async fn find(
        &self,
        ctx: &TransactionContext,
        username: &str,
    ) -> Result<Option<Member>, ServiceError> {
        self.reads
            .execute(ctx, |ctx| async move {
                Ok::<_, ServiceError>(documents::find(&ctx, MEMBERS, username).await?)
            })
            .await
    }

    async fn insert(&self, ctx: TransactionContext, member: &Member) -> Result<(), ServiceError> {
        info!(
            username = %member.username,
            tx_id = ?ctx.current_transaction_id().await,
            "Saving member"
        );
        documents::save(&ctx, MEMBERS, &member.username, member).await?;
        Ok(())
    }
}

/// Audit log store, keyed by message
pub struct LogRepository {
    writes: Option<TransactionTemplate>,
    reads: TransactionTemplate,
}

impl LogRepository {
    pub fn new(coordinator: Arc<TransactionCoordinator>, writes: Option<Propagation>) -> Self {
        Self {
            writes: write_template(&coordinator, writes),
            reads: read_template(coordinator, "LogRepository.find"),
        }
    }

    /// Write an entry
    ///
    /// # Errors
    /// - ServiceError::LogWriteFailed when the message carries `LOG_FAILURE_MARKER`;
    ///   the entry has already been written to the current transaction by then
    pub async fn save(&self, ctx: &TransactionContext, entry: &LogEntry) -> Result<(), ServiceError> {
        run_in(self.writes.as_ref(), ctx, |ctx| self.insert(ctx, entry)).await
    }

    pub async fn find(
        &self,
        ctx: &TransactionContext,
        message: &str,
    ) -> Result<Option<LogEntry>, ServiceError> {
        self.reads
            .execute(ctx, |ctx| async move {
                Ok::<_, ServiceError>(documents::find(&ctx, LOGS, message).await?)
            })
            .await
    }

    async fn insert(&self, ctx: TransactionContext, entry: &LogEntry) -> Result<(), ServiceError> {
        info!(
            message = %entry.message,
            tx_id = ?ctx.current_transaction_id().await,
            "Saving log entry"
        );
        documents::save(&ctx, LOGS, &entry.message, entry).await?;

        if entry.message.contains(LOG_FAILURE_MARKER) {
            warn!(message = %entry.message, "Log write failed");
            return Err(ServiceError::LogWriteFailed(entry.message.clone()));
        }
        Ok(())
    }
}
