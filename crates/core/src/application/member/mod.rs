// Member Service - member join with an audit log entry

pub mod repository;

pub use repository::{LogRepository, MemberRepository, LOG_FAILURE_MARKER};

use crate::application::context::TransactionContext;
use crate::application::template::{run_in, TransactionTemplate};
use crate::domain::{LogEntry, Member};
use crate::error::ServiceError;
use crate::port::TimeProvider;
use std::sync::Arc;
use tracing::warn;

/// Joins members and records one log entry per join
///
/// With `template: None` each repository call stands on its own; with a
/// template both writes share the service's logical transaction.
pub struct MemberService {
    members: MemberRepository,
    logs: LogRepository,
    template: Option<TransactionTemplate>,
    time_provider: Arc<dyn TimeProvider>,
}

impl MemberService {
    pub fn new(
        members: MemberRepository,
        logs: LogRepository,
        template: Option<TransactionTemplate>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            members,
            logs,
            template,
            time_provider,
        }
    }

    pub fn members(&self) -> &MemberRepository {
        &self.members
    }

    pub fn logs(&self) -> &LogRepository {
        &self.logs
    }

    /// Save the member, then the log entry; any failure propagates
    pub async fn join(&self, ctx: &TransactionContext, username: &str) -> Result<(), ServiceError> {
        run_in(self.template.as_ref(), ctx, |ctx| self.join_in(ctx, username)).await
    }

    /// Like `join`, but a failed log write is logged and swallowed
    ///
    /// Whether the member survives depends on the log repository's propagation:
    /// a joined log transaction poisons the shared one (`UnexpectedRollback` at
    /// the owner), a `REQUIRES_NEW` one fails alone.
    pub async fn join_recovering_log_failure(
        &self,
        ctx: &TransactionContext,
        username: &str,
    ) -> Result<(), ServiceError> {
        run_in(self.template.as_ref(), ctx, |ctx| {
            self.join_recovering_in(ctx, username)
        })
        .await
    }

    async fn join_in(&self, ctx: TransactionContext, username: &str) -> Result<(), ServiceError> {
        let (member, entry) = self.records(username)?;
        self.members.save(&ctx, &member).await?;
        self.logs.save(&ctx, &entry).await
    }

    async fn join_recovering_in(
        &self,
        ctx: TransactionContext,
        username: &str,
    ) -> Result<(), ServiceError> {
        let (member, entry) = self.records(username)?;
        self.members.save(&ctx, &member).await?;
        match self.logs.save(&ctx, &entry).await {
            Err(ServiceError::LogWriteFailed(message)) => {
                warn!(message = %message, "Log write failed; continuing member join");
                Ok(())
            }
            other => other,
        }
    }

    fn records(&self, username: &str) -> Result<(Member, LogEntry), ServiceError> {
        let now = self.time_provider.now_millis();
        Ok((Member::new(username, now)?, LogEntry::new(username, now)))
    }
}
