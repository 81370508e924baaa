// Order repository

use crate::application::context::TransactionContext;
use crate::application::coordinator::TransactionCoordinator;
use crate::application::documents;
use crate::application::template::TransactionTemplate;
use crate::domain::{Order, Propagation, TransactionDefinition};
use crate::error::ServiceError;
use std::sync::Arc;
use tracing::debug;

pub const ORDERS: &str = "orders";

/// Order store; writes always join the caller's transaction
pub struct OrderRepository {
    reads: TransactionTemplate,
}

impl OrderRepository {
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Self {
        Self {
            reads: TransactionTemplate::new(
                coordinator,
                TransactionDefinition::new(Propagation::Required)
                    .read_only()
                    .named("OrderRepository.find"),
            ),
        }
    }

    pub async fn save(&self, ctx: &TransactionContext, order: &Order) -> Result<(), ServiceError> {
        debug!(order_id = %order.id, pay_status = %order.pay_status, "Saving order");
        documents::save(ctx, ORDERS, &order.id, order).await?;
        Ok(())
    }

    pub async fn find(
        &self,
        ctx: &TransactionContext,
        order_id: &str,
    ) -> Result<Option<Order>, ServiceError> {
        self.reads
            .execute(ctx, |ctx| async move {
                Ok::<_, ServiceError>(documents::find(&ctx, ORDERS, order_id).await?)
            })
            .await
    }

    pub async fn find_all(&self, ctx: &TransactionContext) -> Result<Vec<Order>, ServiceError> {
        self.reads
            .execute(ctx, |ctx| async move {
                Ok::<_, ServiceError>(documents::find_all(&ctx, ORDERS).await?)
            })
            .await
    }
}
