// Order Service - order placement with payment

pub mod repository;

pub use repository::OrderRepository;

use crate::application::context::TransactionContext;
use crate::application::coordinator::TransactionCoordinator;
use crate::application::template::{RollbackPolicy, TransactionTemplate};
use crate::domain::{Order, Propagation};
use crate::error::ServiceError;
use crate::port::{IdProvider, PaymentDecision, PaymentGateway, TimeProvider};
use std::sync::Arc;
use tracing::{info, warn};

/// Places orders and settles their payment in one transaction
///
/// Outcomes:
/// - approved: order committed as COMPLETED
/// - insufficient funds: order committed as WAITING, `NotEnoughMoney` returned
/// - payment fault: nothing committed, the fault returned
pub struct OrderService {
    orders: OrderRepository,
    gateway: Arc<dyn PaymentGateway>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    template: TransactionTemplate,
}

impl OrderService {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        gateway: Arc<dyn PaymentGateway>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            orders: OrderRepository::new(coordinator.clone()),
            gateway,
            id_provider,
            time_provider,
            template: TransactionTemplate::new(coordinator, Propagation::Required),
        }
    }

    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.template = self.template.with_policy(policy);
        self
    }

    pub fn orders(&self) -> &OrderRepository {
        &self.orders
    }

    /// Fresh PENDING order with an injected ID and timestamp
    pub fn new_order(&self, username: &str) -> Order {
        Order::new(
            self.id_provider.generate_id(),
            username,
            self.time_provider.now_millis(),
        )
    }

    /// Record the order and charge for it
    ///
    /// # Errors
    /// - ServiceError::NotEnoughMoney (the WAITING order is still committed)
    /// - ServiceError::Payment on processor faults (rolled back)
    pub async fn place_order(
        &self,
        ctx: &TransactionContext,
        username: &str,
    ) -> Result<Order, ServiceError> {
        let order = self.new_order(username);
        self.template
            .execute(ctx, |ctx| self.settle(ctx, order))
            .await
    }

    /// Place several orders from a plain (non-transactional) entry point
    ///
    /// Each order goes through `place_order`, so each opens its own
    /// transaction when the caller has none.
    pub async fn place_orders(
        &self,
        ctx: &TransactionContext,
        usernames: &[&str],
    ) -> Vec<Result<Order, ServiceError>> {
        let mut outcomes = Vec::with_capacity(usernames.len());
        for username in usernames {
            outcomes.push(self.place_order(ctx, username).await);
        }
        outcomes
    }

    pub async fn find_order(
        &self,
        ctx: &TransactionContext,
        order_id: &str,
    ) -> Result<Option<Order>, ServiceError> {
        self.orders.find(ctx, order_id).await
    }

    async fn settle(&self, ctx: TransactionContext, mut order: Order) -> Result<Order, ServiceError> {
        info!(order_id = %order.id, username = %order.username, "Placing order");
        self.orders.save(&ctx, &order).await?;

        match self.gateway.charge(&order).await? {
            PaymentDecision::Approved => {
                order.complete_payment()?;
                self.orders.save(&ctx, &order).await?;
                info!(order_id = %order.id, "Payment completed");
                Ok(order)
            }
            PaymentDecision::InsufficientFunds => {
                order.await_funds()?;
                self.orders.save(&ctx, &order).await?;
                warn!(order_id = %order.id, "Not enough money; order waiting for transfer");
                Err(ServiceError::NotEnoughMoney { order_id: order.id })
            }
        }
    }
}
