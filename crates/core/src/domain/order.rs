// Order Domain Model

use serde::{Deserialize, Serialize};

/// Order ID (UUID v4)
pub type OrderId = String;

/// Payment state of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayStatus {
    /// Order recorded, payment not attempted yet
    Pending,
    /// Payment could not be settled; customer must transfer funds separately
    Waiting,
    Completed,
}

impl std::fmt::Display for PayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayStatus::Pending => write!(f, "PENDING"),
            PayStatus::Waiting => write!(f, "WAITING"),
            PayStatus::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// Order Entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub username: String,
    pub pay_status: PayStatus,
    pub created_at: i64, // epoch ms
}

impl Order {
    pub fn new(id: impl Into<String>, username: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            pay_status: PayStatus::Pending,
            created_at,
        }
    }

    /// PENDING -> COMPLETED
    pub fn complete_payment(&mut self) -> crate::domain::error::Result<()> {
        self.transition(PayStatus::Completed)
    }

    /// PENDING -> WAITING
    pub fn await_funds(&mut self) -> crate::domain::error::Result<()> {
        self.transition(PayStatus::Waiting)
    }

    fn transition(&mut self, to: PayStatus) -> crate::domain::error::Result<()> {
        if self.pay_status != PayStatus::Pending {
            return Err(crate::domain::DomainError::InvalidStateTransition {
                from: self.pay_status.to_string(),
                to: to.to_string(),
            });
        }
        self.pay_status = to;
        Ok(())
    }
}
