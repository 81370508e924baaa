// Payment Gateway Port
// Abstraction over the external payment processor used by the order service

use crate::domain::Order;
use async_trait::async_trait;
use thiserror::Error;

/// Outcome of a payment attempt that reached the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentDecision {
    Approved,
    /// Processor declined for lack of funds (recoverable business outcome)
    InsufficientFunds,
}

/// Processor faults (system failures, not business outcomes)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Payment processor unavailable: {0}")]
    Unavailable(String),

    #[error("Payment processor rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge the customer for an order
    ///
    /// # Errors
    /// - PaymentError::Unavailable if the processor cannot be reached
    /// - PaymentError::Rejected if the request is malformed
    async fn charge(&self, order: &Order) -> Result<PaymentDecision, PaymentError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Mock gateway behavior
    #[derive(Debug, Clone)]
    pub enum MockPaymentBehavior {
        Approve,
        InsufficientFunds,
        /// Fail with a system fault
        Fault(String),
    }

    /// Mock Payment Gateway for testing
    pub struct MockPaymentGateway {
        behavior: Arc<Mutex<MockPaymentBehavior>>,
        call_count: Arc<Mutex<usize>>,
    }

    impl MockPaymentGateway {
        pub fn new(behavior: MockPaymentBehavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                call_count: Arc::new(Mutex::new(0)),
            }
        }

        pub fn approving() -> Self {
            Self::new(MockPaymentBehavior::Approve)
        }

        pub fn set_behavior(&self, behavior: MockPaymentBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockPaymentGateway {
        async fn charge(&self, _order: &Order) -> Result<PaymentDecision, PaymentError> {
            *self.call_count.lock().unwrap() += 1;

            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                MockPaymentBehavior::Approve => Ok(PaymentDecision::Approved),
                MockPaymentBehavior::InsufficientFunds => Ok(PaymentDecision::InsufficientFunds),
                MockPaymentBehavior::Fault(msg) => Err(PaymentError::Unavailable(msg)),
            }
        }
    }
}
