//! External payment gateway seam.
//!
//! The lifecycle service calls the gateway between the hold and capture
//! phases, outside any wallet lock and under a bounded timeout. `Ok(true)`
//! means the charge was accepted, `Ok(false)` that the gateway declined it.

use super::Payment;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn process(&self, payment: &Payment) -> Result<bool, GatewayError>;
}

/// Scripted gateway outcome for tests and dev mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Approve,
    Decline,
    Error,
    /// Never responds; exercises the caller's timeout.
    Hang,
}

pub struct MockGateway {
    outcome: Mutex<MockOutcome>,
}

impl MockGateway {
    pub fn approving() -> Self {
        Self::with_outcome(MockOutcome::Approve)
    }

    pub fn with_outcome(outcome: MockOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
        }
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        *self.outcome.lock() = outcome;
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn process(&self, payment: &Payment) -> Result<bool, GatewayError> {
        tracing::info!(
            reference = %payment.reference,
            merchant = %payment.merchant_name,
            amount = %payment.amount,
            "processing payment with gateway"
        );
        let outcome = *self.outcome.lock();
        match outcome {
            MockOutcome::Approve => Ok(true),
            MockOutcome::Decline => Ok(false),
            MockOutcome::Error => Err(GatewayError::Unavailable("simulated outage".into())),
            MockOutcome::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(true)
            }
        }
    }
}
