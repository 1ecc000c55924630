//! Domain events.
//!
//! Fire-and-forget notifications emitted after a mutation commits. The
//! publisher seam lets deployments plug in a message bus; the default
//! implementation logs through `tracing`. Publication failure never
//! affects the committed mutation.

use crate::core_types::{AccountId, Reference, WalletId};
use crate::money::Money;
use crate::payment::PaymentStatus;
use crate::txlog::TransactionKind;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    WalletMutated {
        wallet_id: WalletId,
        account_id: AccountId,
        kind: TransactionKind,
        amount: Money,
        balance: Money,
    },
    TransferCompleted {
        reference: Reference,
        from_wallet_id: WalletId,
        to_wallet_id: WalletId,
        amount: Money,
    },
    PaymentProcessed {
        reference: Reference,
        wallet_id: WalletId,
        amount: Money,
        status: PaymentStatus,
    },
}

pub trait EventPublisher: Send + Sync {
    /// Publish an event. Must not block the caller on downstream failures.
    fn publish(&self, event: &DomainEvent);
}

/// Default publisher: structured log line per event.
#[derive(Debug, Default)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: &DomainEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "paycore::events", event = %json, "domain event"),
            Err(e) => warn!(error = %e, "failed to serialize domain event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    #[test]
    fn events_serialize_with_tag() {
        let event = DomainEvent::WalletMutated {
            wallet_id: 1,
            account_id: 10,
            kind: TransactionKind::Deposit,
            amount: Money::from_minor(150_000, Currency::USD),
            balance: Money::from_minor(150_000, Currency::USD),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"wallet_mutated""#));
    }
}
