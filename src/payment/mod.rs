//! Payment Lifecycle
//!
//! Hold-then-capture flow against a single wallet:
//!
//! 1. `create` persists a CREATED payment (idempotent by key).
//! 2. `process` freezes the amount (AMOUNT_HELD), calls the gateway outside
//!    any wallet lock, then either captures (unfreeze + debit + PAYMENT log
//!    entry, COMPLETED) or releases the hold (FAILED with reason). A payment
//!    is never left in AMOUNT_HELD.
//! 3. `refund` credits the wallet back, repeatable while the refunded total
//!    stays below the captured amount.
//!
//! Gateway failures and timeouts are not retried; the payment fails and the
//! hold is released. Each real status change fires a
//! `payment.status_changed` webhook when the payment carries a URL.

pub mod gateway;

use crate::core_types::{Reference, WalletId, new_reference, now_millis};
use crate::error::LedgerError;
use crate::events::{DomainEvent, EventPublisher};
use crate::money::Money;
use crate::store::{LedgerStore, StoreError};
use crate::txlog::{TransactionKind, TransactionRecord};
use crate::webhook::WebhookDelivery;
use chrono::{DateTime, Utc};
use gateway::PaymentGateway;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Created,
    AmountHeld,
    Completed,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Created => "CREATED",
            PaymentStatus::AmountHeld => "AMOUNT_HELD",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(PaymentStatus::Created),
            "AMOUNT_HELD" => Some(PaymentStatus::AmountHeld),
            "COMPLETED" => Some(PaymentStatus::Completed),
            "FAILED" => Some(PaymentStatus::Failed),
            "REFUNDED" => Some(PaymentStatus::Refunded),
            "PARTIALLY_REFUNDED" => Some(PaymentStatus::PartiallyRefunded),
            _ => None,
        }
    }

    /// Closed transition table; everything not listed is forbidden.
    pub const fn can_transition(self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, to),
            (Created, AmountHeld)
                | (Created, Failed)
                | (AmountHeld, Completed)
                | (AmountHeld, Failed)
                | (Completed, Refunded)
                | (Completed, PartiallyRefunded)
                | (PartiallyRefunded, PartiallyRefunded)
                | (PartiallyRefunded, Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One merchant payment against a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub reference: Reference,
    pub wallet_id: WalletId,
    pub amount: Money,
    pub refunded: Money,
    pub status: PaymentStatus,
    pub merchant_name: String,
    pub description: Option<String>,
    pub idempotency_key: String,
    pub webhook_url: Option<String>,
    pub failure_reason: Option<String>,
    pub transaction_ref: Option<Reference>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    fn transition(&mut self, to: PaymentStatus) -> Result<(), LedgerError> {
        if !self.status.can_transition(to) {
            return Err(LedgerError::invalid(format!(
                "payment {} cannot move from {} to {to}",
                self.reference, self.status
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Amount still refundable: `amount - refunded`.
    pub fn refundable(&self) -> Result<Money, LedgerError> {
        Ok(self.amount.checked_sub(self.refunded)?)
    }
}

/// Parameters for a new payment.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub wallet_id: WalletId,
    pub amount: Money,
    pub merchant_name: String,
    pub description: Option<String>,
    pub webhook_url: Option<String>,
}

/// Why the hold phase did not land.
enum HoldError {
    /// A competing call already moved the payment past CREATED. The caller
    /// gets the error as-is; the stored payment is never touched.
    Conflict(LedgerError),
    /// The hold itself was rejected (insufficient funds, inactive wallet);
    /// the payment fails with the reason.
    Rejected(LedgerError),
}

/// Drives the payment state machine over the ledger store.
pub struct PaymentService<S: LedgerStore> {
    store: Arc<S>,
    gateway: Arc<dyn PaymentGateway>,
    webhooks: Option<Arc<WebhookDelivery<S>>>,
    events: Arc<dyn EventPublisher>,
    gateway_timeout: Duration,
}

impl<S: LedgerStore> PaymentService<S> {
    pub fn new(
        store: Arc<S>,
        gateway: Arc<dyn PaymentGateway>,
        webhooks: Option<Arc<WebhookDelivery<S>>>,
        events: Arc<dyn EventPublisher>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            webhooks,
            events,
            gateway_timeout,
        }
    }

    pub async fn payment(&self, reference: &str) -> Result<Payment, LedgerError> {
        self.store
            .payment_by_reference(reference)
            .await?
            .ok_or_else(|| LedgerError::not_found("Payment", reference))
    }

    /// Persist a CREATED payment. Replays of the same idempotency key return
    /// the existing payment whatever its current status.
    pub async fn create(
        &self,
        request: PaymentRequest,
        idempotency_key: &str,
    ) -> Result<Payment, LedgerError> {
        info!(
            wallet_id = request.wallet_id,
            amount = %request.amount,
            merchant = %request.merchant_name,
            idempotency_key,
            "creating payment"
        );

        if let Some(existing) = self
            .store
            .payment_by_idempotency_key(idempotency_key)
            .await?
        {
            info!(idempotency_key, "duplicate payment create, returning existing");
            return Ok(existing);
        }

        let wallet = self
            .store
            .wallet(request.wallet_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Wallet", request.wallet_id.to_string()))?;
        request.amount.require_positive()?;
        request.amount.require_currency(wallet.currency())?;

        let now = Utc::now();
        let payment = Payment {
            reference: new_reference(),
            wallet_id: request.wallet_id,
            amount: request.amount,
            refunded: Money::zero(request.amount.currency()),
            status: PaymentStatus::Created,
            merchant_name: request.merchant_name,
            description: request.description,
            idempotency_key: idempotency_key.to_string(),
            webhook_url: request.webhook_url,
            failure_reason: None,
            transaction_ref: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_payment(&payment).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                // Lost the first-commit race; the stored payment stands.
                return self
                    .store
                    .payment_by_idempotency_key(idempotency_key)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("Payment", idempotency_key));
            }
            Err(e) => return Err(e.into()),
        }

        info!(reference = %payment.reference, "payment created");
        Ok(payment)
    }

    /// Run the hold/capture flow for a CREATED payment. Returns the payment
    /// in COMPLETED or FAILED; gateway rejection is an outcome, not an error.
    pub async fn process(&self, reference: &str) -> Result<Payment, LedgerError> {
        info!(reference, "processing payment");

        let mut payment = self.payment(reference).await?;
        if payment.status != PaymentStatus::Created {
            return Err(LedgerError::invalid(format!(
                "payment cannot be processed in status {}",
                payment.status
            )));
        }
        let previous = payment.status;

        // Hold phase: freeze the amount and persist AMOUNT_HELD atomically.
        // The status re-read inside hold() admits exactly one of two
        // competing process() calls; the loser errors out here.
        let payment = match self.hold(&mut payment).await {
            Err(HoldError::Conflict(e)) => return Err(e),
            Err(HoldError::Rejected(e)) => {
                self.fail(payment, previous, format!("Hold failed: {e}"))
                    .await?
            }
            Ok(()) => {
                // Gateway call, outside any wallet lock, bounded by the
                // timeout.
                let verdict =
                    tokio::time::timeout(self.gateway_timeout, self.gateway.process(&payment))
                        .await;
                match verdict {
                    Ok(Ok(true)) => self.capture(payment).await?,
                    Ok(Ok(false)) => {
                        self.fail(
                            payment,
                            previous,
                            "Payment gateway rejected the transaction".into(),
                        )
                        .await?
                    }
                    Ok(Err(e)) => {
                        self.fail(payment, previous, format!("Processing error: {e}"))
                            .await?
                    }
                    Err(_) => {
                        self.fail(payment, previous, "Processing error: gateway timed out".into())
                            .await?
                    }
                }
            }
        };

        self.notify_status_change(&payment, previous).await;
        self.events.publish(&DomainEvent::PaymentProcessed {
            reference: payment.reference.clone(),
            wallet_id: payment.wallet_id,
            amount: payment.amount,
            status: payment.status,
        });

        info!(reference, status = %payment.status, "payment processed");
        Ok(payment)
    }

    /// Refund part or all of a captured payment back to the wallet.
    pub async fn refund(
        &self,
        reference: &str,
        amount: Money,
        reason: Option<&str>,
    ) -> Result<Payment, LedgerError> {
        info!(reference, %amount, "processing refund");

        let mut payment = self.payment(reference).await?;
        if payment.status != PaymentStatus::Completed
            && payment.status != PaymentStatus::PartiallyRefunded
        {
            return Err(LedgerError::invalid(format!(
                "payment cannot be refunded in status {}",
                payment.status
            )));
        }
        amount.require_positive()?;
        amount.require_currency(payment.amount.currency())?;

        let refundable = payment.refundable()?;
        if refundable.lt(&amount)? {
            return Err(LedgerError::invalid(format!(
                "refund amount {amount} exceeds maximum refundable amount {refundable}"
            )));
        }

        let previous = payment.status;
        let mut txn = self.store.lock_wallets(&[payment.wallet_id]).await?;
        let mut wallet = txn
            .wallet(payment.wallet_id)
            .ok_or_else(|| LedgerError::not_found("Wallet", payment.wallet_id.to_string()))?;

        let delta = wallet.credit(amount)?;
        let description = match reason {
            Some(reason) => format!("Refund for payment {reference} - {reason}"),
            None => format!("Refund for payment {reference}"),
        };
        let record = TransactionRecord::new(
            payment.wallet_id,
            TransactionKind::Refund,
            amount,
            delta.before,
            delta.after,
            description,
            Some(format!("{}_REFUND_{}", payment.idempotency_key, now_millis())),
            None,
        )?;

        payment.refunded = payment.refunded.checked_add(amount)?;
        let next = if payment.refunded == payment.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        payment.transition(next)?;

        txn.update_wallet(wallet);
        txn.append_transaction(record);
        txn.update_payment(payment.clone());
        txn.commit().await?;

        self.notify_status_change(&payment, previous).await;
        info!(
            reference,
            %amount,
            total_refunded = %payment.refunded,
            status = %payment.status,
            "refund processed"
        );
        Ok(payment)
    }

    /// Hold phase. The wallet lock serializes competing `process()` calls
    /// on the same payment; the status re-read under it admits only the
    /// first, so at most one hold ever commits.
    async fn hold(&self, payment: &mut Payment) -> Result<(), HoldError> {
        let mut txn = self
            .store
            .lock_wallets(&[payment.wallet_id])
            .await
            .map_err(|e| HoldError::Rejected(e.into()))?;

        let current = self
            .store
            .payment_by_reference(&payment.reference)
            .await
            .map_err(|e| HoldError::Rejected(e.into()))?
            .ok_or_else(|| {
                HoldError::Rejected(LedgerError::not_found(
                    "Payment",
                    payment.reference.clone(),
                ))
            })?;
        if current.status != PaymentStatus::Created {
            return Err(HoldError::Conflict(LedgerError::invalid(format!(
                "payment cannot be processed in status {}",
                current.status
            ))));
        }

        let mut wallet = txn.wallet(payment.wallet_id).ok_or_else(|| {
            HoldError::Rejected(LedgerError::not_found(
                "Wallet",
                payment.wallet_id.to_string(),
            ))
        })?;

        wallet.freeze(payment.amount).map_err(HoldError::Rejected)?;
        payment
            .transition(PaymentStatus::AmountHeld)
            .map_err(HoldError::Rejected)?;

        txn.update_wallet(wallet);
        txn.update_payment(payment.clone());
        txn.commit()
            .await
            .map_err(|e| HoldError::Rejected(e.into()))?;
        Ok(())
    }

    /// Success path: release the hold, debit the wallet and append the
    /// PAYMENT log entry in one atomic unit.
    async fn capture(&self, mut payment: Payment) -> Result<Payment, LedgerError> {
        let mut txn = self.store.lock_wallets(&[payment.wallet_id]).await?;
        let mut wallet = txn
            .wallet(payment.wallet_id)
            .ok_or_else(|| LedgerError::not_found("Wallet", payment.wallet_id.to_string()))?;

        wallet.unfreeze(payment.amount)?;
        let delta = wallet.debit(payment.amount)?;

        let record = TransactionRecord::new(
            payment.wallet_id,
            TransactionKind::Payment,
            payment.amount,
            delta.before,
            delta.after,
            format!(
                "Payment to {} - {}",
                payment.merchant_name, payment.reference
            ),
            Some(format!("{}_TXN", payment.idempotency_key)),
            None,
        )?;

        payment.transaction_ref = Some(record.reference.clone());
        payment.transition(PaymentStatus::Completed)?;

        txn.update_wallet(wallet);
        txn.append_transaction(record);
        txn.update_payment(payment.clone());
        match txn.commit().await {
            Ok(()) => Ok(payment),
            Err(e) if e.is_duplicate() => {
                // The capture log entry already exists, so this batch rolled
                // back with the hold still in place. Release it and hand
                // back the stored payment.
                warn!(
                    reference = %payment.reference,
                    "capture already recorded, releasing hold"
                );
                self.release_hold(&payment).await;
                self.payment(&payment.reference).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Undo a hold outside any failed batch. Errors are logged only.
    async fn release_hold(&self, payment: &Payment) {
        let released: Result<(), LedgerError> = async {
            let mut txn = self.store.lock_wallets(&[payment.wallet_id]).await?;
            let mut wallet = txn
                .wallet(payment.wallet_id)
                .ok_or_else(|| LedgerError::not_found("Wallet", payment.wallet_id.to_string()))?;
            wallet.unfreeze(payment.amount)?;
            txn.update_wallet(wallet);
            txn.commit().await?;
            Ok(())
        }
        .await;
        if let Err(e) = released {
            warn!(reference = %payment.reference, error = %e, "failed to release hold");
        }
    }

    /// Failure path: release the hold best-effort and persist FAILED. The
    /// unfreeze can only fail if the hold itself never landed; that is
    /// logged, never propagated, so the payment always leaves AMOUNT_HELD.
    async fn fail(
        &self,
        mut payment: Payment,
        previous: PaymentStatus,
        reason: String,
    ) -> Result<Payment, LedgerError> {
        let mut txn = self.store.lock_wallets(&[payment.wallet_id]).await?;

        if payment.status == PaymentStatus::AmountHeld {
            match txn.wallet(payment.wallet_id) {
                Some(mut wallet) => match wallet.unfreeze(payment.amount) {
                    Ok(()) => txn.update_wallet(wallet),
                    Err(e) => warn!(
                        reference = %payment.reference,
                        error = %e,
                        "failed to release hold for failed payment"
                    ),
                },
                None => warn!(
                    reference = %payment.reference,
                    "wallet missing while releasing hold"
                ),
            }
        }

        payment.failure_reason = Some(reason.clone());
        payment.transition(PaymentStatus::Failed)?;
        txn.update_payment(payment.clone());
        txn.commit().await?;

        warn!(reference = %payment.reference, previous = %previous, reason, "payment failed");
        Ok(payment)
    }

    /// Fire-and-forget `payment.status_changed` webhook; delivery errors are
    /// logged only.
    async fn notify_status_change(&self, payment: &Payment, previous: PaymentStatus) {
        let (Some(webhooks), Some(url)) = (&self.webhooks, &payment.webhook_url) else {
            return;
        };
        if payment.status == previous {
            return;
        }

        let payload = serde_json::json!({
            "event": "payment.status_changed",
            "reference": payment.reference,
            "previous_status": previous.as_str(),
            "current_status": payment.status.as_str(),
            "amount": payment.amount.to_decimal(),
            "currency": payment.amount.currency().to_string(),
            "merchant_name": payment.merchant_name,
            "timestamp": Utc::now(),
        })
        .to_string();

        if let Err(e) = webhooks
            .send("payment.status_changed", &payload, url)
            .await
        {
            warn!(
                reference = %payment.reference,
                error = %e,
                "failed to send payment webhook"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingPublisher;
    use crate::money::Currency;
    use crate::store::memory::MemoryStore;
    use gateway::{GatewayError, MockGateway, MockOutcome};
    use proptest::prelude::*;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, Currency::USD)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<MockGateway>,
        service: PaymentService<MemoryStore>,
        wallet_id: WalletId,
    }

    async fn fixture(balance_minor: i64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::approving());
        let service = PaymentService::new(
            store.clone(),
            gateway.clone(),
            None,
            Arc::new(TracingPublisher),
            Duration::from_millis(100),
        );

        let wallet = store.create_wallet(1, Currency::USD).await.unwrap();
        if balance_minor > 0 {
            let mut txn = store.lock_wallets(&[wallet.id()]).await.unwrap();
            let mut w = txn.wallet(wallet.id()).unwrap();
            w.credit(usd(balance_minor)).unwrap();
            txn.update_wallet(w);
            txn.commit().await.unwrap();
        }

        Fixture {
            store,
            gateway,
            service,
            wallet_id: wallet.id(),
        }
    }

    fn request(f: &Fixture, minor: i64) -> PaymentRequest {
        PaymentRequest {
            wallet_id: f.wallet_id,
            amount: usd(minor),
            merchant_name: "Acme Store".into(),
            description: Some("order 42".into()),
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let f = fixture(100_000).await;
        let first = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        let replay = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(first.status, PaymentStatus::Created);
    }

    #[tokio::test]
    async fn approved_payment_captures_funds() {
        let f = fixture(100_000).await;
        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        let processed = f.service.process(&payment.reference).await.unwrap();

        assert_eq!(processed.status, PaymentStatus::Completed);
        assert!(processed.transaction_ref.is_some());

        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance(), usd(80_000));
        assert_eq!(wallet.frozen(), usd(0));

        let record = f
            .store
            .transaction_by_idempotency_key("P1_TXN")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.kind, TransactionKind::Payment);
        assert_eq!(record.balance_after, usd(80_000));
    }

    #[tokio::test]
    async fn declined_payment_releases_hold() {
        let f = fixture(100_000).await;
        f.gateway.set_outcome(MockOutcome::Decline);

        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        let processed = f.service.process(&payment.reference).await.unwrap();

        assert_eq!(processed.status, PaymentStatus::Failed);
        assert_eq!(
            processed.failure_reason.as_deref(),
            Some("Payment gateway rejected the transaction")
        );

        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance(), usd(100_000));
        assert_eq!(wallet.frozen(), usd(0));
    }

    #[tokio::test]
    async fn gateway_error_fails_payment() {
        let f = fixture(100_000).await;
        f.gateway.set_outcome(MockOutcome::Error);

        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        let processed = f.service.process(&payment.reference).await.unwrap();

        assert_eq!(processed.status, PaymentStatus::Failed);
        assert!(processed.failure_reason.unwrap().starts_with("Processing error:"));
        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.frozen(), usd(0));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_timeout_fails_payment() {
        let f = fixture(100_000).await;
        f.gateway.set_outcome(MockOutcome::Hang);

        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        let processed = f.service.process(&payment.reference).await.unwrap();

        assert_eq!(processed.status, PaymentStatus::Failed);
        assert_eq!(
            processed.failure_reason.as_deref(),
            Some("Processing error: gateway timed out")
        );
        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance(), usd(100_000));
        assert_eq!(wallet.frozen(), usd(0));
    }

    #[tokio::test]
    async fn concurrent_process_admits_one_caller() {
        struct SlowApprove;

        #[async_trait::async_trait]
        impl PaymentGateway for SlowApprove {
            async fn process(&self, _payment: &Payment) -> Result<bool, GatewayError> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(true)
            }
        }

        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(PaymentService::new(
            store.clone(),
            Arc::new(SlowApprove),
            None,
            Arc::new(TracingPublisher),
            Duration::from_secs(1),
        ));
        let wallet = store.create_wallet(1, Currency::USD).await.unwrap();
        {
            let mut txn = store.lock_wallets(&[wallet.id()]).await.unwrap();
            let mut w = txn.wallet(wallet.id()).unwrap();
            w.credit(usd(100_000)).unwrap();
            txn.update_wallet(w);
            txn.commit().await.unwrap();
        }
        let payment = service
            .create(
                PaymentRequest {
                    wallet_id: wallet.id(),
                    amount: usd(20_000),
                    merchant_name: "Acme Store".into(),
                    description: None,
                    webhook_url: None,
                },
                "P1",
            )
            .await
            .unwrap();

        let first = tokio::spawn({
            let service = service.clone();
            let reference = payment.reference.clone();
            async move { service.process(&reference).await }
        });
        let second = tokio::spawn({
            let service = service.clone();
            let reference = payment.reference.clone();
            async move { service.process(&reference).await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];

        // Exactly one caller wins; the loser gets a plain error, never a
        // FAILED payment.
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, LedgerError::InvalidOperation(_)));
            }
        }

        // One capture, no stranded hold.
        let wallet = store.wallet(wallet.id()).await.unwrap().unwrap();
        assert_eq!(wallet.frozen(), usd(0));
        assert_eq!(wallet.balance(), usd(80_000));
        let stored = service.payment(&payment.reference).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn insufficient_funds_fails_without_hold() {
        let f = fixture(10_000).await;
        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        let processed = f.service.process(&payment.reference).await.unwrap();

        assert_eq!(processed.status, PaymentStatus::Failed);
        assert!(processed.failure_reason.unwrap().starts_with("Hold failed:"));
        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.frozen(), usd(0));
        assert_eq!(wallet.balance(), usd(10_000));
    }

    #[tokio::test]
    async fn process_requires_created_status() {
        let f = fixture(100_000).await;
        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        f.service.process(&payment.reference).await.unwrap();

        assert!(matches!(
            f.service.process(&payment.reference).await,
            Err(LedgerError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn partial_then_full_refund() {
        let f = fixture(100_000).await;
        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap(); // 200.00
        f.service.process(&payment.reference).await.unwrap();

        let after_first = f
            .service
            .refund(&payment.reference, usd(8_000), Some("damaged item"))
            .await
            .unwrap();
        assert_eq!(after_first.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(after_first.refunded, usd(8_000));

        let after_second = f
            .service
            .refund(&payment.reference, usd(12_000), None)
            .await
            .unwrap();
        assert_eq!(after_second.status, PaymentStatus::Refunded);
        assert_eq!(after_second.refunded, usd(20_000));

        // Fully refunded: balance is back where it started.
        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance(), usd(100_000));

        // Nothing left to refund.
        let err = f
            .service
            .refund(&payment.reference, usd(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidOperation(_)));
        let unchanged = f.service.payment(&payment.reference).await.unwrap();
        assert_eq!(unchanged.refunded, usd(20_000));
    }

    #[tokio::test]
    async fn over_refund_rejected_with_no_state_change() {
        let f = fixture(100_000).await;
        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();
        f.service.process(&payment.reference).await.unwrap();

        let err = f
            .service
            .refund(&payment.reference, usd(20_001), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidOperation(_)));

        let wallet = f.store.wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance(), usd(80_000));
        let current = f.service.payment(&payment.reference).await.unwrap();
        assert_eq!(current.status, PaymentStatus::Completed);
        assert_eq!(current.refunded, usd(0));
    }

    #[tokio::test]
    async fn refund_requires_captured_payment() {
        let f = fixture(100_000).await;
        let payment = f.service.create(request(&f, 20_000), "P1").await.unwrap();

        assert!(matches!(
            f.service.refund(&payment.reference, usd(1_000), None).await,
            Err(LedgerError::InvalidOperation(_))
        ));
    }

    #[test]
    fn transition_table_is_closed() {
        use PaymentStatus::*;
        let all = [Created, AmountHeld, Completed, Failed, Refunded, PartiallyRefunded];
        let allowed = [
            (Created, AmountHeld),
            (Created, Failed),
            (AmountHeld, Completed),
            (AmountHeld, Failed),
            (Completed, Refunded),
            (Completed, PartiallyRefunded),
            (PartiallyRefunded, PartiallyRefunded),
            (PartiallyRefunded, Refunded),
        ];
        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(from.can_transition(to), expected, "{from} -> {to}");
            }
        }
    }

    proptest! {
        /// Any sequence of valid refund amounts never exceeds the captured
        /// amount and ends REFUNDED exactly when the total matches it.
        #[test]
        fn refund_totals_stay_bounded(amounts in proptest::collection::vec(1i64..5_000, 1..16)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let f = fixture(1_000_000).await;
                let payment = f.service.create(request(&f, 50_000), "P1").await.unwrap();
                f.service.process(&payment.reference).await.unwrap();

                let mut refunded = 0i64;
                for minor in amounts {
                    match f.service.refund(&payment.reference, usd(minor), None).await {
                        Ok(p) => {
                            refunded += minor;
                            prop_assert_eq!(p.refunded, usd(refunded));
                            prop_assert!(refunded <= 50_000);
                        }
                        Err(_) => {
                            // rejected: either over-refund or already fully refunded
                            prop_assert!(refunded + minor > 50_000 || refunded == 50_000);
                        }
                    }
                }
                Ok(())
            })?;
        }
    }
}
