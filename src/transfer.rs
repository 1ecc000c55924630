//! Transfer Coordinator
//!
//! Atomic wallet-to-wallet moves. A transfer debits the source, credits the
//! destination, appends one TRANSFER_OUT and one TRANSFER_IN log entry and
//! inserts the COMPLETED transfer record, all in a single store write unit.
//! No partial state is ever externally visible.
//!
//! Deadlock avoidance: both wallets are locked in ascending id order, which
//! the store's `lock_wallets` guarantees regardless of transfer direction.

use crate::core_types::{Reference, WalletId, new_reference};
use crate::error::LedgerError;
use crate::events::{DomainEvent, EventPublisher};
use crate::idempotency::IdempotencyService;
use crate::money::Money;
use crate::store::{LedgerStore, StoreError};
use crate::txlog::{TransactionKind, TransactionRecord};
use crate::wallet::{Wallet, WalletStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reversed,
}

impl TransferStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Processing => "PROCESSING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Reversed => "REVERSED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TransferStatus::Pending),
            "PROCESSING" => Some(TransferStatus::Processing),
            "COMPLETED" => Some(TransferStatus::Completed),
            "FAILED" => Some(TransferStatus::Failed),
            "REVERSED" => Some(TransferStatus::Reversed),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completed wallet-to-wallet transfer. References the pair of transaction
/// log entries it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub reference: Reference,
    pub from_wallet_id: WalletId,
    pub to_wallet_id: WalletId,
    pub amount: Money,
    pub fee: Money,
    pub status: TransferStatus,
    pub out_transaction_ref: Option<Reference>,
    pub in_transaction_ref: Option<Reference>,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Coordinates two-wallet transfers over the ledger store.
pub struct TransferCoordinator<S: LedgerStore> {
    store: Arc<S>,
    idempotency: Arc<IdempotencyService<S>>,
    events: Arc<dyn EventPublisher>,
}

impl<S: LedgerStore> TransferCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        idempotency: Arc<IdempotencyService<S>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            idempotency,
            events,
        }
    }

    pub async fn transfer_by_reference(
        &self,
        reference: &str,
    ) -> Result<Transfer, LedgerError> {
        self.store
            .transfer_by_reference(reference)
            .await?
            .ok_or_else(|| LedgerError::not_found("Transfer", reference))
    }

    /// Move `amount` from one wallet to another. Replays of the same
    /// idempotency key return the original transfer unchanged.
    pub async fn transfer(
        &self,
        from_wallet_id: WalletId,
        to_wallet_id: WalletId,
        amount: Money,
        idempotency_key: &str,
        description: Option<&str>,
    ) -> Result<Transfer, LedgerError> {
        info!(
            from_wallet_id,
            to_wallet_id,
            %amount,
            idempotency_key,
            "initiating transfer"
        );

        if let Some(stored) = self.idempotency.check(idempotency_key).await? {
            debug!(idempotency_key, "duplicate transfer, returning stored result");
            return Ok(serde_json::from_str(&stored.body)?);
        }
        if let Some(existing) = self
            .store
            .transfer_by_idempotency_key(idempotency_key)
            .await?
        {
            debug!(idempotency_key, "duplicate transfer found in store");
            return Ok(existing);
        }

        if from_wallet_id == to_wallet_id {
            return Err(LedgerError::invalid("cannot transfer to the same wallet"));
        }
        amount.require_positive()?;

        let source = self.resolve_active(from_wallet_id, "source").await?;
        let dest = self.resolve_active(to_wallet_id, "destination").await?;
        amount.require_currency(source.currency())?;
        if source.currency() != dest.currency() {
            return Err(LedgerError::invalid(format!(
                "wallet currency mismatch: {} vs {}",
                source.currency(),
                dest.currency()
            )));
        }

        // Both wallets locked in ascending id order by the store.
        let mut txn = self.store.lock_wallets(&[from_wallet_id, to_wallet_id]).await?;
        let mut source = txn
            .wallet(from_wallet_id)
            .ok_or_else(|| LedgerError::not_found("Wallet", from_wallet_id.to_string()))?;
        let mut dest = txn
            .wallet(to_wallet_id)
            .ok_or_else(|| LedgerError::not_found("Wallet", to_wallet_id.to_string()))?;

        // Availability is re-checked under the lock by debit itself.
        let out_delta = source.debit(amount)?;
        let in_delta = dest.credit(amount)?;

        let out_record = TransactionRecord::new(
            from_wallet_id,
            TransactionKind::TransferOut,
            amount,
            out_delta.before,
            out_delta.after,
            description.map_or_else(|| format!("Transfer to wallet {to_wallet_id}"), String::from),
            Some(format!("{idempotency_key}_OUT")),
            Some(to_wallet_id),
        )?;
        let in_record = TransactionRecord::new(
            to_wallet_id,
            TransactionKind::TransferIn,
            amount,
            in_delta.before,
            in_delta.after,
            description
                .map_or_else(|| format!("Transfer from wallet {from_wallet_id}"), String::from),
            Some(format!("{idempotency_key}_IN")),
            Some(from_wallet_id),
        )?;

        let transfer = Transfer {
            reference: new_reference(),
            from_wallet_id,
            to_wallet_id,
            amount,
            fee: Money::zero(amount.currency()),
            status: TransferStatus::Completed,
            out_transaction_ref: Some(out_record.reference.clone()),
            in_transaction_ref: Some(in_record.reference.clone()),
            idempotency_key: idempotency_key.to_string(),
            description: description.map(String::from),
            created_at: Utc::now(),
        };

        txn.update_wallet(source);
        txn.update_wallet(dest);
        txn.append_transaction(out_record);
        txn.append_transaction(in_record);
        txn.insert_transfer(transfer.clone());

        match txn.commit().await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                // Lost the first-commit race; the winner's transfer stands.
                return self.read_back(idempotency_key).await;
            }
            Err(e) => return Err(e.into()),
        }

        self.idempotency
            .save(
                idempotency_key,
                &serde_json::to_string(&transfer)?,
                200,
                None,
            )
            .await;

        self.events.publish(&DomainEvent::TransferCompleted {
            reference: transfer.reference.clone(),
            from_wallet_id,
            to_wallet_id,
            amount,
        });

        info!(
            reference = %transfer.reference,
            from_wallet_id,
            to_wallet_id,
            %amount,
            "transfer completed"
        );
        Ok(transfer)
    }

    async fn resolve_active(
        &self,
        wallet_id: WalletId,
        label: &str,
    ) -> Result<Wallet, LedgerError> {
        let wallet = self
            .store
            .wallet(wallet_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Wallet", wallet_id.to_string()))?;
        if wallet.status() != WalletStatus::Active {
            return Err(LedgerError::invalid(format!(
                "{label} wallet {wallet_id} is not active (status: {})",
                wallet.status()
            )));
        }
        Ok(wallet)
    }

    async fn read_back(&self, idempotency_key: &str) -> Result<Transfer, LedgerError> {
        if let Some(stored) = self.idempotency.check(idempotency_key).await? {
            return Ok(serde_json::from_str(&stored.body)?);
        }
        self.store
            .transfer_by_idempotency_key(idempotency_key)
            .await?
            .ok_or_else(|| LedgerError::not_found("Transfer", idempotency_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingPublisher;
    use crate::money::Currency;
    use crate::store::memory::MemoryStore;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, Currency::USD)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: TransferCoordinator<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let idempotency = Arc::new(IdempotencyService::with_defaults(store.clone()));
        let coordinator =
            TransferCoordinator::new(store.clone(), idempotency, Arc::new(TracingPublisher));
        Fixture { store, coordinator }
    }

    async fn funded_wallet(store: &MemoryStore, account_id: i64, minor: i64) -> WalletId {
        let wallet = store.create_wallet(account_id, Currency::USD).await.unwrap();
        if minor > 0 {
            let mut txn = store.lock_wallets(&[wallet.id()]).await.unwrap();
            let mut w = txn.wallet(wallet.id()).unwrap();
            w.credit(usd(minor)).unwrap();
            txn.update_wallet(w);
            txn.commit().await.unwrap();
        }
        wallet.id()
    }

    #[tokio::test]
    async fn transfer_conserves_funds() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 100_000).await;
        let b = funded_wallet(&f.store, 2, 50_000).await;

        let transfer = f
            .coordinator
            .transfer(a, b, usd(30_000), "T1", Some("rent"))
            .await
            .unwrap();

        assert_eq!(transfer.status, TransferStatus::Completed);
        let wa = f.store.wallet(a).await.unwrap().unwrap();
        let wb = f.store.wallet(b).await.unwrap().unwrap();
        assert_eq!(wa.balance(), usd(70_000));
        assert_eq!(wb.balance(), usd(80_000));
        assert_eq!(
            wa.balance().checked_add(wb.balance()).unwrap(),
            usd(150_000)
        );
    }

    #[tokio::test]
    async fn transfer_writes_paired_log_entries() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 100_000).await;
        let b = funded_wallet(&f.store, 2, 0).await;

        let transfer = f
            .coordinator
            .transfer(a, b, usd(10_000), "T1", None)
            .await
            .unwrap();

        let out = f
            .store
            .transaction_by_idempotency_key("T1_OUT")
            .await
            .unwrap()
            .unwrap();
        let r#in = f
            .store
            .transaction_by_idempotency_key("T1_IN")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(out.kind, TransactionKind::TransferOut);
        assert_eq!(out.counterparty_wallet_id, Some(b));
        assert_eq!(r#in.kind, TransactionKind::TransferIn);
        assert_eq!(r#in.counterparty_wallet_id, Some(a));
        assert_eq!(transfer.out_transaction_ref.as_deref(), Some(out.reference.as_str()));
        assert_eq!(transfer.in_transaction_ref.as_deref(), Some(r#in.reference.as_str()));
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_trace() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 10_000).await; // 100.00
        let b = funded_wallet(&f.store, 2, 0).await;

        let err = f
            .coordinator
            .transfer(a, b, usd(50_000), "T1", None) // 500.00
            .await
            .unwrap_err();

        match err {
            LedgerError::InsufficientFunds {
                requested,
                available,
            } => {
                assert_eq!(requested, usd(50_000));
                assert_eq!(available, usd(10_000));
            }
            other => panic!("unexpected: {other}"),
        }

        assert_eq!(f.store.wallet(a).await.unwrap().unwrap().balance(), usd(10_000));
        assert_eq!(f.store.wallet(b).await.unwrap().unwrap().balance(), usd(0));
        assert!(f.store.transfer_by_idempotency_key("T1").await.unwrap().is_none());
        assert!(
            f.store
                .transaction_by_idempotency_key("T1_OUT")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn replay_returns_original_transfer() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 100_000).await;
        let b = funded_wallet(&f.store, 2, 0).await;

        let first = f
            .coordinator
            .transfer(a, b, usd(10_000), "T1", None)
            .await
            .unwrap();
        let replay = f
            .coordinator
            .transfer(a, b, usd(10_000), "T1", None)
            .await
            .unwrap();

        assert_eq!(first, replay);
        // Funds moved exactly once.
        assert_eq!(f.store.wallet(a).await.unwrap().unwrap().balance(), usd(90_000));
        assert_eq!(f.store.wallet(b).await.unwrap().unwrap().balance(), usd(10_000));
    }

    #[tokio::test]
    async fn self_transfer_rejected() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 100_000).await;
        assert!(matches!(
            f.coordinator.transfer(a, a, usd(1), "T1", None).await,
            Err(LedgerError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_wallet_rejected() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 100_000).await;
        assert!(matches!(
            f.coordinator.transfer(a, 999, usd(1), "T1", None).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn currency_mismatch_rejected() {
        let f = fixture().await;
        let a = funded_wallet(&f.store, 1, 100_000).await;
        let b = f.store.create_wallet(2, Currency::EUR).await.unwrap().id();

        let err = f
            .coordinator
            .transfer(a, b, usd(1_000), "T1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidOperation(_)));
    }
}
