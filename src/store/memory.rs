//! In-memory ledger store.
//!
//! Backs the test suite and dev mode with the same semantics as the
//! Postgres store: exclusive per-wallet locks acquired in ascending id
//! order, buffered writes applied as one atomic unit, and unique-key
//! conflicts surfacing as [`StoreError::Duplicate`] with no partial
//! effects.
//!
//! The lock table holds one async mutex per wallet id; tables live behind
//! a single short-held `parking_lot` mutex so a commit validates and
//! applies in one critical section.

use super::{LedgerStore, StoreError, WalletTxn};
use crate::core_types::{AccountId, WalletId};
use crate::idempotency::IdempotencyRecord;
use crate::money::Currency;
use crate::payment::Payment;
use crate::transfer::Transfer;
use crate::txlog::TransactionRecord;
use crate::wallet::Wallet;
use crate::webhook::{WebhookEvent, WebhookStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
struct Tables {
    wallets: HashMap<WalletId, Wallet>,
    wallet_by_account: HashMap<AccountId, WalletId>,
    transactions: Vec<TransactionRecord>,
    transfers: Vec<Transfer>,
    payments: Vec<Payment>,
    idempotency: HashMap<String, IdempotencyRecord>,
    webhooks: Vec<WebhookEvent>,
}

pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: DashMap<WalletId, Arc<AsyncMutex<()>>>,
    next_wallet_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: DashMap::new(),
            next_wallet_id: AtomicI64::new(1),
        }
    }

    fn lock_handle(&self, id: WalletId) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Buffered write unit over the in-memory tables. Lock guards are held
/// until the txn is dropped, which happens after `commit` has applied (or
/// rejected) the whole batch.
struct MemoryTxn {
    tables: Arc<Mutex<Tables>>,
    _guards: Vec<OwnedMutexGuard<()>>,
    snapshot: HashMap<WalletId, Wallet>,
    wallets: Vec<Wallet>,
    transactions: Vec<TransactionRecord>,
    transfers: Vec<Transfer>,
    payments: Vec<Payment>,
}

#[async_trait]
impl WalletTxn for MemoryTxn {
    fn wallet(&self, id: WalletId) -> Option<Wallet> {
        self.snapshot.get(&id).cloned()
    }

    fn update_wallet(&mut self, wallet: Wallet) {
        self.wallets.push(wallet);
    }

    fn append_transaction(&mut self, record: TransactionRecord) {
        self.transactions.push(record);
    }

    fn insert_transfer(&mut self, transfer: Transfer) {
        self.transfers.push(transfer);
    }

    fn update_payment(&mut self, payment: Payment) {
        self.payments.push(payment);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut t = self.tables.lock();

        // Validate every unique key before touching anything.
        for record in &self.transactions {
            if t.transactions.iter().any(|r| r.reference == record.reference) {
                return Err(StoreError::duplicate("transaction", record.reference.clone()));
            }
            if let Some(key) = &record.idempotency_key {
                if t.transactions
                    .iter()
                    .any(|r| r.idempotency_key.as_deref() == Some(key))
                {
                    return Err(StoreError::duplicate("transaction", key.clone()));
                }
            }
        }
        for transfer in &self.transfers {
            if t.transfers.iter().any(|x| {
                x.reference == transfer.reference || x.idempotency_key == transfer.idempotency_key
            }) {
                return Err(StoreError::duplicate(
                    "transfer",
                    transfer.idempotency_key.clone(),
                ));
            }
        }
        for payment in &self.payments {
            if !t.payments.iter().any(|p| p.reference == payment.reference) {
                return Err(StoreError::Corrupt(format!(
                    "payment {} does not exist for update",
                    payment.reference
                )));
            }
        }

        for wallet in self.wallets {
            t.wallets.insert(wallet.id(), wallet);
        }
        t.transactions.extend(self.transactions);
        t.transfers.extend(self.transfers);
        for payment in self.payments {
            if let Some(slot) = t.payments.iter_mut().find(|p| p.reference == payment.reference)
            {
                *slot = payment;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_wallet(
        &self,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<Wallet, StoreError> {
        let mut t = self.tables.lock();
        if t.wallet_by_account.contains_key(&account_id) {
            return Err(StoreError::duplicate("wallet", account_id.to_string()));
        }
        let id = self.next_wallet_id.fetch_add(1, Ordering::Relaxed);
        let wallet = Wallet::new(id, account_id, currency);
        t.wallet_by_account.insert(account_id, id);
        t.wallets.insert(id, wallet.clone());
        Ok(wallet)
    }

    async fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.tables.lock().wallets.get(&id).cloned())
    }

    async fn wallet_by_account(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Wallet>, StoreError> {
        let t = self.tables.lock();
        Ok(t.wallet_by_account
            .get(&account_id)
            .and_then(|id| t.wallets.get(id))
            .cloned())
    }

    async fn lock_wallets(&self, ids: &[WalletId]) -> Result<Box<dyn WalletTxn>, StoreError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        {
            let t = self.tables.lock();
            for id in &ids {
                if !t.wallets.contains_key(id) {
                    return Err(StoreError::MissingWallet(*id));
                }
            }
        }

        // Ascending id order; the sole deadlock-avoidance mechanism.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.lock_handle(*id).lock_owned().await);
        }

        let snapshot = {
            let t = self.tables.lock();
            ids.iter()
                .filter_map(|id| t.wallets.get(id).map(|w| (*id, w.clone())))
                .collect()
        };

        Ok(Box::new(MemoryTxn {
            tables: self.tables.clone(),
            _guards: guards,
            snapshot,
            wallets: Vec::new(),
            transactions: Vec::new(),
            transfers: Vec::new(),
            payments: Vec::new(),
        }))
    }

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .transactions
            .iter()
            .find(|r| r.reference == reference)
            .cloned())
    }

    async fn transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .transactions
            .iter()
            .find(|r| r.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn transfer_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transfer>, StoreError> {
        Ok(self
            .tables
            .lock()
            .transfers
            .iter()
            .find(|t| t.reference == reference)
            .cloned())
    }

    async fn transfer_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transfer>, StoreError> {
        Ok(self
            .tables
            .lock()
            .transfers
            .iter()
            .find(|t| t.idempotency_key == key)
            .cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        if t.payments
            .iter()
            .any(|p| p.idempotency_key == payment.idempotency_key)
        {
            return Err(StoreError::duplicate(
                "payment",
                payment.idempotency_key.clone(),
            ));
        }
        if t.payments.iter().any(|p| p.reference == payment.reference) {
            return Err(StoreError::duplicate("payment", payment.reference.clone()));
        }
        t.payments.push(payment.clone());
        Ok(())
    }

    async fn payment_by_reference(&self, reference: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .tables
            .lock()
            .payments
            .iter()
            .find(|p| p.reference == reference)
            .cloned())
    }

    async fn payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .tables
            .lock()
            .payments
            .iter()
            .find(|p| p.idempotency_key == key)
            .cloned())
    }

    async fn idempotency_insert(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        let mut t = self.tables.lock();
        if t.idempotency.contains_key(&record.key) {
            return Ok(false);
        }
        t.idempotency.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    async fn idempotency_get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.tables.lock().idempotency.get(key).cloned())
    }

    async fn idempotency_delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables.lock();
        let before = t.idempotency.len();
        t.idempotency.retain(|_, record| record.expires_at > now);
        Ok((before - t.idempotency.len()) as u64)
    }

    async fn insert_webhook(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        if t.webhooks.iter().any(|e| e.id == event.id) {
            return Err(StoreError::duplicate("webhook", event.id.clone()));
        }
        t.webhooks.push(event.clone());
        Ok(())
    }

    async fn update_webhook(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        match t.webhooks.iter_mut().find(|e| e.id == event.id) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!(
                "webhook {} does not exist for update",
                event.id
            ))),
        }
    }

    async fn webhook_by_id(&self, id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self
            .tables
            .lock()
            .webhooks
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn due_webhooks(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError> {
        Ok(self
            .tables
            .lock()
            .webhooks
            .iter()
            .filter(|e| {
                matches!(e.status, WebhookStatus::Failed | WebhookStatus::Retrying)
                    && e.retry_count < e.max_retries
                    && e.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::txlog::TransactionKind;
    use std::time::Duration as StdDuration;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, Currency::USD)
    }

    #[tokio::test]
    async fn one_wallet_per_account() {
        let store = MemoryStore::new();
        store.create_wallet(1, Currency::USD).await.unwrap();
        let err = store.create_wallet(1, Currency::USD).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn lock_missing_wallet_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.lock_wallets(&[7]).await.err(),
            Some(StoreError::MissingWallet(7))
        ));
    }

    #[tokio::test]
    async fn lock_excludes_concurrent_writers() {
        let store = Arc::new(MemoryStore::new());
        let wallet = store.create_wallet(1, Currency::USD).await.unwrap();
        let id = wallet.id();

        let txn = store.lock_wallets(&[id]).await.unwrap();

        // A second lock attempt must block until the first txn resolves.
        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let txn = store.lock_wallets(&[id]).await.unwrap();
                txn.commit().await.unwrap();
            })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!contender.is_finished());

        txn.commit().await.unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_commit_has_no_partial_effects() {
        let store = MemoryStore::new();
        let wallet = store.create_wallet(1, Currency::USD).await.unwrap();
        let id = wallet.id();

        let store_ref = &store;
        let commit_deposit = |minor: i64| async move {
            let mut txn = store_ref.lock_wallets(&[id]).await.unwrap();
            let mut w = txn.wallet(id).unwrap();
            let delta = w.credit(usd(minor)).unwrap();
            let record = TransactionRecord::new(
                id,
                TransactionKind::Deposit,
                usd(minor),
                delta.before,
                delta.after,
                "deposit",
                Some("K1".to_string()),
                None,
            )
            .unwrap();
            txn.update_wallet(w);
            txn.append_transaction(record);
            txn.commit().await
        };

        commit_deposit(10_000).await.unwrap();
        let err = commit_deposit(10_000).await.unwrap_err();
        assert!(err.is_duplicate());

        // First commit stands; the losing batch left nothing behind.
        let w = store.wallet(id).await.unwrap().unwrap();
        assert_eq!(w.balance(), usd(10_000));
    }

    #[tokio::test]
    async fn due_webhooks_filters_status_budget_and_time() {
        use crate::core_types::new_reference;
        use chrono::Duration;

        let store = MemoryStore::new();
        let base = WebhookEvent {
            id: new_reference(),
            event_type: "payment.status_changed".into(),
            payload: "{}".into(),
            target_url: "http://example.test".into(),
            signature: "sig".into(),
            status: WebhookStatus::Failed,
            retry_count: 0,
            max_retries: 5,
            next_retry_at: Some(Utc::now() - Duration::seconds(1)),
            http_status: None,
            response_body: None,
            last_attempt_at: None,
            created_at: Utc::now(),
        };

        let due = base.clone();
        let not_yet = WebhookEvent {
            id: new_reference(),
            next_retry_at: Some(Utc::now() + Duration::minutes(5)),
            ..base.clone()
        };
        let spent = WebhookEvent {
            id: new_reference(),
            retry_count: 5,
            ..base.clone()
        };
        let delivered = WebhookEvent {
            id: new_reference(),
            status: WebhookStatus::Delivered,
            ..base.clone()
        };
        for e in [&due, &not_yet, &spent, &delivered] {
            store.insert_webhook(e).await.unwrap();
        }

        let found = store.due_webhooks(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }
}
