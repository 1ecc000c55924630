//! Durable store seam.
//!
//! The ledger core talks to its relational store through [`LedgerStore`].
//! Two implementations ship with the crate: [`memory::MemoryStore`] for
//! tests and dev mode, and [`postgres::PgStore`] backed by sqlx.
//!
//! # Locking contract
//! [`LedgerStore::lock_wallets`] acquires an exclusive lock per requested
//! wallet id, always in **ascending id order** regardless of argument order.
//! That ordering is the sole deadlock-avoidance mechanism for two-wallet
//! operations and must be preserved by every implementation. The returned
//! [`WalletTxn`] buffers writes; `commit` makes all of them durable as one
//! atomic unit and releases the locks only afterwards. Unique-key conflicts
//! surface as [`StoreError::Duplicate`] with no partial effects.

pub mod memory;
pub mod postgres;

use crate::core_types::{AccountId, WalletId};
use crate::idempotency::IdempotencyRecord;
use crate::money::Currency;
use crate::payment::Payment;
use crate::transfer::Transfer;
use crate::txlog::TransactionRecord;
use crate::wallet::Wallet;
use crate::webhook::WebhookEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint violated; the already-stored row is authoritative.
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("wallet {0} does not exist")]
    MissingWallet(WalletId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row corrupted: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn duplicate(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::Duplicate {
            entity,
            key: key.into(),
        }
    }

    pub const fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

/// One atomic write unit over a set of exclusively locked wallets.
///
/// Writes are buffered until [`commit`](WalletTxn::commit); dropping the txn
/// without committing releases the locks and discards everything.
#[async_trait]
pub trait WalletTxn: Send {
    /// Locked snapshot of a wallet requested in `lock_wallets`.
    fn wallet(&self, id: WalletId) -> Option<Wallet>;

    /// Stage the new state of a locked wallet.
    fn update_wallet(&mut self, wallet: Wallet);

    /// Stage an append-only transaction log entry.
    fn append_transaction(&mut self, record: TransactionRecord);

    /// Stage a transfer record insert.
    fn insert_transfer(&mut self, transfer: Transfer);

    /// Stage a payment record update.
    fn update_payment(&mut self, payment: Payment);

    /// Write everything durably as one unit, then release the locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    // --- wallets ---

    /// Insert a fresh wallet for the account; `Duplicate` if one exists.
    async fn create_wallet(
        &self,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<Wallet, StoreError>;

    async fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    async fn wallet_by_account(&self, account_id: AccountId)
    -> Result<Option<Wallet>, StoreError>;

    /// Acquire exclusive locks on the given wallets (ascending id order) and
    /// open an atomic write unit. Fails with `MissingWallet` if any id is
    /// unknown.
    async fn lock_wallets(&self, ids: &[WalletId]) -> Result<Box<dyn WalletTxn>, StoreError>;

    // --- transaction log (append happens inside WalletTxn) ---

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    async fn transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    // --- transfers (insert happens inside WalletTxn) ---

    async fn transfer_by_reference(&self, reference: &str)
    -> Result<Option<Transfer>, StoreError>;

    async fn transfer_by_idempotency_key(&self, key: &str)
    -> Result<Option<Transfer>, StoreError>;

    // --- payments ---

    /// Insert a new payment; `Duplicate` on idempotency-key conflict.
    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    async fn payment_by_reference(&self, reference: &str) -> Result<Option<Payment>, StoreError>;

    async fn payment_by_idempotency_key(&self, key: &str)
    -> Result<Option<Payment>, StoreError>;

    // --- idempotency records ---

    /// First-committer-wins insert. Returns `false` when the key already
    /// exists (the stored record is authoritative).
    async fn idempotency_insert(&self, record: &IdempotencyRecord) -> Result<bool, StoreError>;

    async fn idempotency_get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete records past expiry; returns the number removed.
    async fn idempotency_delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // --- webhook events ---

    async fn insert_webhook(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    async fn update_webhook(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    async fn webhook_by_id(&self, id: &str) -> Result<Option<WebhookEvent>, StoreError>;

    /// Events in FAILED or RETRYING whose `next_retry_at <= now` and whose
    /// retry budget is not exhausted.
    async fn due_webhooks(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError>;
}
