//! Wallet Ledger
//!
//! Owns balance and frozen-amount state per wallet. The [`Wallet`] type is
//! the single source of truth for balance mutations: fields are private and
//! every change goes through a validated method that returns `Result`.
//!
//! # Invariants (enforced):
//! - `balance >= 0` for all externally reachable operations
//! - `0 <= frozen <= balance` at all times
//! - `available = balance - frozen` is derived, never stored
//! - every mutation bumps `version`
//!
//! Service operations acquire an exclusive per-wallet lock through the store
//! before any read-modify-write, and the paired transaction-log append is
//! committed in the same atomic unit.

use crate::core_types::{AccountId, WalletId};
use crate::error::LedgerError;
use crate::events::{DomainEvent, EventPublisher};
use crate::idempotency::IdempotencyService;
use crate::money::{Currency, Money};
use crate::store::{LedgerStore, StoreError};
use crate::txlog::{TransactionKind, TransactionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletStatus {
    Active,
    Frozen,
    Closed,
}

impl WalletStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            WalletStatus::Active => "ACTIVE",
            WalletStatus::Frozen => "FROZEN",
            WalletStatus::Closed => "CLOSED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(WalletStatus::Active),
            "FROZEN" => Some(WalletStatus::Frozen),
            "CLOSED" => Some(WalletStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balance change produced by one mutation, for the transaction log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceDelta {
    pub before: Money,
    pub after: Money,
}

/// A single-currency wallet owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    id: WalletId,
    account_id: AccountId,
    balance: Money,
    frozen: Money,
    status: WalletStatus,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh empty wallet (id is assigned by the store on insert).
    pub fn new(id: WalletId, account_id: AccountId, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id,
            account_id,
            balance: Money::zero(currency),
            frozen: Money::zero(currency),
            status: WalletStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstruct from stored columns; store implementations only.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: WalletId,
        account_id: AccountId,
        balance: Money,
        frozen: Money,
        status: WalletStatus,
        version: i64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            account_id,
            balance,
            frozen,
            status,
            version,
            created_at,
            updated_at,
        }
    }

    pub const fn id(&self) -> WalletId {
        self.id
    }

    pub const fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub const fn balance(&self) -> Money {
        self.balance
    }

    pub const fn frozen(&self) -> Money {
        self.frozen
    }

    pub const fn currency(&self) -> Currency {
        self.balance.currency()
    }

    pub const fn status(&self) -> WalletStatus {
        self.status
    }

    pub const fn version(&self) -> i64 {
        self.version
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Spendable amount: `balance - frozen`. Never negative by invariant.
    pub fn available(&self) -> Money {
        // frozen <= balance is maintained by every mutator
        self.balance
            .checked_sub(self.frozen)
            .unwrap_or_else(|_| Money::zero(self.currency()))
    }

    fn ensure_active(&self) -> Result<(), LedgerError> {
        if self.status == WalletStatus::Active {
            Ok(())
        } else {
            Err(LedgerError::WalletNotActive {
                wallet_id: self.id,
                status: self.status,
            })
        }
    }

    fn validate(&self, amount: Money) -> Result<(), LedgerError> {
        self.ensure_active()?;
        amount.require_currency(self.currency())?;
        amount.require_positive()?;
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Increase the balance. Always succeeds for an active wallet.
    pub fn credit(&mut self, amount: Money) -> Result<BalanceDelta, LedgerError> {
        self.validate(amount)?;
        let before = self.balance;
        self.balance = before.checked_add(amount)?;
        self.touch();
        Ok(BalanceDelta {
            before,
            after: self.balance,
        })
    }

    /// Decrease the balance; fails when `available < amount`.
    pub fn debit(&mut self, amount: Money) -> Result<BalanceDelta, LedgerError> {
        self.validate(amount)?;
        let available = self.available();
        if available.lt(&amount)? {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        let before = self.balance;
        self.balance = before.checked_sub(amount)?;
        self.touch();
        Ok(BalanceDelta {
            before,
            after: self.balance,
        })
    }

    /// Reserve funds against future capture; fails when `available < amount`.
    pub fn freeze(&mut self, amount: Money) -> Result<(), LedgerError> {
        self.validate(amount)?;
        let available = self.available();
        if available.lt(&amount)? {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        self.frozen = self.frozen.checked_add(amount)?;
        self.touch();
        Ok(())
    }

    /// Release previously frozen funds; fails when `amount > frozen`.
    pub fn unfreeze(&mut self, amount: Money) -> Result<(), LedgerError> {
        self.validate(amount)?;
        if self.frozen.lt(&amount)? {
            return Err(LedgerError::invalid(format!(
                "cannot unfreeze {amount}: current frozen amount is {}",
                self.frozen
            )));
        }
        self.frozen = self.frozen.checked_sub(amount)?;
        self.touch();
        Ok(())
    }
}

/// Balance view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub wallet_id: WalletId,
    pub total_balance: Money,
    pub available_balance: Money,
    pub frozen_amount: Money,
    pub currency: Currency,
}

/// Result of an idempotent deposit/withdraw: the wallet after the mutation
/// plus the single transaction-log entry it produced. Replays of the same
/// idempotency key return this receipt unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub wallet: Wallet,
    pub transaction: TransactionRecord,
}

/// Wallet Ledger service: account-facing deposit/withdraw plus wallet
/// creation and balance lookup. Freeze/unfreeze/debit/credit primitives are
/// exercised under store locks by this service and by the transfer/payment
/// coordinators.
pub struct WalletLedger<S: LedgerStore> {
    store: Arc<S>,
    idempotency: Arc<IdempotencyService<S>>,
    events: Arc<dyn EventPublisher>,
}

impl<S: LedgerStore> WalletLedger<S> {
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

    /// Create the wallet for an account. One wallet per account; a second
    /// create for the same account is rejected.
    pub async fn create_wallet(
        &self,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<Wallet, LedgerError> {
        info!(account_id, %currency, "creating wallet");
        match self.store.create_wallet(account_id, currency).await {
            Ok(wallet) => {
                info!(wallet_id = wallet.id(), account_id, "wallet created");
                Ok(wallet)
            }
            Err(StoreError::Duplicate { .. }) => Err(LedgerError::invalid(format!(
                "wallet already exists for account {account_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn wallet(&self, wallet_id: WalletId) -> Result<Wallet, LedgerError> {
        self.store
            .wallet(wallet_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Wallet", wallet_id.to_string()))
    }

    pub async fn balance(&self, wallet_id: WalletId) -> Result<BalanceView, LedgerError> {
        let wallet = self.wallet(wallet_id).await?;
        Ok(BalanceView {
            wallet_id: wallet.id(),
            total_balance: wallet.balance(),
            available_balance: wallet.available(),
            frozen_amount: wallet.frozen(),
            currency: wallet.currency(),
        })
    }

    /// Idempotent deposit: credits the balance and appends one DEPOSIT log
    /// entry in the same atomic unit.
    pub async fn deposit(
        &self,
        wallet_id: WalletId,
        amount: Money,
        description: Option<&str>,
        idempotency_key: &str,
    ) -> Result<MutationReceipt, LedgerError> {
        info!(wallet_id, %amount, idempotency_key, "processing deposit");
        self.mutate(
            wallet_id,
            amount,
            TransactionKind::Deposit,
            description.unwrap_or("Deposit to wallet"),
            idempotency_key,
        )
        .await
    }

    /// Idempotent withdrawal: debits the available balance and appends one
    /// WITHDRAWAL log entry in the same atomic unit.
    pub async fn withdraw(
        &self,
        wallet_id: WalletId,
        amount: Money,
        description: Option<&str>,
        idempotency_key: &str,
    ) -> Result<MutationReceipt, LedgerError> {
        info!(wallet_id, %amount, idempotency_key, "processing withdrawal");
        self.mutate(
            wallet_id,
            amount,
            TransactionKind::Withdrawal,
            description.unwrap_or("Withdrawal from wallet"),
            idempotency_key,
        )
        .await
    }

    async fn mutate(
        &self,
        wallet_id: WalletId,
        amount: Money,
        kind: TransactionKind,
        description: &str,
        idempotency_key: &str,
    ) -> Result<MutationReceipt, LedgerError> {
        if let Some(stored) = self.idempotency.check(idempotency_key).await? {
            debug!(idempotency_key, "duplicate request, returning stored result");
            return Ok(serde_json::from_str(&stored.body)?);
        }

        amount.require_positive()?;

        let mut txn = self.store.lock_wallets(&[wallet_id]).await?;
        let mut wallet = txn
            .wallet(wallet_id)
            .ok_or_else(|| LedgerError::not_found("Wallet", wallet_id.to_string()))?;

        let delta = match kind {
            TransactionKind::Deposit => wallet.credit(amount)?,
            TransactionKind::Withdrawal => wallet.debit(amount)?,
            other => {
                return Err(LedgerError::invalid(format!(
                    "{other} is not an account-facing mutation"
                )));
            }
        };

        let record = TransactionRecord::new(
            wallet_id,
            kind,
            amount,
            delta.before,
            delta.after,
            description,
            Some(idempotency_key.to_string()),
            None,
        )?;

        txn.update_wallet(wallet.clone());
        txn.append_transaction(record.clone());

        match txn.commit().await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                // Lost the first-commit race; the winner's result is
                // authoritative.
                return self.read_back(idempotency_key).await;
            }
            Err(e) => return Err(e.into()),
        }

        let receipt = MutationReceipt {
            wallet: wallet.clone(),
            transaction: record,
        };
        self.idempotency
            .save(
                idempotency_key,
                &serde_json::to_string(&receipt)?,
                200,
                None,
            )
            .await;

        self.events.publish(&DomainEvent::WalletMutated {
            wallet_id,
            account_id: wallet.account_id(),
            kind,
            amount,
            balance: wallet.balance(),
        });

        info!(wallet_id, %amount, new_balance = %wallet.balance(), "{kind} completed");
        Ok(receipt)
    }

    async fn read_back(&self, idempotency_key: &str) -> Result<MutationReceipt, LedgerError> {
        if let Some(stored) = self.idempotency.check(idempotency_key).await? {
            return Ok(serde_json::from_str(&stored.body)?);
        }
        let transaction = self
            .store
            .transaction_by_idempotency_key(idempotency_key)
            .await?
            .ok_or_else(|| LedgerError::not_found("Transaction", idempotency_key))?;
        let wallet = self.wallet(transaction.wallet_id).await?;
        Ok(MutationReceipt {
            wallet,
            transaction,
        })
    }
}
