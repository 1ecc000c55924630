//! Transaction Log
//!
//! Append-only audit trail of every balance-affecting operation. Records are
//! constructed through [`TransactionRecord::new`], appended inside an atomic
//! store write unit, and never mutated afterwards.

use crate::core_types::{Reference, WalletId, new_reference};
use crate::error::LedgerError;
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sign convention of a log entry relative to the wallet balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    TransferIn,
    TransferOut,
    Payment,
    Refund,
}

impl TransactionKind {
    /// Whether this kind increases (+1) or decreases (-1) the balance.
    pub const fn sign(self) -> i64 {
        match self {
            TransactionKind::Deposit | TransactionKind::TransferIn | TransactionKind::Refund => 1,
            TransactionKind::Withdrawal
            | TransactionKind::TransferOut
            | TransactionKind::Payment => -1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdrawal => "WITHDRAWAL",
            TransactionKind::TransferIn => "TRANSFER_IN",
            TransactionKind::TransferOut => "TRANSFER_OUT",
            TransactionKind::Payment => "PAYMENT",
            TransactionKind::Refund => "REFUND",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(TransactionKind::Deposit),
            "WITHDRAWAL" => Some(TransactionKind::Withdrawal),
            "TRANSFER_IN" => Some(TransactionKind::TransferIn),
            "TRANSFER_OUT" => Some(TransactionKind::TransferOut),
            "PAYMENT" => Some(TransactionKind::Payment),
            "REFUND" => Some(TransactionKind::Refund),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Completed,
}

impl TransactionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Completed => "COMPLETED",
        }
    }
}

/// One immutable entry of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unique reference number.
    pub reference: Reference,
    pub wallet_id: WalletId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: String,
    /// Unique when present; duplicate appends are rejected by the store.
    pub idempotency_key: Option<String>,
    /// Peer wallet for transfer entries.
    pub counterparty_wallet_id: Option<WalletId>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Build a log entry, enforcing `balance_after = balance_before ± amount`
    /// per the kind's sign convention.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet_id: WalletId,
        kind: TransactionKind,
        amount: Money,
        balance_before: Money,
        balance_after: Money,
        description: impl Into<String>,
        idempotency_key: Option<String>,
        counterparty_wallet_id: Option<WalletId>,
    ) -> Result<Self, LedgerError> {
        amount.require_positive()?;
        amount.require_currency(balance_before.currency())?;

        let expected = if kind.sign() > 0 {
            balance_before.checked_add(amount)?
        } else {
            balance_before.checked_sub(amount)?
        };
        if expected != balance_after {
            return Err(LedgerError::invalid(format!(
                "transaction {kind} breaks balance arithmetic: {balance_before} -> {balance_after} with amount {amount}"
            )));
        }

        Ok(Self {
            reference: new_reference(),
            wallet_id,
            kind,
            status: TransactionStatus::Completed,
            amount,
            balance_before,
            balance_after,
            description: description.into(),
            idempotency_key,
            counterparty_wallet_id,
            created_at: Utc::now(),
        })
    }
}
