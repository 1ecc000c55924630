//! Ledger error taxonomy.
//!
//! Every mutation either completes fully or aborts with one of these before
//! any partial write; the store's atomic write units guarantee no partial
//! balance change is ever observable.

use crate::core_types::WalletId;
use crate::money::{Money, MoneyError};
use crate::store::StoreError;
use crate::wallet::WalletStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Money, available: Money },

    #[error("wallet {wallet_id} is not active (status: {status})")]
    WalletNotActive {
        wallet_id: WalletId,
        status: WalletStatus,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Store(StoreError),

    #[error("stored result corrupted: {0}")]
    Codec(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        LedgerError::InvalidOperation(msg.into())
    }
}

/// A missing wallet surfaces as `NotFound` whichever layer detects it.
impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MissingWallet(id) => LedgerError::not_found("Wallet", id.to_string()),
            other => LedgerError::Store(other),
        }
    }
}
