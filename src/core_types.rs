//! Core types used throughout the ledger.
//!
//! Fundamental aliases and id helpers shared by all modules.

use chrono::Utc;
use uuid::Uuid;

/// Wallet ID - row id assigned by the store, immutable after insert.
pub type WalletId = i64;

/// Account ID - owner of a wallet, assigned upstream.
pub type AccountId = i64;

/// Unique reference number carried by transactions, transfers, payments
/// and webhook events.
pub type Reference = String;

/// Fresh globally unique reference.
pub fn new_reference() -> Reference {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
