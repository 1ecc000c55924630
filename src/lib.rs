//! paycore - Payments Ledger Core
//!
//! Exact-money wallet ledger with idempotent mutations, atomic transfers,
//! a hold/capture payment lifecycle and signed webhook delivery.
//!
//! # Modules
//!
//! - [`money`] - Exact fixed-point monetary amounts
//! - [`wallet`] - Wallet ledger: balances, holds, deposit/withdraw
//! - [`txlog`] - Append-only transaction log
//! - [`transfer`] - Atomic two-wallet transfer coordinator
//! - [`payment`] - Hold/capture/refund payment lifecycle
//! - [`webhook`] - Signed webhook delivery with retry backoff
//! - [`idempotency`] - Two-tier idempotency store
//! - [`store`] - Durable store seam (in-memory and Postgres)
//! - [`events`] - Fire-and-forget domain event publisher
//! - [`scheduler`] - Periodic maintenance loop

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod logging;
pub mod money;
pub mod payment;
pub mod scheduler;
pub mod store;
pub mod transfer;
pub mod txlog;
pub mod wallet;
pub mod webhook;

// Convenient re-exports at crate root
pub use core_types::{AccountId, Reference, WalletId};
pub use error::LedgerError;
pub use events::{DomainEvent, EventPublisher, TracingPublisher};
pub use idempotency::{IdempotencyCache, IdempotencyService, MemoryCache};
pub use money::{Currency, Money, MoneyError};
pub use payment::{Payment, PaymentRequest, PaymentService, PaymentStatus};
pub use store::{LedgerStore, StoreError, WalletTxn, memory::MemoryStore, postgres::PgStore};
pub use transfer::{Transfer, TransferCoordinator, TransferStatus};
pub use txlog::{TransactionKind, TransactionRecord, TransactionStatus};
pub use wallet::{BalanceView, MutationReceipt, Wallet, WalletLedger, WalletStatus};
pub use webhook::{WebhookConfig, WebhookDelivery, WebhookEvent, WebhookStatus};
