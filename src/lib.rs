//! Wallet Ledger
//!
//! Multi-currency wallet core: per-user balances, an append-only transaction
//! journal, a two-factor verification gate and a transfer engine that settles
//! card/bank movements through an external payment processor.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier newtypes (UserId, TransactionId, ...)
//! - [`currency`] - Supported currencies and the rate table
//! - [`money`] - Decimal validation and 2-dp rounding
//! - [`models`] - Account, Transaction, MoneyRequest, VerificationRecord
//! - [`error`] - `WalletError` taxonomy
//! - [`store`] - Repository traits, in-memory and PostgreSQL stores
//! - [`ledger`] - Locked, versioned balance mutation
//! - [`journal`] - Reference generation and history queries
//! - [`verification`] - Verification gate and domain events
//! - [`payment`] - Payment gateway adapter
//! - [`engine`] - Transfer engine
//! - [`cache`] - TTL keyed store
//! - [`gateway`] - axum HTTP surface

// Core types - must be first!
pub mod core_types;

pub mod currency;
pub mod error;
pub mod models;
pub mod money;

// Storage and the components over it
pub mod cache;
pub mod journal;
pub mod ledger;
pub mod store;
pub mod verification;

pub mod engine;
pub mod payment;

// Service shell
pub mod config;
pub mod gateway;
pub mod logging;

// Convenient re-exports at crate root
pub use core_types::{RequestId, TransactionId, TransferId, UserId, VerificationId};
pub use currency::{Currency, RateTable};
pub use engine::{EngineSettings, Recipient, TransferEngine};
pub use error::{WalletError, WalletResult};
pub use models::{
    Account, MoneyRequest, PaymentMethod, Transaction, TransactionStatus, TransactionType,
    VerificationKind, VerificationStatus,
};
pub use store::{MemoryStore, PgStore};
