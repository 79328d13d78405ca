//! Storage layer
//!
//! Repository traits consumed by the ledger, journal and verification gate,
//! plus two implementations:
//! - [`MemoryStore`]: single-process store (tests, demos, `postgres_url` unset)
//! - [`PgStore`]: PostgreSQL via `sqlx`
//!
//! # Atomicity
//!
//! Every balance-affecting operation is expressed as one [`CommitBatch`]:
//! balance writes carrying the version they were read at, new journal rows,
//! status compare-and-swap updates and money-request changes. A store applies
//! a batch entirely or not at all. A stale balance version surfaces as
//! [`StoreError::VersionConflict`] and a reference collision as
//! [`StoreError::DuplicateReference`]; the ledger retries both.

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::{RequestId, TransactionId, UserId, VerificationId};
use crate::currency::Currency;
use crate::models::{
    Account, MoneyRequest, RequestDirection, RequestStatus, Transaction, TransactionStatus,
    TransactionType, UserProfile, VerificationKind, VerificationRecord, VerificationStatus,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Balance version conflict")]
    VersionConflict,

    #[error("Duplicate transaction reference: {0}")]
    DuplicateReference(String),

    #[error("Transaction already recorded: {0}")]
    DuplicateTransaction(String),

    #[error("Status conflict: {0}")]
    StatusConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

// ============================================================================
// Commit batch
// ============================================================================

/// New amount for one `(user, currency)` slot, valid only if the stored
/// version still equals `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceWrite {
    pub user_id: UserId,
    pub currency: Currency,
    pub expected_version: i64,
    pub new_amount: Decimal,
}

/// Compare-and-swap on a journal row's status
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionStatusUpdate {
    pub id: TransactionId,
    pub expected: TransactionStatus,
    pub next: TransactionStatus,
    /// Processor id learned after the row was created
    pub gateway_ref: Option<String>,
}

/// Compare-and-swap on a money request's status
#[derive(Debug, Clone, PartialEq)]
pub struct RequestStatusUpdate {
    pub id: RequestId,
    pub expected: RequestStatus,
    pub next: RequestStatus,
}

/// All writes of one logical operation
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub balances: Vec<BalanceWrite>,
    pub new_transactions: Vec<Transaction>,
    pub transaction_updates: Vec<TransactionStatusUpdate>,
    pub new_requests: Vec<MoneyRequest>,
    pub request_updates: Vec<RequestStatusUpdate>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
            && self.new_transactions.is_empty()
            && self.transaction_updates.is_empty()
            && self.new_requests.is_empty()
            && self.request_updates.is_empty()
    }

    /// References must also be unique within the batch itself
    pub(crate) fn duplicate_reference_in_batch(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.new_transactions
            .iter()
            .map(|t| t.reference.as_str())
            .find(|r| !seen.insert(*r))
    }
}

// ============================================================================
// Queries
// ============================================================================

/// History filter, all fields optional
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub tx_type: Option<TransactionType>,
    pub currency: Option<Currency>,
}

impl TransactionFilter {
    /// Currency matches either side of an exchange
    pub fn matches(&self, tx: &Transaction) -> bool {
        let type_ok = self.tx_type.is_none_or(|t| tx.tx_type == t);
        let currency_ok = self
            .currency
            .is_none_or(|c| tx.currency_from == c || tx.currency_to == Some(c));
        type_ok && currency_ok
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub const DEFAULT_SIZE: u32 = 10;
    pub const MAX_SIZE: u32 = 100;

    /// Clamp user input into a valid page
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(Self::DEFAULT_SIZE)
                .clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

// ============================================================================
// Repository traits
// ============================================================================

/// Accounts, journal rows and money requests
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn load_account(&self, user_id: &UserId) -> Result<Option<Account>, StoreError>;

    /// Insert `account` unless one exists; returns the stored account.
    async fn insert_account_if_absent(&self, account: Account) -> Result<Account, StoreError>;

    /// Apply a batch atomically (see module docs)
    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    async fn find_by_gateway_ref(&self, gateway_ref: &str)
    -> Result<Option<Transaction>, StoreError>;

    /// Rows owned by `owner`, newest first, plus the unpaginated total
    async fn query_transactions(
        &self,
        owner: &UserId,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<Transaction>, u64), StoreError>;

    async fn get_money_request(&self, id: RequestId) -> Result<Option<MoneyRequest>, StoreError>;

    async fn list_money_requests(
        &self,
        user_id: &UserId,
        direction: RequestDirection,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MoneyRequest>, StoreError>;
}

/// Verification records and the account-level verified flag
#[async_trait]
pub trait VerificationRepository: Send + Sync {
    async fn insert_verification(&self, record: VerificationRecord) -> Result<(), StoreError>;

    async fn get_verification(
        &self,
        id: VerificationId,
    ) -> Result<Option<VerificationRecord>, StoreError>;

    async fn list_user_verifications(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<VerificationRecord>, StoreError>;

    async fn list_verifications(
        &self,
        kind: Option<VerificationKind>,
        status: Option<VerificationStatus>,
    ) -> Result<Vec<VerificationRecord>, StoreError>;

    /// CAS on the record status; `StatusConflict` when `expected` is stale
    async fn update_verification_status(
        &self,
        id: VerificationId,
        expected: VerificationStatus,
        next: VerificationStatus,
        review_notes: Option<String>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<VerificationRecord, StoreError>;

    async fn set_user_verified(&self, user_id: &UserId, verified: bool) -> Result<(), StoreError>;

    /// Mirrored flag; `false` when the account does not exist yet
    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool, StoreError>;
}

/// Read-only view of the external user-identity service
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserProfile>, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamping() {
        let page = Page::new(Some(0), Some(1000));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, Page::MAX_SIZE);

        let page = Page::new(Some(3), Some(20));
        assert_eq!(page.offset(), 40);

        assert_eq!(Page::default().page_size, Page::DEFAULT_SIZE);
    }

    #[test]
    fn test_empty_batch() {
        assert!(CommitBatch::default().is_empty());
    }
}
