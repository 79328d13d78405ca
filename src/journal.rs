//! Transaction Journal
//!
//! Append-only record of money movements. Rows are built with [`entry`] and
//! either staged into a [`LedgerBatch`](crate::ledger::LedgerBatch) (when a
//! balance changes in the same operation) or persisted on their own with
//! [`Journal::record`].
//!
//! # Reference format
//! `{TypeInitial}{YYYYMMDD}-{8 Crockford base32 chars}`, e.g. `D20250314-7K3QW9ZD`.
//! Uniqueness is enforced by the store; a collision regenerates the suffix.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::core_types::{RequestId, TransactionId, TransferId, UserId};
use crate::currency::Currency;
use crate::error::{WalletError, WalletResult};
use crate::models::{PaymentMethod, Transaction, TransactionStatus, TransactionType};
use crate::money::round_money;
use crate::store::{CommitBatch, LedgerRepository, Page, StoreError, TransactionFilter};

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const REFERENCE_SUFFIX_LEN: usize = 8;

/// Generate a fresh human-readable reference
pub fn generate_reference(tx_type: TransactionType, at: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..REFERENCE_SUFFIX_LEN)
        .map(|_| CROCKFORD_ALPHABET[rng.gen_range(0..CROCKFORD_ALPHABET.len())] as char)
        .collect();
    format!("{}{}-{}", tx_type.initial(), at.format("%Y%m%d"), suffix)
}

// ============================================================================
// Entry builder
// ============================================================================

/// Builder for a new journal row
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    id: TransactionId,
    owner: UserId,
    tx_type: TransactionType,
    amount: Decimal,
    currency: Currency,
    counterparty: Option<UserId>,
    method: PaymentMethod,
    status: TransactionStatus,
    notes: Option<String>,
    gateway_ref: Option<String>,
    transfer_id: Option<TransferId>,
    request_id: Option<RequestId>,
    destination: Option<String>,
    exchange: Option<(Currency, Decimal, Decimal)>,
}

/// Start a completed, wallet-method row
pub fn entry(owner: &UserId, tx_type: TransactionType, amount: Decimal, currency: Currency) -> EntryBuilder {
    EntryBuilder {
        id: TransactionId::new(),
        owner: owner.clone(),
        tx_type,
        amount,
        currency,
        counterparty: None,
        method: PaymentMethod::Wallet,
        status: TransactionStatus::Completed,
        notes: None,
        gateway_ref: None,
        transfer_id: None,
        request_id: None,
        destination: None,
        exchange: None,
    }
}

impl EntryBuilder {
    pub fn id(mut self, id: TransactionId) -> Self {
        self.id = id;
        self
    }

    pub fn counterparty(mut self, user_id: &UserId) -> Self {
        self.counterparty = Some(user_id.clone());
        self
    }

    pub fn method(mut self, method: PaymentMethod) -> Self {
        self.method = method;
        self
    }

    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn gateway_ref(mut self, gateway_ref: Option<String>) -> Self {
        self.gateway_ref = gateway_ref;
        self
    }

    pub fn transfer(mut self, transfer_id: TransferId) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    pub fn request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn destination(mut self, destination: Option<String>) -> Self {
        self.destination = destination;
        self
    }

    /// Exchange legs: target currency, executed rate, credited amount
    pub fn exchange(mut self, to: Currency, rate: Decimal, converted: Decimal) -> Self {
        self.exchange = Some((to, rate, converted));
        self
    }

    /// Materialize with a fresh reference; amounts are rounded here.
    pub fn build(&self) -> Transaction {
        let now = Utc::now();
        let (currency_to, exchange_rate, converted_amount) = match self.exchange {
            Some((to, rate, converted)) => (Some(to), Some(rate), Some(round_money(converted))),
            None => (None, None, None),
        };
        Transaction {
            id: self.id,
            owner_user_id: self.owner.clone(),
            counterparty_user_id: self.counterparty.clone(),
            tx_type: self.tx_type,
            amount: round_money(self.amount),
            fee: round_money(Decimal::ZERO),
            currency_from: self.currency,
            currency_to,
            exchange_rate,
            converted_amount,
            payment_method: self.method,
            status: self.status,
            reference: generate_reference(self.tx_type, now),
            notes: self.notes.clone(),
            gateway_ref: self.gateway_ref.clone(),
            transfer_id: self.transfer_id,
            request_id: self.request_id,
            destination: self.destination.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub pages: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub transactions: Vec<Transaction>,
    pub pagination: Pagination,
}

pub struct Journal {
    repo: Arc<dyn LedgerRepository>,
    max_retries: u32,
}

impl Journal {
    pub fn new(repo: Arc<dyn LedgerRepository>, max_retries: u32) -> Self {
        Self { repo, max_retries }
    }

    /// Persist a row that moves no balance (pending deposits and the like)
    pub async fn record(&self, builder: EntryBuilder) -> WalletResult<Transaction> {
        let mut attempt = 0u32;
        loop {
            let tx = builder.build();
            let batch = CommitBatch {
                new_transactions: vec![tx.clone()],
                ..Default::default()
            };
            match self.repo.commit(batch).await {
                Ok(()) => {
                    tracing::debug!(id = %tx.id, reference = %tx.reference, "Journal row recorded");
                    return Ok(tx);
                }
                Err(StoreError::DuplicateReference(reference)) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(%reference, attempt, "Reference collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Newest-first page of the owner's rows
    pub async fn query(
        &self,
        owner: &UserId,
        filter: &TransactionFilter,
        page: Page,
    ) -> WalletResult<HistoryPage> {
        let (transactions, total) = self.repo.query_transactions(owner, filter, page).await?;
        let pages = total.div_ceil(page.page_size as u64);
        Ok(HistoryPage {
            transactions,
            pagination: Pagination {
                total,
                page: page.page,
                pages,
                limit: page.page_size,
            },
        })
    }

    /// Single row, visible only to its owner or counterparty
    pub async fn get(&self, id: TransactionId, caller: &UserId) -> WalletResult<Transaction> {
        match self.repo.get_transaction(id).await? {
            Some(tx) if tx.is_visible_to(caller) => Ok(tx),
            // Foreign rows are indistinguishable from missing ones
            _ => Err(WalletError::NotFound(format!("transaction {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_reference_format() {
        let at = DateTime::parse_from_rfc3339("2025-03-14T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let reference = generate_reference(TransactionType::Deposit, at);
        assert!(reference.starts_with("D20250314-"));
        let suffix = &reference["D20250314-".len()..];
        assert_eq!(suffix.len(), REFERENCE_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| CROCKFORD_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_build_rounds_and_regenerates_reference() {
        let builder = entry(
            &UserId::from("alice"),
            TransactionType::Exchange,
            Decimal::from(100),
            Currency::Usd,
        )
        .exchange(Currency::Eur, Decimal::new(93, 2), Decimal::new(93000, 3));
        let first = builder.build();
        let second = builder.build();
        assert_eq!(first.amount.to_string(), "100.00");
        assert_eq!(first.converted_amount.unwrap().to_string(), "93.00");
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, TransactionStatus::Completed);
        assert_eq!(first.payment_method, PaymentMethod::Wallet);
    }

    #[tokio::test]
    async fn test_history_paging_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store, 5);
        let alice = UserId::from("alice");
        for i in 1..=5 {
            journal
                .record(entry(&alice, TransactionType::Deposit, Decimal::from(i), Currency::Usd))
                .await
                .unwrap();
        }
        journal
            .record(entry(&alice, TransactionType::Withdraw, Decimal::ONE, Currency::Eur))
            .await
            .unwrap();

        let page = journal
            .query(&alice, &TransactionFilter::default(), Page::new(Some(1), Some(4)))
            .await
            .unwrap();
        assert_eq!(page.pagination.total, 6);
        assert_eq!(page.pagination.pages, 2);
        assert_eq!(page.transactions.len(), 4);
        assert_eq!(page.transactions[0].tx_type, TransactionType::Withdraw);

        let deposits = journal
            .query(
                &alice,
                &TransactionFilter {
                    tx_type: Some(TransactionType::Deposit),
                    currency: Some(Currency::Usd),
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(deposits.pagination.total, 5);
    }

    #[tokio::test]
    async fn test_get_hides_foreign_rows() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store, 5);
        let alice = UserId::from("alice");
        let tx = journal
            .record(entry(&alice, TransactionType::Deposit, Decimal::ONE, Currency::Usd))
            .await
            .unwrap();

        assert!(journal.get(tx.id, &alice).await.is_ok());
        let err = journal.get(tx.id, &UserId::from("mallory")).await.unwrap_err();
        assert!(matches!(err, WalletError::NotFound(_)));
    }
}
