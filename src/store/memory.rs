//! In-process store
//!
//! One `tokio::sync::RwLock` guards every table; `commit` validates the whole
//! batch under the write lock before applying any of it.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{
    CommitBatch, LedgerRepository, Page, StoreError, TransactionFilter, UserDirectory,
    VerificationRepository,
};
use crate::core_types::{RequestId, TransactionId, UserId, VerificationId};
use crate::models::{
    Account, BalanceEntry, MoneyRequest, RequestDirection, RequestStatus, Transaction,
    UserProfile, VerificationKind, VerificationRecord, VerificationStatus,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<UserId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    references: HashSet<String>,
    gateway_refs: HashMap<String, TransactionId>,
    requests: HashMap<RequestId, MoneyRequest>,
    verifications: HashMap<VerificationId, VerificationRecord>,
    users: HashMap<UserId, UserProfile>,
}

impl Tables {
    fn validate(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        for write in &batch.balances {
            if write.new_amount < Decimal::ZERO {
                return Err(StoreError::Database(format!(
                    "negative balance for {} {}",
                    write.user_id, write.currency
                )));
            }
            let account = self
                .accounts
                .get(&write.user_id)
                .ok_or_else(|| StoreError::NotFound(format!("account {}", write.user_id)))?;
            let stored = account.entry(write.currency).map(|e| e.version).unwrap_or(0);
            if stored != write.expected_version {
                return Err(StoreError::VersionConflict);
            }
        }

        if let Some(dup) = batch.duplicate_reference_in_batch() {
            return Err(StoreError::DuplicateReference(dup.to_string()));
        }
        for tx in &batch.new_transactions {
            if self.transactions.contains_key(&tx.id) {
                return Err(StoreError::DuplicateTransaction(tx.id.to_string()));
            }
            if self.references.contains(&tx.reference) {
                return Err(StoreError::DuplicateReference(tx.reference.clone()));
            }
        }

        for update in &batch.transaction_updates {
            let current = self
                .transactions
                .get(&update.id)
                .ok_or_else(|| StoreError::NotFound(format!("transaction {}", update.id)))?;
            if current.status != update.expected {
                return Err(StoreError::StatusConflict(format!(
                    "transaction {} is {}, expected {}",
                    update.id, current.status, update.expected
                )));
            }
        }

        for update in &batch.request_updates {
            let current = self
                .requests
                .get(&update.id)
                .ok_or_else(|| StoreError::NotFound(format!("money request {}", update.id)))?;
            if current.status != update.expected {
                return Err(StoreError::StatusConflict(format!(
                    "money request {} is {}, expected {}",
                    update.id,
                    current.status.as_str(),
                    update.expected.as_str()
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, batch: CommitBatch) {
        let now = Utc::now();

        for write in batch.balances {
            if let Some(account) = self.accounts.get_mut(&write.user_id) {
                match account
                    .balances
                    .iter_mut()
                    .find(|e| e.currency == write.currency)
                {
                    Some(entry) => {
                        entry.amount = write.new_amount;
                        entry.version += 1;
                    }
                    None => account.balances.push(BalanceEntry {
                        currency: write.currency,
                        amount: write.new_amount,
                        version: 1,
                    }),
                }
            }
        }

        for tx in batch.new_transactions {
            self.references.insert(tx.reference.clone());
            if let Some(gateway_ref) = &tx.gateway_ref {
                self.gateway_refs.insert(gateway_ref.clone(), tx.id);
            }
            self.transactions.insert(tx.id, tx);
        }

        for update in batch.transaction_updates {
            if let Some(tx) = self.transactions.get_mut(&update.id) {
                tx.status = update.next;
                tx.updated_at = now;
                if let Some(gateway_ref) = update.gateway_ref {
                    self.gateway_refs.insert(gateway_ref.clone(), tx.id);
                    tx.gateway_ref = Some(gateway_ref);
                }
            }
        }

        for request in batch.new_requests {
            self.requests.insert(request.id, request);
        }

        for update in batch.request_updates {
            if let Some(request) = self.requests.get_mut(&update.id) {
                request.status = update.next;
                request.updated_at = now;
            }
        }
    }
}

/// In-memory implementation of every repository trait
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with the directory
    pub async fn add_user(&self, profile: UserProfile) {
        let mut tables = self.tables.write().await;
        tables.users.insert(profile.user_id.clone(), profile);
    }

    /// Number of journal rows, all owners
    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn load_account(&self, user_id: &UserId) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.read().await.accounts.get(user_id).cloned())
    }

    async fn insert_account_if_absent(&self, account: Account) -> Result<Account, StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .accounts
            .entry(account.user_id.clone())
            .or_insert(account);
        Ok(stored.clone())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.validate(&batch)?;
        tables.apply(batch);
        Ok(())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.tables.read().await.transactions.get(&id).cloned())
    }

    async fn find_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .gateway_refs
            .get(gateway_ref)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn query_transactions(
        &self,
        owner: &UserId,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<Transaction>, u64), StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<&Transaction> = tables
            .transactions
            .values()
            .filter(|t| &t.owner_user_id == owner && filter.matches(t))
            .collect();
        // Newest first; ULIDs break ties within the same timestamp
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.inner().cmp(&a.id.inner()))
        });
        let total = rows.len() as u64;
        let page_rows = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .cloned()
            .collect();
        Ok((page_rows, total))
    }

    async fn get_money_request(&self, id: RequestId) -> Result<Option<MoneyRequest>, StoreError> {
        Ok(self.tables.read().await.requests.get(&id).cloned())
    }

    async fn list_money_requests(
        &self,
        user_id: &UserId,
        direction: RequestDirection,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MoneyRequest>, StoreError> {
        let tables = self.tables.read().await;
        let mut requests: Vec<MoneyRequest> = tables
            .requests
            .values()
            .filter(|r| match direction {
                RequestDirection::Incoming => &r.target_user_id == user_id,
                RequestDirection::Outgoing => &r.requester_user_id == user_id,
            })
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }
}

#[async_trait]
impl VerificationRepository for MemoryStore {
    async fn insert_verification(&self, record: VerificationRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.verifications.insert(record.id, record);
        Ok(())
    }

    async fn get_verification(
        &self,
        id: VerificationId,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        Ok(self.tables.read().await.verifications.get(&id).cloned())
    }

    async fn list_user_verifications(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<VerificationRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<VerificationRecord> = tables
            .verifications
            .values()
            .filter(|v| &v.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_verifications(
        &self,
        kind: Option<VerificationKind>,
        status: Option<VerificationStatus>,
    ) -> Result<Vec<VerificationRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<VerificationRecord> = tables
            .verifications
            .values()
            .filter(|v| kind.is_none_or(|k| v.kind == k))
            .filter(|v| status.is_none_or(|s| v.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn update_verification_status(
        &self,
        id: VerificationId,
        expected: VerificationStatus,
        next: VerificationStatus,
        review_notes: Option<String>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<VerificationRecord, StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .verifications
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("verification {}", id)))?;
        if record.status != expected {
            return Err(StoreError::StatusConflict(format!(
                "verification {} is {}, expected {}",
                id,
                record.status.as_str(),
                expected.as_str()
            )));
        }
        record.status = next;
        record.review_notes = review_notes;
        record.reviewed_at = Some(reviewed_at);
        Ok(record.clone())
    }

    async fn set_user_verified(&self, user_id: &UserId, verified: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .accounts
            .entry(user_id.clone())
            .or_insert_with(|| Account::zeroed(user_id.clone()))
            .verified = verified;
        Ok(())
    }

    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.get(user_id).is_some_and(|a| a.verified))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.tables.read().await.users.get(user_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::models::{PaymentMethod, TransactionStatus, TransactionType};
    use crate::store::{BalanceWrite, TransactionStatusUpdate};

    fn tx(owner: &str, reference: &str) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: TransactionId::new(),
            owner_user_id: UserId::from(owner),
            counterparty_user_id: None,
            tx_type: TransactionType::Deposit,
            amount: Decimal::new(1000, 2),
            fee: Decimal::ZERO,
            currency_from: Currency::Usd,
            currency_to: None,
            exchange_rate: None,
            converted_amount: None,
            payment_method: PaymentMethod::Cash,
            status: TransactionStatus::Pending,
            reference: reference.to_string(),
            notes: None,
            gateway_ref: None,
            transfer_id: None,
            request_id: None,
            destination: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_stale_version_rejected_and_nothing_applied() {
        let store = MemoryStore::new();
        let user = UserId::from("alice");
        store
            .insert_account_if_absent(Account::zeroed(user.clone()))
            .await
            .unwrap();

        let write = BalanceWrite {
            user_id: user.clone(),
            currency: Currency::Usd,
            expected_version: 0,
            new_amount: Decimal::from(10),
        };
        store
            .commit(CommitBatch {
                balances: vec![write.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        // Same expected version again: stale
        let result = store
            .commit(CommitBatch {
                balances: vec![write],
                new_transactions: vec![tx("alice", "D20250101-AAAAAAAA")],
                ..Default::default()
            })
            .await;
        assert_eq!(result, Err(StoreError::VersionConflict));
        assert_eq!(store.transaction_count().await, 0);

        let account = store.load_account(&user).await.unwrap().unwrap();
        assert_eq!(account.balance(Currency::Usd), Decimal::from(10));
        assert_eq!(account.entry(Currency::Usd).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected() {
        let store = MemoryStore::new();
        store
            .commit(CommitBatch {
                new_transactions: vec![tx("alice", "D20250101-BBBBBBBB")],
                ..Default::default()
            })
            .await
            .unwrap();
        let result = store
            .commit(CommitBatch {
                new_transactions: vec![tx("bob", "D20250101-BBBBBBBB")],
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateReference(_))));
    }

    #[tokio::test]
    async fn test_reused_transaction_id_rejected() {
        let store = MemoryStore::new();
        let first = tx("alice", "D20250101-CCCCCCCC");
        store
            .commit(CommitBatch {
                new_transactions: vec![first.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut replay = tx("alice", "D20250101-DDDDDDDD");
        replay.id = first.id;
        replay.status = TransactionStatus::Completed;
        let result = store
            .commit(CommitBatch {
                new_transactions: vec![replay],
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateTransaction(_))));
        let stored = store.get_transaction(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(stored.reference, "D20250101-CCCCCCCC");
    }

    #[tokio::test]
    async fn test_status_cas_and_gateway_index() {
        let store = MemoryStore::new();
        let row = tx("alice", "D20250101-CCCCCCCC");
        let id = row.id;
        store
            .commit(CommitBatch {
                new_transactions: vec![row],
                ..Default::default()
            })
            .await
            .unwrap();

        let update = TransactionStatusUpdate {
            id,
            expected: TransactionStatus::Pending,
            next: TransactionStatus::Completed,
            gateway_ref: Some("ch_123".to_string()),
        };
        store
            .commit(CommitBatch {
                transaction_updates: vec![update.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let found = store.find_by_gateway_ref("ch_123").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, TransactionStatus::Completed);

        let again = store
            .commit(CommitBatch {
                transaction_updates: vec![update],
                ..Default::default()
            })
            .await;
        assert!(matches!(again, Err(StoreError::StatusConflict(_))));
    }

    #[tokio::test]
    async fn test_find_user_by_email_case_insensitive() {
        let store = MemoryStore::new();
        store
            .add_user(UserProfile {
                user_id: UserId::from("bob"),
                email: "Bob@Example.com".to_string(),
                display_name: "Bob".to_string(),
            })
            .await;
        let found = store.find_by_email("bob@example.com").await.unwrap();
        assert_eq!(found.unwrap().user_id, UserId::from("bob"));
    }
}
