//! Ledger Store
//!
//! Owns every `(user, currency)` balance slot. All balance mutation goes
//! through [`Ledger::execute`]:
//!
//! 1. Acquire the per-slot locks for the touched keys, sorted and deduplicated
//!    so two-sided operations can never deadlock.
//! 2. Load the slots into a [`LedgerBatch`] with their current versions.
//! 3. Run the operation closure, which stages credits, debits and journal rows.
//! 4. Commit the batch atomically; on a version or reference conflict go back
//!    to step 2, up to `max_retries` times.
//!
//! The closure may run more than once and must be free of side effects other
//! than staging into the batch.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core_types::UserId;
use crate::currency::Currency;
use crate::error::{WalletError, WalletResult};
use crate::models::{Account, MoneyRequest, Transaction};
use crate::money::round_money;
use crate::store::{
    BalanceWrite, CommitBatch, LedgerRepository, RequestStatusUpdate, StoreError,
    TransactionStatusUpdate,
};

/// One balance slot
pub type SlotKey = (UserId, Currency);

/// Default commit retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 5;

// ============================================================================
// Lock table
// ============================================================================

/// Keyed async mutexes, created on first use and evicted once the last
/// holder or waiter lets go
pub struct LockTable<K = SlotKey>
where
    K: Eq + Hash + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

/// One held key; releases and evicts on drop
pub struct KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the Arc, so the entry survives until they finish
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Guards held for the duration of one ledger operation
pub struct SlotGuards {
    _guards: Vec<KeyGuard<SlotKey>>,
}

impl<K> Default for LockTable<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl LockTable<SlotKey> {
    /// Lock `keys` in canonical order
    pub async fn acquire(&self, keys: &[SlotKey]) -> SlotGuards {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.lock(key).await);
        }
        SlotGuards { _guards: guards }
    }
}

// ============================================================================
// Staged batch
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
    version: i64,
    original: Decimal,
    current: Decimal,
}

/// Writes staged by one attempt of a ledger operation
#[derive(Debug, Default)]
pub struct LedgerBatch {
    slots: BTreeMap<SlotKey, Slot>,
    commit: CommitBatch,
}

impl LedgerBatch {
    fn load(&mut self, key: SlotKey, version: i64, amount: Decimal) {
        self.slots.insert(
            key,
            Slot {
                version,
                original: amount,
                current: amount,
            },
        );
    }

    fn slot_mut(&mut self, user_id: &UserId, currency: Currency) -> WalletResult<&mut Slot> {
        self.slots
            .get_mut(&(user_id.clone(), currency))
            .ok_or_else(|| {
                WalletError::Storage(format!("balance slot {} {} not locked", user_id, currency))
            })
    }

    /// Staged balance of a locked slot
    pub fn balance(&self, user_id: &UserId, currency: Currency) -> WalletResult<Decimal> {
        self.slots
            .get(&(user_id.clone(), currency))
            .map(|s| s.current)
            .ok_or_else(|| {
                WalletError::Storage(format!("balance slot {} {} not locked", user_id, currency))
            })
    }

    /// Add `amount` to a slot; returns the new balance
    pub fn credit(
        &mut self,
        user_id: &UserId,
        currency: Currency,
        amount: Decimal,
    ) -> WalletResult<Decimal> {
        let slot = self.slot_mut(user_id, currency)?;
        let next = slot
            .current
            .checked_add(amount)
            .ok_or_else(|| WalletError::InvalidAmount("balance overflow".to_string()))?;
        slot.current = round_money(next);
        Ok(slot.current)
    }

    /// Subtract `amount`; `InsufficientFunds` if the slot would go negative
    pub fn debit(
        &mut self,
        user_id: &UserId,
        currency: Currency,
        amount: Decimal,
    ) -> WalletResult<Decimal> {
        let slot = self.slot_mut(user_id, currency)?;
        if slot.current < amount {
            return Err(WalletError::InsufficientFunds);
        }
        slot.current = round_money(slot.current - amount);
        Ok(slot.current)
    }

    pub fn record(&mut self, tx: Transaction) {
        self.commit.new_transactions.push(tx);
    }

    pub fn update_transaction(&mut self, update: TransactionStatusUpdate) {
        self.commit.transaction_updates.push(update);
    }

    pub fn insert_request(&mut self, request: MoneyRequest) {
        self.commit.new_requests.push(request);
    }

    pub fn update_request(&mut self, update: RequestStatusUpdate) {
        self.commit.request_updates.push(update);
    }

    fn into_commit(self) -> CommitBatch {
        let mut commit = self.commit;
        for ((user_id, currency), slot) in self.slots {
            if slot.current != slot.original {
                commit.balances.push(BalanceWrite {
                    user_id,
                    currency,
                    expected_version: slot.version,
                    new_amount: slot.current,
                });
            }
        }
        commit
    }
}

// ============================================================================
// Ledger
// ============================================================================

pub struct Ledger {
    repo: Arc<dyn LedgerRepository>,
    locks: LockTable,
    max_retries: u32,
}

impl Ledger {
    pub fn new(repo: Arc<dyn LedgerRepository>, max_retries: u32) -> Self {
        Self {
            repo,
            locks: LockTable::new(),
            max_retries,
        }
    }

    pub fn repository(&self) -> &Arc<dyn LedgerRepository> {
        &self.repo
    }

    /// Slots currently locked or awaited
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Idempotent: a second call returns the existing account unchanged.
    pub async fn get_or_create_account(&self, user_id: &UserId) -> WalletResult<Account> {
        if let Some(account) = self.repo.load_account(user_id).await? {
            return Ok(account);
        }
        let account = self
            .repo
            .insert_account_if_absent(Account::zeroed(user_id.clone()))
            .await?;
        tracing::info!(user_id = %user_id, "Account created");
        Ok(account)
    }

    pub async fn get_balance(&self, user_id: &UserId, currency: Currency) -> WalletResult<Decimal> {
        Ok(self.get_or_create_account(user_id).await?.balance(currency))
    }

    /// Apply a signed delta to one slot without journaling it.
    ///
    /// Used for administrative corrections; engine flows journal every change.
    pub async fn adjust_balance(
        &self,
        user_id: &UserId,
        currency: Currency,
        delta: Decimal,
    ) -> WalletResult<Account> {
        if delta.is_zero() {
            return Err(WalletError::InvalidAmount("delta must be non-zero".to_string()));
        }
        let magnitude = crate::money::validate_amount(delta.abs())?;
        let user = user_id.clone();
        self.execute(&[(user.clone(), currency)], |batch| {
            if delta.is_sign_negative() {
                batch.debit(&user, currency, magnitude)?;
            } else {
                batch.credit(&user, currency, magnitude)?;
            }
            Ok(())
        })
        .await?;
        self.get_or_create_account(user_id).await
    }

    /// Run `op` against the locked slots and commit its batch atomically.
    pub async fn execute<T, F>(&self, keys: &[SlotKey], mut op: F) -> WalletResult<T>
    where
        F: FnMut(&mut LedgerBatch) -> WalletResult<T>,
    {
        let _guards = self.locks.acquire(keys).await;

        let mut attempt = 0u32;
        loop {
            let mut batch = LedgerBatch::default();
            for (user_id, currency) in keys {
                let account = self.get_or_create_account(user_id).await?;
                let (version, amount) = account
                    .entry(*currency)
                    .map(|e| (e.version, e.amount))
                    .unwrap_or((0, Decimal::ZERO));
                batch.load((user_id.clone(), *currency), version, amount);
            }

            let output = op(&mut batch)?;
            let commit = batch.into_commit();
            if commit.is_empty() {
                return Ok(output);
            }

            match self.repo.commit(commit).await {
                Ok(()) => return Ok(output),
                Err(e @ (StoreError::VersionConflict | StoreError::DuplicateReference(_))) => {
                    if attempt >= self.max_retries {
                        tracing::error!(attempts = attempt + 1, error = %e, "Ledger commit retries exhausted");
                        return Err(WalletError::ConcurrencyConflict);
                    }
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Ledger commit conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ledger() -> (Arc<MemoryStore>, Ledger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), DEFAULT_MAX_RETRIES);
        (store, ledger)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (_, ledger) = ledger();
        let user = UserId::from("alice");
        let first = ledger.get_or_create_account(&user).await.unwrap();
        let second = ledger.get_or_create_account(&user).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.balances.len(), Currency::ALL.len());
    }

    #[tokio::test]
    async fn test_adjust_balance() {
        let (_, ledger) = ledger();
        let user = UserId::from("alice");
        ledger
            .adjust_balance(&user, Currency::Usd, Decimal::new(1000, 2))
            .await
            .unwrap();
        let account = ledger
            .adjust_balance(&user, Currency::Usd, Decimal::new(-250, 2))
            .await
            .unwrap();
        assert_eq!(account.balance(Currency::Usd), Decimal::new(750, 2));

        let err = ledger
            .adjust_balance(&user, Currency::Usd, Decimal::from(-100))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds);
        assert_eq!(
            ledger.get_balance(&user, Currency::Usd).await.unwrap(),
            Decimal::new(750, 2)
        );
    }

    #[tokio::test]
    async fn test_failed_closure_commits_nothing() {
        let (_, ledger) = ledger();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        ledger
            .adjust_balance(&alice, Currency::Usd, Decimal::from(10))
            .await
            .unwrap();

        let result: WalletResult<()> = ledger
            .execute(
                &[(alice.clone(), Currency::Usd), (bob.clone(), Currency::Usd)],
                |batch| {
                    batch.credit(&bob, Currency::Usd, Decimal::from(50))?;
                    batch.debit(&alice, Currency::Usd, Decimal::from(50))?;
                    Ok(())
                },
            )
            .await;
        assert_eq!(result, Err(WalletError::InsufficientFunds));
        assert_eq!(
            ledger.get_balance(&bob, Currency::Usd).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_unlocked_slot_is_rejected() {
        let (_, ledger) = ledger();
        let alice = UserId::from("alice");
        let result: WalletResult<Decimal> = ledger
            .execute(&[], |batch| batch.credit(&alice, Currency::Usd, Decimal::ONE))
            .await;
        assert!(matches!(result, Err(WalletError::Storage(_))));
    }

    #[tokio::test]
    async fn test_lock_keys_deduplicated() {
        let locks = LockTable::new();
        let key = (UserId::from("alice"), Currency::Usd);
        // Same key twice must not self-deadlock
        let guards = locks.acquire(&[key.clone(), key.clone()]).await;
        assert_eq!(locks.len(), 1);
        drop(guards);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_entry_outlives_waiters() {
        let locks = Arc::new(LockTable::<String>::new());
        let held = locks.lock("ch_1".to_string()).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("ch_1".to_string()).await;
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slot_locks_evicted_after_operations() {
        let (_, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    let user = UserId::new(format!("user{}", i % 7));
                    let currency = Currency::ALL[i % Currency::ALL.len()];
                    ledger
                        .adjust_balance(&user, currency, Decimal::ONE)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(ledger.lock_count(), 0);
    }

    /// Repository that reports a version conflict a fixed number of times
    struct FlakyRepo {
        inner: MemoryStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LedgerRepository for FlakyRepo {
        async fn load_account(&self, user_id: &UserId) -> Result<Option<Account>, StoreError> {
            self.inner.load_account(user_id).await
        }
        async fn insert_account_if_absent(&self, account: Account) -> Result<Account, StoreError> {
            self.inner.insert_account_if_absent(account).await
        }
        async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::VersionConflict);
            }
            self.inner.commit(batch).await
        }
        async fn get_transaction(
            &self,
            id: crate::core_types::TransactionId,
        ) -> Result<Option<Transaction>, StoreError> {
            self.inner.get_transaction(id).await
        }
        async fn find_by_gateway_ref(&self, r: &str) -> Result<Option<Transaction>, StoreError> {
            self.inner.find_by_gateway_ref(r).await
        }
        async fn query_transactions(
            &self,
            owner: &UserId,
            filter: &crate::store::TransactionFilter,
            page: crate::store::Page,
        ) -> Result<(Vec<Transaction>, u64), StoreError> {
            self.inner.query_transactions(owner, filter, page).await
        }
        async fn get_money_request(
            &self,
            id: crate::core_types::RequestId,
        ) -> Result<Option<MoneyRequest>, StoreError> {
            self.inner.get_money_request(id).await
        }
        async fn list_money_requests(
            &self,
            user_id: &UserId,
            direction: crate::models::RequestDirection,
            status: Option<crate::models::RequestStatus>,
        ) -> Result<Vec<MoneyRequest>, StoreError> {
            self.inner.list_money_requests(user_id, direction, status).await
        }
    }

    #[tokio::test]
    async fn test_conflict_retried_then_exhausted() {
        let repo = Arc::new(FlakyRepo {
            inner: MemoryStore::new(),
            conflicts_left: AtomicU32::new(2),
        });
        let ledger = Ledger::new(repo.clone(), 3);
        let alice = UserId::from("alice");

        let mut runs = 0;
        ledger
            .execute(&[(alice.clone(), Currency::Eur)], |batch| {
                runs += 1;
                batch.credit(&alice, Currency::Eur, Decimal::from(5))
            })
            .await
            .unwrap();
        assert_eq!(runs, 3);
        assert_eq!(
            ledger.get_balance(&alice, Currency::Eur).await.unwrap(),
            Decimal::from(5)
        );

        repo.conflicts_left.store(10, Ordering::SeqCst);
        let result = ledger
            .execute(&[(alice.clone(), Currency::Eur)], |batch| {
                batch.credit(&alice, Currency::Eur, Decimal::from(5))
            })
            .await;
        assert_eq!(result, Err(WalletError::ConcurrencyConflict));
    }
}
