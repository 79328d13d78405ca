//! TTL keyed store
//!
//! Remembers keys for a bounded time. The engine uses it to acknowledge
//! duplicate webhook deliveries without touching the ledger. A shared
//! deployment would put a network cache behind [`TtlStore`]; the in-process
//! [`MemoryTtlStore`] is a size-bounded LRU from the `cached` crate with a
//! per-entry expiry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use cached::{Cached, SizedCache};
use tokio::sync::Mutex;

/// Default retention for processed webhook event ids
pub const DEFAULT_EVENT_TTL: Duration = Duration::from_secs(24 * 3600);

#[async_trait]
pub trait TtlStore: Send + Sync {
    /// Is `key` present and unexpired?
    async fn contains(&self, key: &str) -> bool;

    async fn insert(&self, key: &str, ttl: Duration);

    async fn remove(&self, key: &str);
}

pub struct MemoryTtlStore {
    entries: Mutex<SizedCache<String, Instant>>,
}

impl MemoryTtlStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(SizedCache::with_size(capacity.max(1))),
        }
    }
}

impl Default for MemoryTtlStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let key = key.to_string();
        match entries.cache_get(&key).copied() {
            Some(expires_at) if expires_at > Instant::now() => true,
            Some(_) => {
                entries.cache_remove(&key);
                false
            }
            None => false,
        }
    }

    async fn insert(&self, key: &str, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.cache_set(key.to_string(), Instant::now() + ttl);
    }

    async fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.cache_remove(&key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_expire() {
        let store = MemoryTtlStore::new(16);
        store.insert("evt_1", Duration::from_millis(30)).await;
        assert!(store.contains("evt_1").await);
        assert!(!store.contains("evt_2").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.contains("evt_1").await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryTtlStore::new(2);
        store.insert("a", DEFAULT_EVENT_TTL).await;
        store.insert("b", DEFAULT_EVENT_TTL).await;
        store.insert("c", DEFAULT_EVENT_TTL).await;
        assert!(!store.contains("a").await);
        assert!(store.contains("c").await);

        store.remove("c").await;
        assert!(!store.contains("c").await);
    }
}
