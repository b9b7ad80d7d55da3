//! Keyed storage for shared per-request state.
//!
//! Sessions and consultations live behind [`KeyedStore`] so the backing map
//! can be swapped without touching callers.

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait KeyedStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V>;

    /// Insert or replace.
    async fn put(&self, key: String, value: V);

    async fn delete(&self, key: &str) -> Option<V>;

    /// Remove every entry matching `predicate` and return how many went.
    async fn sweep(&self, predicate: &(dyn for<'p> Fn(&'p V) -> bool + Send + Sync)) -> usize;

    async fn keys(&self) -> Vec<String>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn name(&self) -> &str;
}

/// Whole-map lock over a `HashMap`.
#[derive(Debug)]
pub struct InMemoryStore<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> InMemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for InMemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> KeyedStore<V> for InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    async fn put(&self, key: String, value: V) {
        self.entries.write().insert(key, value);
    }

    async fn delete(&self, key: &str) -> Option<V> {
        self.entries.write().remove(key)
    }

    async fn sweep(&self, predicate: &(dyn for<'p> Fn(&'p V) -> bool + Send + Sync)) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, value| !predicate(value));
        before - entries.len()
    }

    async fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Bounded cache with time-to-live, backed by moka.
///
/// Entries also disappear on their own once `ttl` has passed or capacity
/// forces an eviction.
pub struct CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<String, V>,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `max_entries`, each for `ttl`.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }
}

#[async_trait]
impl<V> KeyedStore<V> for CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key).await
    }

    async fn put(&self, key: String, value: V) {
        self.cache.insert(key, value).await;
    }

    async fn delete(&self, key: &str) -> Option<V> {
        self.cache.remove(key).await
    }

    async fn sweep(&self, predicate: &(dyn for<'p> Fn(&'p V) -> bool + Send + Sync)) -> usize {
        let doomed: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(key, _)| (*key).clone())
            .collect();

        let mut removed = 0;
        for key in doomed {
            if self.cache.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        removed
    }

    async fn keys(&self) -> Vec<String> {
        self.cache.iter().map(|(key, _)| (*key).clone()).collect()
    }

    async fn len(&self) -> usize {
        self.cache.iter().count()
    }

    fn name(&self) -> &str {
        "moka-cache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KeyedStore<u32>) {
        assert!(store.is_empty().await);
        for (key, value) in [("a", 1), ("b", 8), ("c", 12)] {
            store.put(key.to_string(), value).await;
        }
        store.put("a".to_string(), 2).await;

        assert_eq!(store.get("a").await, Some(2));
        assert_eq!(store.len().await, 3);

        let removed = store.sweep(&|value: &u32| *value > 5).await;
        assert_eq!(removed, 2);
        assert_eq!(store.keys().await, vec!["a".to_string()]);

        assert_eq!(store.delete("a").await, Some(2));
        assert_eq!(store.delete("a").await, None);
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryStore::<u32>::new()).await;
    }

    #[tokio::test]
    async fn test_cache_store() {
        exercise(&CacheStore::<u32>::new(100, Duration::from_secs(60))).await;
    }
}
