use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cache::DistributedCache;
use crate::error::StoreError;

/// In-memory stand-in for a distributed cache.
///
/// Keys are kept ordered so prefix scans are range reads. An optional TTL
/// expires entries lazily. It is intended for tests and single-instance
/// deployments; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<BTreeMap<String, CacheEntry>>>,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    updated_at: Instant,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures a time-to-live for cache entries.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Removes every entry, simulating a cache flush or restart.
    pub fn clear(&self) {
        self.inner.lock().expect("poisoned lock").clear();
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().expect("poisoned lock");
        guard
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .count()
    }

    /// Returns true when no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.updated_at) > ttl)
    }

    fn prune_expired(&self, state: &mut BTreeMap<String, CacheEntry>, now: Instant) {
        if self.ttl.is_some() {
            state.retain(|_, entry| !self.is_expired(entry, now));
        }
    }
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        if let Some(entry) = guard.get(key)
            && self.is_expired(entry, now)
        {
            guard.remove(key);
            return Ok(None);
        }
        Ok(guard.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String) -> std::result::Result<(), StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        self.prune_expired(&mut guard, now);
        guard.insert(
            key.to_string(),
            CacheEntry {
                value,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn set_many(
        &self,
        entries: Vec<(String, String)>,
    ) -> std::result::Result<(), StoreError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");
        self.prune_expired(&mut guard, now);
        for (key, value) in entries {
            guard.insert(
                key,
                CacheEntry {
                    value,
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
        self.inner.lock().expect("poisoned lock").remove(key);
        Ok(())
    }

    async fn keys_with_prefix(
        &self,
        prefix: &str,
    ) -> std::result::Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let guard = self.inner.lock().expect("poisoned lock");
        Ok(guard
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DistributedCacheExt;
    use futures::executor::block_on;

    #[test]
    fn prefix_scan_should_only_return_matching_keys() {
        let cache = MemoryCache::new();
        block_on(cache.set("ShardingEntry-A", "a".to_string())).unwrap();
        block_on(cache.set("ShardingEntry-B", "b".to_string())).unwrap();
        block_on(cache.set("UserPermissions-1", "x".to_string())).unwrap();

        let keys = block_on(cache.keys_with_prefix("ShardingEntry-")).unwrap();

        assert_eq!(keys, vec!["ShardingEntry-A", "ShardingEntry-B"]);
    }

    #[test]
    fn ttl_should_expire_entries() {
        let cache = MemoryCache::new().with_ttl(Duration::from_millis(10));
        block_on(cache.set("k", "v".to_string())).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(block_on(cache.get("k")).unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn class_helpers_should_round_trip_json() {
        let cache = MemoryCache::new();
        block_on(cache.set_class("nums", &vec![1, 2, 3])).unwrap();

        let nums: Option<Vec<i32>> = block_on(cache.get_class("nums")).unwrap();

        assert_eq!(nums, Some(vec![1, 2, 3]));
    }

    #[test]
    fn clones_should_share_state() {
        let cache = MemoryCache::new();
        let other = cache.clone();
        block_on(cache.set("k", "v".to_string())).unwrap();
        block_on(other.remove("k")).unwrap();

        assert!(block_on(cache.get("k")).unwrap().is_none());
    }
}
