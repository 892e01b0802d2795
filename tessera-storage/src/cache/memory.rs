//! In-process cache level (L1).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::CacheLevelConfig;
use tokio::time::Instant;

use super::shard::{Lookup, ShardedIndex, DEFAULT_SHARDS};
use super::traits::{BackendError, CacheLevelStore, CachedValue, LevelStats};

/// Sharded in-process level.
///
/// Operations never suspend; the async signatures only satisfy
/// [`CacheLevelStore`]. Expired entries are purged lazily on access and by
/// [`CacheLevelStore::purge_expired`].
pub struct MemoryLevel {
    config: CacheLevelConfig,
    index: ShardedIndex<Vec<u8>>,
    stats: LevelStats,
}

impl MemoryLevel {
    pub fn new(config: CacheLevelConfig) -> Self {
        Self::with_shards(config, DEFAULT_SHARDS)
    }

    pub fn with_shards(config: CacheLevelConfig, shards: usize) -> Self {
        Self {
            config,
            index: ShardedIndex::new(shards),
            stats: LevelStats::default(),
        }
    }

    /// Approximate bytes held (keys plus values).
    pub fn size_bytes(&self) -> usize {
        self.index.bytes()
    }

    /// Drop the oldest ~10% of entries (at least one) by insertion order.
    fn evict(&self) -> usize {
        let batch = (self.config.capacity / 10).max(1);
        let mut evicted = 0;
        for (key, seq) in self.index.oldest(batch) {
            if self.index.remove_if_seq(&key, seq) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.stats.record_evictions(evicted as u64);
            tracing::debug!(level = %self.config.name, evicted, "Evicted oldest entries");
        }
        evicted
    }
}

#[async_trait]
impl CacheLevelStore for MemoryLevel {
    fn config(&self) -> &CacheLevelConfig {
        &self.config
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>, BackendError> {
        let now = Instant::now();
        match self.index.lookup(key, now) {
            Lookup::Hit(slot) => Ok(Some(CachedValue {
                remaining_ttl: Some(slot.remaining(now)),
                tags: slot.tags.into_iter().collect(),
                value: slot.value,
            })),
            Lookup::Expired => {
                tracing::trace!(level = %self.config.name, key, "Purged expired entry on read");
                Ok(None)
            }
            Lookup::Absent => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), BackendError> {
        if !self.index.contains(key) && self.index.len() >= self.config.capacity {
            self.evict();
        }
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let size = key.len() + value.len();
        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        self.index.insert(key, value, Instant::now() + ttl, size, tags);
        // Concurrent sets of new keys can all pass the check above.
        while self.index.len() > self.config.capacity {
            self.evict();
        }
        self.stats.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let removed = self.index.remove(key).is_some();
        if removed {
            self.stats.record_deletes(1);
        }
        Ok(removed)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<usize, BackendError> {
        let removed = self.index.remove_tag(tag).len();
        self.stats.record_deletes(removed as u64);
        Ok(removed)
    }

    fn purge_expired(&self) -> usize {
        let removed = self.index.purge_expired(Instant::now()).len();
        if removed > 0 {
            self.stats.record_evictions(removed as u64);
        }
        removed
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn stats(&self) -> &LevelStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(capacity: usize) -> MemoryLevel {
        MemoryLevel::new(CacheLevelConfig::memory(
            "memory",
            1,
            capacity,
            Duration::from_secs(60),
        ))
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let l1 = level(10);
        l1.set("k", b"v".to_vec(), None, &[]).await.unwrap();
        let hit = l1.get("k").await.unwrap().unwrap();
        assert_eq!(hit.value, b"v");
        assert!(hit.remaining_ttl.unwrap() <= Duration::from_secs(60));

        assert!(l1.delete("k").await.unwrap());
        assert!(!l1.delete("k").await.unwrap());
        assert!(l1.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_boundary() {
        let l1 = level(10);
        l1.set("k", b"v".to_vec(), Some(Duration::from_millis(100)), &[])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(l1.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(l1.get("k").await.unwrap().is_none());
        assert_eq!(l1.len(), 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_tenth() {
        let l1 = level(20);
        for i in 0..20 {
            l1.set(&format!("k{}", i), vec![0u8; 4], None, &[]).await.unwrap();
        }
        assert_eq!(l1.len(), 20);

        l1.set("new", vec![1u8], None, &[]).await.unwrap();
        assert_eq!(l1.len(), 19);
        assert!(l1.get("k0").await.unwrap().is_none());
        assert!(l1.get("k1").await.unwrap().is_none());
        assert!(l1.get("k2").await.unwrap().is_some());
        assert!(l1.get("new").await.unwrap().is_some());

        let snapshot = l1.stats().snapshot(l1.config(), l1.len());
        assert_eq!(snapshot.evictions, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sets_stay_within_capacity() {
        let l1 = std::sync::Arc::new(level(10));
        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let l1 = std::sync::Arc::clone(&l1);
                tokio::spawn(async move {
                    for i in 0..50 {
                        l1.set(&format!("w{}-k{}", writer, i), b"v".to_vec(), None, &[])
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        assert!(l1.len() <= 10, "level grew to {}", l1.len());
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let l1 = level(2);
        l1.set("a", b"1".to_vec(), None, &[]).await.unwrap();
        l1.set("b", b"2".to_vec(), None, &[]).await.unwrap();
        l1.set("a", b"3".to_vec(), None, &[]).await.unwrap();
        assert_eq!(l1.len(), 2);
        assert_eq!(l1.get("a").await.unwrap().unwrap().value, b"3");
    }

    #[tokio::test]
    async fn test_delete_by_tag_and_size_accounting() {
        let l1 = level(10);
        l1.set("a", vec![0u8; 10], None, &tags(&["cohort-A"])).await.unwrap();
        l1.set("b", vec![0u8; 10], None, &tags(&["cohort-A", "x"])).await.unwrap();
        l1.set("c", vec![0u8; 10], None, &tags(&["x"])).await.unwrap();
        assert_eq!(l1.size_bytes(), 33);

        assert_eq!(l1.delete_by_tag("cohort-A").await.unwrap(), 2);
        assert_eq!(l1.len(), 1);
        assert_eq!(l1.size_bytes(), 11);
        assert_eq!(l1.delete_by_tag("cohort-A").await.unwrap(), 0);
        assert_eq!(l1.get("c").await.unwrap().unwrap().tags, vec!["x".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let l1 = level(10);
        l1.set("short", b"v".to_vec(), Some(Duration::from_millis(10)), &[])
            .await
            .unwrap();
        l1.set("long", b"v".to_vec(), None, &[]).await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(l1.purge_expired(), 1);
        assert_eq!(l1.len(), 1);
    }
}
