//! Remote (L2) and durable (L3) cache levels over a [`KeyValueBackend`].
//!
//! The backend holds the bytes. A local [`ShardedIndex`] holds per-key
//! metadata (expiry, size, tags, insertion stamp) so capacity, eviction and
//! `delete_by_tag` work against backends that only offer a plain key-value
//! contract. No lock is held across a backend await: the index is consulted
//! before or after each call, never during it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::CacheLevelConfig;
use tokio::time::Instant;

use super::shard::{Lookup, ShardedIndex, DEFAULT_SHARDS};
use super::traits::{BackendError, CacheLevelStore, CachedValue, KeyValueBackend, LevelStats};

/// Cache level whose storage is an external key-value backend.
///
/// Backend errors are returned unchanged.
pub struct BackendLevel<B: KeyValueBackend + ?Sized> {
    config: CacheLevelConfig,
    backend: Arc<B>,
    index: ShardedIndex<()>,
    stats: LevelStats,
}

impl<B: KeyValueBackend + ?Sized> BackendLevel<B> {
    pub fn new(config: CacheLevelConfig, backend: Arc<B>) -> Self {
        Self {
            config,
            backend,
            index: ShardedIndex::new(DEFAULT_SHARDS),
            stats: LevelStats::default(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    async fn evict(&self) -> Result<usize, BackendError> {
        let batch = (self.config.capacity / 10).max(1);
        let mut evicted = 0;
        for (key, seq) in self.index.oldest(batch) {
            if self.index.remove_if_seq(&key, seq) {
                self.backend.delete(&key).await?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.stats.record_evictions(evicted as u64);
            tracing::debug!(level = %self.config.name, evicted, "Evicted oldest entries");
        }
        Ok(evicted)
    }
}

#[async_trait]
impl<B: KeyValueBackend + ?Sized + 'static> CacheLevelStore for BackendLevel<B> {
    fn config(&self) -> &CacheLevelConfig {
        &self.config
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>, BackendError> {
        let Some(value) = self.backend.get(key).await? else {
            // Backend expired or lost it; drop stale metadata.
            self.index.remove(key);
            return Ok(None);
        };

        let now = Instant::now();
        let (remaining_ttl, tags) = match self.index.lookup(key, now) {
            Lookup::Hit(slot) => (Some(slot.remaining(now)), slot.tags.into_iter().collect()),
            Lookup::Expired | Lookup::Absent => (self.backend.ttl(key).await?, Vec::new()),
        };

        Ok(Some(CachedValue {
            value,
            remaining_ttl,
            tags,
        }))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), BackendError> {
        if !self.index.contains(key) && self.index.len() >= self.config.capacity {
            self.evict().await?;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.backend.set(key, &value, ttl).await?;

        let size = key.len() + value.len();
        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        self.index.insert(key, (), Instant::now() + ttl, size, tags);
        self.stats.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let deleted = self.backend.delete(key).await?;
        let removed = self.index.remove(key).is_some() || deleted;
        if removed {
            self.stats.record_deletes(1);
        }
        Ok(removed)
    }

    /// A key leaves the local index only once the backend delete succeeded;
    /// the first backend error is returned after every key was attempted.
    async fn delete_by_tag(&self, tag: &str) -> Result<usize, BackendError> {
        let mut removed = 0;
        let mut first_error = None;
        for key in self.index.keys_for_tag(tag) {
            match self.backend.delete(&key).await {
                Ok(deleted) => {
                    if self.index.remove(&key).is_some() || deleted {
                        removed += 1;
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.stats.record_deletes(removed as u64);
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.backend.ping().await
    }

    fn purge_expired(&self) -> usize {
        // The backend expires values itself; only local metadata is dropped.
        self.index.purge_expired(Instant::now()).len()
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
    use crate::cache::InMemoryKeyValueBackend;

    type Level = BackendLevel<InMemoryKeyValueBackend>;

    fn level(capacity: usize) -> (Level, Arc<InMemoryKeyValueBackend>) {
        let backend = Arc::new(InMemoryKeyValueBackend::new());
        let config = CacheLevelConfig::remote("remote", 2, capacity, Duration::from_secs(60));
        (BackendLevel::new(config, backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_round_trip_through_backend() {
        let (l2, backend) = level(10);
        l2.set("k", b"v".to_vec(), None, &["t".to_string()]).await.unwrap();
        assert!(backend.exists("k").await.unwrap());

        let hit = l2.get("k").await.unwrap().unwrap();
        assert_eq!(hit.value, b"v");
        assert_eq!(hit.tags, vec!["t".to_string()]);
        assert!(hit.remaining_ttl.is_some());
    }

    #[tokio::test]
    async fn test_value_written_out_of_band_uses_backend_ttl() {
        let (l2, backend) = level(10);
        backend.set("k", b"v", Duration::from_secs(5)).await.unwrap();
        let hit = l2.get("k").await.unwrap().unwrap();
        assert!(hit.remaining_ttl.unwrap() <= Duration::from_secs(5));
        assert!(hit.tags.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_deletes_from_backend() {
        let (l2, backend) = level(10);
        for i in 0..10 {
            l2.set(&format!("k{}", i), b"v".to_vec(), None, &[]).await.unwrap();
        }
        l2.set("k10", b"v".to_vec(), None, &[]).await.unwrap();
        assert_eq!(l2.len(), 10);
        assert!(!backend.exists("k0").await.unwrap());
        assert!(backend.exists("k10").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_by_tag_reaches_backend() {
        let (l2, backend) = level(10);
        let tag = vec!["cohort-A".to_string()];
        l2.set("a", b"1".to_vec(), None, &tag).await.unwrap();
        l2.set("b", b"2".to_vec(), None, &tag).await.unwrap();
        l2.set("c", b"3".to_vec(), None, &[]).await.unwrap();

        assert_eq!(l2.delete_by_tag("cohort-A").await.unwrap(), 2);
        assert!(!backend.exists("a").await.unwrap());
        assert!(backend.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_error_propagates_unchanged() {
        let backend = Arc::new(InMemoryKeyValueBackend::new().with_max_value_bytes(1));
        let config = CacheLevelConfig::durable("durable", 3, 10, Duration::from_secs(60));
        let l3 = BackendLevel::new(config, backend);
        let err = l3.set("k", b"too big".to_vec(), None, &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert_eq!(l3.len(), 0);
    }
}
