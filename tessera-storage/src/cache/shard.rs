//! Sharded entry storage with a per-shard tag index.
//!
//! Keys hash to one of N shards, each behind its own `RwLock`. A shard holds
//! both the entries and the tag → keys index for those entries, so every
//! insert/remove updates storage, size accounting and tag index inside one
//! critical section. Tag removal walks the shards one at a time; it is atomic
//! per key, not across keys.
//!
//! Eviction is approximate LRU by insertion order: each write stamps the
//! entry with a monotonically increasing sequence number and eviction drops
//! the entries with the smallest stamps. Reads do not refresh the stamp.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;

/// Default shard count; a power of two comfortably above typical core counts.
pub(crate) const DEFAULT_SHARDS: usize = 16;

/// One stored entry.
#[derive(Debug, Clone)]
pub(crate) struct Slot<V> {
    pub value: V,
    pub expires_at: Instant,
    pub size: usize,
    pub tags: BTreeSet<String>,
    pub seq: u64,
}

impl<V> Slot<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Outcome of a lookup.
#[derive(Debug)]
pub(crate) enum Lookup<V> {
    Hit(Slot<V>),
    Expired,
    Absent,
}

struct Shard<V> {
    entries: HashMap<String, Slot<V>>,
    tags: HashMap<String, HashSet<String>>,
    bytes: usize,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tags: HashMap::new(),
            bytes: 0,
        }
    }
}

impl<V> Shard<V> {
    fn unindex(&mut self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn take(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.unindex(key, &slot.tags);
        self.bytes = self.bytes.saturating_sub(slot.size);
        Some(slot)
    }
}

/// Sharded, tag-indexed map of cache entries.
pub(crate) struct ShardedIndex<V> {
    shards: Box<[RwLock<Shard<V>>]>,
    len: AtomicUsize,
    bytes: AtomicUsize,
    seq: AtomicU64,
}

impl<V: Clone> ShardedIndex<V> {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(Shard::default())).collect(),
            len: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    // A poisoned shard still holds structurally valid maps; keep serving it.
    fn read(&self, idx: usize) -> RwLockReadGuard<'_, Shard<V>> {
        self.shards[idx].read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, idx: usize) -> RwLockWriteGuard<'_, Shard<V>> {
        self.shards[idx].write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(self.shard_index(key)).entries.contains_key(key)
    }

    /// Look up a key, purging it if expired.
    pub fn lookup(&self, key: &str, now: Instant) -> Lookup<V> {
        let idx = self.shard_index(key);
        {
            let shard = self.read(idx);
            match shard.entries.get(key) {
                None => return Lookup::Absent,
                Some(slot) if !slot.is_expired(now) => return Lookup::Hit(slot.clone()),
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, a writer may have refreshed it.
        let mut shard = self.write(idx);
        match shard.entries.get(key) {
            Some(slot) if slot.is_expired(now) => {
                if let Some(slot) = shard.take(key) {
                    self.account_removed(&slot);
                }
                Lookup::Expired
            }
            Some(slot) => Lookup::Hit(slot.clone()),
            None => Lookup::Absent,
        }
    }

    /// Insert or overwrite. Returns true if the key was new.
    pub fn insert(
        &self,
        key: &str,
        value: V,
        expires_at: Instant,
        size: usize,
        tags: BTreeSet<String>,
    ) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let idx = self.shard_index(key);
        let mut shard = self.write(idx);

        let previous = shard.take(key);
        for tag in &tags {
            shard
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        shard.bytes += size;
        shard.entries.insert(
            key.to_string(),
            Slot {
                value,
                expires_at,
                size,
                tags,
                seq,
            },
        );

        match previous {
            Some(old) => {
                self.bytes.fetch_sub(old.size.min(self.bytes()), Ordering::Relaxed);
                self.bytes.fetch_add(size, Ordering::Relaxed);
                false
            }
            None => {
                self.len.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(size, Ordering::Relaxed);
                true
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<Slot<V>> {
        let idx = self.shard_index(key);
        let slot = self.write(idx).take(key)?;
        self.account_removed(&slot);
        Some(slot)
    }

    /// Remove `key` only if it still carries insertion stamp `seq`.
    pub fn remove_if_seq(&self, key: &str, seq: u64) -> bool {
        let idx = self.shard_index(key);
        let mut shard = self.write(idx);
        if shard.entries.get(key).map(|s| s.seq) != Some(seq) {
            return false;
        }
        if let Some(slot) = shard.take(key) {
            drop(shard);
            self.account_removed(&slot);
            return true;
        }
        false
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let mut keys = Vec::new();
        for idx in 0..self.shards.len() {
            if let Some(set) = self.read(idx).tags.get(tag) {
                keys.extend(set.iter().cloned());
            }
        }
        keys
    }

    /// Remove every entry carrying `tag`, one shard at a time.
    pub fn remove_tag(&self, tag: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for idx in 0..self.shards.len() {
            let mut shard = self.write(idx);
            let Some(keys) = shard.tags.get(tag).cloned() else {
                continue;
            };
            for key in keys {
                if let Some(slot) = shard.take(&key) {
                    self.account_removed(&slot);
                    removed.push(key);
                }
            }
        }
        removed
    }

    /// The `count` entries with the oldest insertion stamps, as `(key, seq)`.
    pub fn oldest(&self, count: usize) -> Vec<(String, u64)> {
        if count == 0 {
            return Vec::new();
        }
        let mut stamps: Vec<(u64, String)> = Vec::with_capacity(self.len());
        for idx in 0..self.shards.len() {
            let shard = self.read(idx);
            stamps.extend(shard.entries.iter().map(|(k, s)| (s.seq, k.clone())));
        }
        if stamps.len() > count {
            stamps.select_nth_unstable_by_key(count - 1, |(seq, _)| *seq);
            stamps.truncate(count);
        }
        stamps.sort_unstable_by_key(|(seq, _)| *seq);
        stamps.into_iter().map(|(seq, key)| (key, seq)).collect()
    }

    /// Remove all expired entries. Returns the removed keys.
    pub fn purge_expired(&self, now: Instant) -> Vec<String> {
        let mut removed = Vec::new();
        for idx in 0..self.shards.len() {
            let expired: Vec<String> = {
                let shard = self.read(idx);
                shard
                    .entries
                    .iter()
                    .filter(|(_, slot)| slot.is_expired(now))
                    .map(|(key, _)| key.clone())
                    .collect()
            };
            if expired.is_empty() {
                continue;
            }
            let mut shard = self.write(idx);
            for key in expired {
                let still_expired = shard.entries.get(&key).is_some_and(|s| s.is_expired(now));
                if still_expired {
                    if let Some(slot) = shard.take(&key) {
                        self.account_removed(&slot);
                        removed.push(key);
                    }
                }
            }
        }
        removed
    }

    fn account_removed(&self, slot: &Slot<V>) {
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(slot.size.min(self.bytes()), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn later(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_insert_lookup_remove() {
        let index: ShardedIndex<u32> = ShardedIndex::new(4);
        assert!(index.insert("a", 1, later(1_000), 10, tags(&["t"])));
        assert!(!index.insert("a", 2, later(1_000), 12, tags(&["t"])));
        assert_eq!(index.len(), 1);
        assert_eq!(index.bytes(), 12);

        match index.lookup("a", Instant::now()) {
            Lookup::Hit(slot) => assert_eq!(slot.value, 2),
            other => panic!("expected hit, got {:?}", other),
        }

        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        assert_eq!(index.len(), 0);
        assert_eq!(index.bytes(), 0);
        assert!(index.keys_for_tag("t").is_empty());
    }

    #[test]
    fn test_overwrite_replaces_tags() {
        let index: ShardedIndex<()> = ShardedIndex::new(2);
        index.insert("k", (), later(1_000), 1, tags(&["old"]));
        index.insert("k", (), later(1_000), 1, tags(&["new"]));
        assert!(index.keys_for_tag("old").is_empty());
        assert_eq!(index.keys_for_tag("new"), vec!["k".to_string()]);
    }

    #[test]
    fn test_expired_lookup_purges() {
        let index: ShardedIndex<()> = ShardedIndex::new(2);
        let now = Instant::now();
        index.insert("k", (), now, 1, tags(&["t"]));
        assert!(matches!(index.lookup("k", now), Lookup::Expired));
        assert_eq!(index.len(), 0);
        assert!(index.keys_for_tag("t").is_empty());
        assert!(matches!(index.lookup("k", now), Lookup::Absent));
    }

    #[test]
    fn test_remove_tag_across_shards() {
        let index: ShardedIndex<()> = ShardedIndex::new(8);
        for i in 0..50 {
            let t = if i % 2 == 0 { tags(&["even"]) } else { tags(&["odd"]) };
            index.insert(&format!("k{}", i), (), later(1_000), 1, t);
        }
        let mut removed = index.remove_tag("even");
        removed.sort();
        assert_eq!(removed.len(), 25);
        assert_eq!(index.len(), 25);
        assert!(index.keys_for_tag("even").is_empty());
        assert_eq!(index.keys_for_tag("odd").len(), 25);
    }

    #[test]
    fn test_oldest_by_insertion_order() {
        let index: ShardedIndex<()> = ShardedIndex::new(4);
        for i in 0..10 {
            index.insert(&format!("k{}", i), (), later(1_000), 1, BTreeSet::new());
        }
        let oldest: Vec<String> = index.oldest(3).into_iter().map(|(k, _)| k).collect();
        assert_eq!(oldest, vec!["k0", "k1", "k2"]);
    }

    #[test]
    fn test_remove_if_seq_skips_rewritten_key() {
        let index: ShardedIndex<()> = ShardedIndex::new(4);
        index.insert("k", (), later(1_000), 1, BTreeSet::new());
        let (_, seq) = index.oldest(1).remove(0);
        index.insert("k", (), later(1_000), 1, BTreeSet::new());
        assert!(!index.remove_if_seq("k", seq));
        assert!(index.contains("k"));
    }

    #[test]
    fn test_purge_expired() {
        let index: ShardedIndex<()> = ShardedIndex::new(4);
        let now = Instant::now();
        index.insert("dead", (), now, 1, tags(&["t"]));
        index.insert("alive", (), later(10_000), 1, tags(&["t"]));
        let removed = index.purge_expired(now);
        assert_eq!(removed, vec!["dead".to_string()]);
        assert_eq!(index.keys_for_tag("t"), vec!["alive".to_string()]);
    }
}
