//! Cache level and backend traits, plus per-level statistics.
//!
//! Two seams live here:
//!
//! - [`KeyValueBackend`]: the minimal `{get, set, delete, exists, ttl}`
//!   contract a remote or durable store must satisfy.
//! - [`CacheLevelStore`]: one physical cache level with capacity, TTL, tag
//!   index and eviction. Levels propagate backend errors unchanged; the
//!   coordinator decides what a failure means.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::{CacheError, CacheLevelConfig};
use thiserror::Error;

/// Error raised by a key-value backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend was reached but the operation failed.
    #[error("Backend I/O error: {0}")]
    Io(String),

    /// The backend refused the operation (e.g., value too large).
    #[error("Backend rejected operation: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Convert into a cache error attributed to `level`.
    pub fn into_cache_error(self, level: &str) -> CacheError {
        CacheError::LevelUnavailable {
            level: level.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Minimal key-value backend contract for remote and durable levels.
///
/// Implementations must be thread-safe. Values are opaque bytes.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Fetch a value. `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store a value with a time-to-live.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BackendError>;

    /// Remove a value. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Check for presence without transferring the value.
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Remaining time-to-live, `None` if absent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError>;

    /// Liveness probe. The default issues an `exists` on a sentinel key.
    async fn ping(&self) -> Result<(), BackendError> {
        self.exists("__tessera:ping").await.map(|_| ())
    }
}

/// A value read from a cache level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub value: Vec<u8>,
    /// Remaining lifetime at read time, when the level knows it.
    pub remaining_ttl: Option<Duration>,
    /// Tags the level has recorded for this key.
    pub tags: Vec<String>,
}

/// One physical cache level.
#[async_trait]
pub trait CacheLevelStore: Send + Sync {
    /// Static configuration of this level.
    fn config(&self) -> &CacheLevelConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Look up a key. Expired entries are purged and reported as absent.
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, BackendError>;

    /// Store a key. Runs eviction first when the level is at capacity.
    /// `ttl` defaults to the level's `default_ttl`.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), BackendError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Remove every key carrying `tag` at this level. Returns the count removed.
    async fn delete_by_tag(&self, tag: &str) -> Result<usize, BackendError>;

    /// Probe the level.
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Drop expired entries this level tracks locally. Returns the count.
    fn purge_expired(&self) -> usize;

    /// Number of entries currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters for this level.
    fn stats(&self) -> &LevelStats;
}

/// Atomic per-level counters.
#[derive(Debug, Default)]
pub struct LevelStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    failures: AtomicU64,
}

impl LevelStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Snapshot the counters together with the level's identity and size.
    pub fn snapshot(&self, config: &CacheLevelConfig, size: usize) -> LevelStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        LevelStatsSnapshot {
            level: config.name.clone(),
            ordinal: config.ordinal,
            enabled: config.enabled,
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            size: size as u64,
            hit_rate: hit_rate(hits, misses),
        }
    }
}

/// Statistics about one cache level.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LevelStatsSnapshot {
    pub level: String,
    pub ordinal: u8,
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    /// Backend errors and timeouts observed by the coordinator.
    pub failures: u64,
    /// Number of entries currently in the level.
    pub size: u64,
    /// Hit rate (0.0 to 1.0).
    pub hit_rate: f64,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_hit_rate() {
        let stats = LevelStats::default();
        for _ in 0..8 {
            stats.record_hit();
        }
        for _ in 0..2 {
            stats.record_miss();
        }
        let config = CacheLevelConfig::memory("memory", 1, 10, Duration::from_secs(1));
        let snapshot = stats.snapshot(&config, 4);
        assert!((snapshot.hit_rate - 0.8).abs() < 0.001);
        assert_eq!(snapshot.size, 4);
        assert_eq!(snapshot.level, "memory");

        let empty = LevelStats::default().snapshot(&config, 0);
        assert!((empty.hit_rate - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_backend_error_into_cache_error() {
        let err = BackendError::Unreachable("connection refused".to_string())
            .into_cache_error("remote");
        match err {
            CacheError::LevelUnavailable { level, reason } => {
                assert_eq!(level, "remote");
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
