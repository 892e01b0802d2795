//! Cross-level cache coordination.
//!
//! [`CacheCoordinator`] owns the ordered set of levels and implements
//! read-through promotion, all-settled fan-out writes and tag invalidation on
//! top of them.
//!
//! # Failure model
//!
//! Every level call carries the level's `op_timeout`. A backend error or a
//! timeout is logged, counted against the level and treated as a miss (reads)
//! or a failed write for that level only. Callers never see transport errors.
//!
//! # Consistency
//!
//! Within one `get`, levels are checked in ascending ordinal order. Across
//! concurrent calls on the same key there is no global order: levels are
//! eventually consistent, not linearizable. `invalidate_by_tags` is atomic per
//! key but not across keys, so a concurrent reader can see a stale hit for a
//! key that has not been reached yet. A key some level failed to delete stays
//! in the tag index until an invalidation reaches every level.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_core::telemetry::names;
use tessera_core::{
    noop_sink, CacheConfig, CacheError, HealthCheck, HealthStatus, LevelKind, SharedMetricsSink,
    TesseraResult,
};
use tokio::time::timeout;

use super::backend_level::BackendLevel;
use super::memory::MemoryLevel;
use super::traits::{CacheLevelStore, CachedValue, KeyValueBackend, LevelStatsSnapshot};
use super::warming::WarmSource;

/// Options for [`CacheCoordinator::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Level names to skip for this lookup (neither read nor promoted into).
    pub skip_levels: Vec<String>,
    /// Tags to attach when a miss is warmed from the loader.
    pub tags: Vec<String>,
    /// On a full miss, load through the configured [`WarmSource`] and store.
    pub warm_on_miss: bool,
}

impl GetOptions {
    pub fn skip(mut self, level: impl Into<String>) -> Self {
        self.skip_levels.push(level.into());
        self
    }

    pub fn warm_on_miss(mut self, tags: Vec<String>) -> Self {
        self.warm_on_miss = true;
        self.tags = tags;
        self
    }
}

/// Options for [`CacheCoordinator::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Time-to-live; each level's `default_ttl` when absent.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Target level names; all enabled levels when absent.
    pub levels: Option<Vec<String>>,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.levels = Some(levels.into_iter().map(Into::into).collect());
        self
    }
}

/// Per-level result of a fan-out write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOutcome {
    pub written: Vec<String>,
    pub failed: Vec<String>,
}

impl SetOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregated health of all levels.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub levels: Vec<HealthCheck>,
}

/// Coordinates reads, writes and invalidation across ordered cache levels.
pub struct CacheCoordinator {
    levels: Vec<Arc<dyn CacheLevelStore>>,
    tag_keys: DashMap<String, HashSet<String>>,
    key_tags: DashMap<String, HashSet<String>>,
    promotion_enabled: bool,
    sink: SharedMetricsSink,
    loader: Option<Arc<dyn WarmSource>>,
}

impl CacheCoordinator {
    /// Build a coordinator over `levels`; they are ordered by ordinal here.
    pub fn new(mut levels: Vec<Arc<dyn CacheLevelStore>>) -> Self {
        levels.sort_by_key(|level| level.config().ordinal);
        Self {
            levels,
            tag_keys: DashMap::new(),
            key_tags: DashMap::new(),
            promotion_enabled: true,
            sink: noop_sink(),
            loader: None,
        }
    }

    /// Build the configured levels. Memory levels are in-process; remote and
    /// durable levels are backed by the given key-value stores.
    pub fn from_config(
        config: &CacheConfig,
        remote: Arc<dyn KeyValueBackend>,
        durable: Arc<dyn KeyValueBackend>,
    ) -> TesseraResult<Self> {
        config.validate()?;
        let levels = config
            .ordered_levels()
            .into_iter()
            .map(|level| -> Arc<dyn CacheLevelStore> {
                match level.kind {
                    LevelKind::Memory => Arc::new(MemoryLevel::new(level)),
                    LevelKind::Remote => Arc::new(BackendLevel::new(level, Arc::clone(&remote))),
                    LevelKind::Durable => Arc::new(BackendLevel::new(level, Arc::clone(&durable))),
                }
            })
            .collect();
        Ok(Self::new(levels).with_promotion(config.promotion_enabled))
    }

    pub fn with_promotion(mut self, enabled: bool) -> Self {
        self.promotion_enabled = enabled;
        self
    }

    pub fn with_metrics(mut self, sink: SharedMetricsSink) -> Self {
        self.sink = sink;
        self
    }

    /// Loader consulted by `get` when `warm_on_miss` is set.
    pub fn with_loader(mut self, loader: Arc<dyn WarmSource>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn levels(&self) -> &[Arc<dyn CacheLevelStore>] {
        &self.levels
    }

    pub fn level(&self, name: &str) -> Option<&Arc<dyn CacheLevelStore>> {
        self.levels.iter().find(|level| level.name() == name)
    }

    /// Look a key up level by level, promoting a hit into the faster levels
    /// that were checked before it. `None` is a miss, never an error.
    pub async fn get(&self, key: &str, options: &GetOptions) -> Option<Vec<u8>> {
        let started = Instant::now();
        let mut missed: Vec<&Arc<dyn CacheLevelStore>> = Vec::new();

        for level in self.levels.iter().filter(|l| self.readable(l, &options.skip_levels)) {
            match self.read_level(level.as_ref(), key).await {
                Some(hit) => {
                    level.stats().record_hit();
                    self.count(names::CACHE_HITS, level.name());
                    if self.promotion_enabled && !missed.is_empty() {
                        self.promote(key, &hit, &missed).await;
                    }
                    self.observe_lookup(started, "hit");
                    return Some(hit.value);
                }
                None => {
                    level.stats().record_miss();
                    self.count(names::CACHE_MISSES, level.name());
                    missed.push(level);
                }
            }
        }

        self.observe_lookup(started, "miss");
        if options.warm_on_miss {
            return self.load_through(key, &options.tags).await;
        }
        None
    }

    /// Write to every target level independently. A failing level does not
    /// stop the others; the outcome lists which levels took the write.
    pub async fn set(&self, key: &str, value: Vec<u8>, options: &SetOptions) -> SetOutcome {
        let targets = self.write_targets(options.levels.as_deref());
        if !options.tags.is_empty() {
            self.index_tags(key, &options.tags);
        }

        let writes = targets.iter().map(|level| {
            let value = value.clone();
            async move {
                let result = self
                    .write_level(level.as_ref(), key, value, options.ttl, &options.tags)
                    .await;
                (level.name().to_string(), result)
            }
        });

        let mut outcome = SetOutcome::default();
        for (name, result) in join_all(writes).await {
            match result {
                Ok(()) => {
                    self.count(names::CACHE_SETS, &name);
                    outcome.written.push(name);
                }
                Err(_) => outcome.failed.push(name),
            }
        }
        outcome
    }

    /// Remove a key from every enabled level and from the tag index. If any
    /// level fails the delete, the key stays indexed under its tags so a
    /// later invalidation retries it.
    pub async fn delete(&self, key: &str) {
        if self.delete_everywhere(key).await.is_empty() {
            self.unindex_key(key);
        }
    }

    /// Remove every key ever stored under any of `tags` from all levels.
    /// Returns the number of distinct indexed keys invalidated. Keys that a
    /// level failed to delete stay indexed and are not counted.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let keys: BTreeSet<String> = tags
            .iter()
            .filter_map(|tag| self.tag_keys.get(tag).map(|keys| keys.clone()))
            .flatten()
            .collect();

        let mut cleared = BTreeSet::new();
        for key in &keys {
            let failed = self.delete_everywhere(key).await;
            if failed.is_empty() {
                cleared.insert(key.clone());
            } else {
                tracing::warn!(
                    key = %key,
                    levels = ?failed,
                    "Key kept indexed after failed invalidation"
                );
            }
        }

        // Levels may know tagged keys the coordinator never indexed (promoted
        // copies written by another process, for instance).
        let mut residual = 0;
        for level in self.levels.iter().filter(|l| l.config().enabled) {
            for tag in tags {
                let sweep = level.delete_by_tag(tag);
                let error = match timeout(level.config().op_timeout, sweep).await {
                    Ok(Ok(removed)) => {
                        residual += removed;
                        continue;
                    }
                    Ok(Err(e)) => e.into_cache_error(level.name()),
                    Err(_) => self.timeout_error(level.as_ref()),
                };
                self.record_failure(level.as_ref(), "delete_by_tag", error);
            }
        }

        for key in &cleared {
            self.unindex_key(key);
        }

        self.sink
            .increment_counter(names::CACHE_INVALIDATED_KEYS, cleared.len() as u64, &[]);
        tracing::debug!(
            tags = ?tags,
            keys = cleared.len(),
            retained = keys.len() - cleared.len(),
            residual,
            "Invalidated cache tags"
        );
        cleared.len()
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tag_keys
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Per-level counters and current size.
    pub fn stats(&self) -> Vec<LevelStatsSnapshot> {
        self.levels
            .iter()
            .map(|level| {
                let size = level.len();
                self.sink.set_gauge(
                    names::CACHE_LEVEL_SIZE,
                    size as f64,
                    &[("level", level.name())],
                );
                level.stats().snapshot(level.config(), size)
            })
            .collect()
    }

    /// Probe every level. A level that answers but has recorded failures is
    /// degraded; one that does not answer is unhealthy.
    pub async fn health(&self) -> CacheHealth {
        let probes = self.levels.iter().map(|level| async move {
            let name = level.name().to_string();
            if !level.config().enabled {
                return HealthCheck::unknown(name, "level disabled");
            }
            let started = Instant::now();
            let probe = timeout(level.config().op_timeout, level.ping()).await;
            let elapsed = started.elapsed().as_millis() as u64;
            let failures = level.stats().failures();
            let check = match probe {
                Ok(Ok(())) if failures == 0 => HealthCheck::healthy(name),
                Ok(Ok(())) => {
                    HealthCheck::degraded(name, format!("{} failed operations observed", failures))
                }
                Ok(Err(e)) => HealthCheck::unhealthy(name, e.to_string()),
                Err(_) => HealthCheck::unhealthy(name, "ping timed out"),
            };
            check
                .with_response_time(elapsed)
                .with_metadata("entries", serde_json::json!(level.len()))
        });
        let levels = join_all(probes).await;
        CacheHealth {
            status: HealthCheck::overall(&levels),
            levels,
        }
    }

    /// Drop expired entries tracked by every level. Returns the total.
    pub fn purge_expired(&self) -> usize {
        self.levels.iter().map(|level| level.purge_expired()).sum()
    }

    /// Typed read; a stored value that does not deserialize is an error.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &GetOptions,
    ) -> Result<Option<T>, CacheError> {
        match self.get(key, options).await {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Serialization {
                    reason: format!("{}: {}", key, e),
                }),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &SetOptions,
    ) -> Result<SetOutcome, CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            reason: format!("{}: {}", key, e),
        })?;
        Ok(self.set(key, bytes, options).await)
    }

    fn readable(&self, level: &Arc<dyn CacheLevelStore>, skip: &[String]) -> bool {
        level.config().enabled && !skip.iter().any(|name| name == level.name())
    }

    fn write_targets(&self, names: Option<&[String]>) -> Vec<&Arc<dyn CacheLevelStore>> {
        self.levels
            .iter()
            .filter(|level| level.config().enabled)
            .filter(|level| names.map_or(true, |names| names.iter().any(|n| n == level.name())))
            .collect()
    }

    async fn read_level(&self, level: &dyn CacheLevelStore, key: &str) -> Option<CachedValue> {
        match timeout(level.config().op_timeout, level.get(key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                self.record_failure(level, "get", e.into_cache_error(level.name()));
                None
            }
            Err(_) => {
                self.record_failure(level, "get", self.timeout_error(level));
                None
            }
        }
    }

    async fn write_level(
        &self,
        level: &dyn CacheLevelStore,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), CacheError> {
        let write = level.set(key, value, ttl, tags);
        let error = match timeout(level.config().op_timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.into_cache_error(level.name()),
            Err(_) => self.timeout_error(level),
        };
        self.record_failure(level, "set", error.clone());
        Err(error)
    }

    async fn promote(&self, key: &str, hit: &CachedValue, targets: &[&Arc<dyn CacheLevelStore>]) {
        let mut tags: BTreeSet<String> = hit.tags.iter().cloned().collect();
        if let Some(indexed) = self.key_tags.get(key) {
            tags.extend(indexed.iter().cloned());
        }
        let tags: Vec<String> = tags.into_iter().collect();

        let writes = targets.iter().map(|level| {
            let ttl = match hit.remaining_ttl {
                Some(remaining) => remaining.min(level.config().default_ttl),
                None => level.config().default_ttl,
            };
            let value = hit.value.clone();
            let tags = &tags;
            async move {
                let promoted = self
                    .write_level(level.as_ref(), key, value, Some(ttl), tags)
                    .await
                    .is_ok();
                (level.name().to_string(), promoted)
            }
        });

        for (name, promoted) in join_all(writes).await {
            if promoted {
                self.count(names::CACHE_PROMOTIONS, &name);
            } else {
                tracing::warn!(
                    level = %name,
                    key,
                    "Promotion failed; returning value from lower level"
                );
            }
        }
    }

    async fn load_through(&self, key: &str, tags: &[String]) -> Option<Vec<u8>> {
        let loader = self.loader.as_ref()?;
        match loader.load(key).await {
            Ok(Some(value)) => {
                let options = SetOptions {
                    tags: tags.to_vec(),
                    ..SetOptions::default()
                };
                self.set(key, value.clone(), &options).await;
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Warm-on-miss load failed");
                None
            }
        }
    }

    /// Delete `key` from every enabled level. Returns the levels that failed.
    async fn delete_everywhere(&self, key: &str) -> Vec<String> {
        let deletes = self
            .levels
            .iter()
            .filter(|level| level.config().enabled)
            .map(|level| async move {
                let error = match timeout(level.config().op_timeout, level.delete(key)).await {
                    Ok(Ok(_)) => return None,
                    Ok(Err(e)) => e.into_cache_error(level.name()),
                    Err(_) => self.timeout_error(level.as_ref()),
                };
                self.record_failure(level.as_ref(), "delete", error);
                Some(level.name().to_string())
            });
        join_all(deletes).await.into_iter().flatten().collect()
    }

    fn index_tags(&self, key: &str, tags: &[String]) {
        for tag in tags {
            self.tag_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_tags
            .entry(key.to_string())
            .or_default()
            .extend(tags.iter().cloned());
    }

    fn unindex_key(&self, key: &str) {
        let Some((_, tags)) = self.key_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(mut keys) = self.tag_keys.get_mut(&tag) {
                keys.remove(key);
            }
            self.tag_keys.remove_if(&tag, |_, keys| keys.is_empty());
        }
    }

    fn timeout_error(&self, level: &dyn CacheLevelStore) -> CacheError {
        CacheError::Timeout {
            level: level.name().to_string(),
            after: level.config().op_timeout,
        }
    }

    fn record_failure(&self, level: &dyn CacheLevelStore, op: &'static str, error: CacheError) {
        level.stats().record_failure();
        self.sink.increment_counter(
            names::CACHE_LEVEL_FAILURES,
            1,
            &[("level", level.name()), ("op", op)],
        );
        tracing::warn!(level = %level.name(), op, error = %error, "Cache level operation failed");
    }

    fn count(&self, metric: &str, level: &str) {
        self.sink.increment_counter(metric, 1, &[("level", level)]);
    }

    fn observe_lookup(&self, started: Instant, result: &str) {
        self.sink.record_histogram(
            names::CACHE_LOOKUP_SECONDS,
            started.elapsed().as_secs_f64(),
            &[("result", result)],
        );
    }
}
