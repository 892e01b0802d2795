//! Configuration types
//!
//! Every block is plain data passed in at construction time. Durations are
//! (de)serialized as integer milliseconds so TOML files stay readable.

use crate::{ConfigError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Serde adapter for `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Physical kind of a cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelKind {
    /// In-process memory, synchronous access.
    Memory,
    /// Shared network key-value store.
    Remote,
    /// Durable storage.
    Durable,
}

/// Immutable configuration of one cache level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLevelConfig {
    pub name: String,
    /// 1 = fastest. Defines lookup and promotion order.
    pub ordinal: u8,
    pub kind: LevelKind,
    /// Maximum number of entries before eviction runs.
    pub capacity: usize,
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    pub enabled: bool,
    /// Upper bound for a single operation against this level.
    #[serde(with = "duration_ms")]
    pub op_timeout: Duration,
}

impl CacheLevelConfig {
    /// In-process level with the given capacity and TTL.
    pub fn memory(name: impl Into<String>, ordinal: u8, capacity: usize, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind: LevelKind::Memory,
            capacity,
            default_ttl: ttl,
            enabled: true,
            op_timeout: Duration::from_millis(50),
        }
    }

    /// Remote (shared) level with the given capacity and TTL.
    pub fn remote(name: impl Into<String>, ordinal: u8, capacity: usize, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind: LevelKind::Remote,
            capacity,
            default_ttl: ttl,
            enabled: true,
            op_timeout: Duration::from_millis(250),
        }
    }

    /// Durable level with the given capacity and TTL.
    pub fn durable(name: impl Into<String>, ordinal: u8, capacity: usize, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind: LevelKind::Durable,
            capacity,
            default_ttl: ttl,
            enabled: true,
            op_timeout: Duration::from_secs(1),
        }
    }

    /// Set the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Enable or disable the level.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let field = |name: &str| format!("cache.levels.{}.{}", self.name, name);
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache.levels.name".to_string(),
            });
        }
        if self.ordinal == 0 {
            return Err(ConfigError::invalid(field("ordinal"), self.ordinal, "ordinal starts at 1"));
        }
        if self.capacity == 0 {
            return Err(ConfigError::invalid(
                field("capacity"),
                self.capacity,
                "capacity must be greater than 0",
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigError::invalid(
                field("default_ttl"),
                format!("{:?}", self.default_ttl),
                "default_ttl must be positive",
            ));
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::invalid(
                field("op_timeout"),
                format!("{:?}", self.op_timeout),
                "op_timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Tiered cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub levels: Vec<CacheLevelConfig>,
    /// Copy lower-level hits into faster levels on read.
    pub promotion_enabled: bool,
    /// How often the background sweep purges expired in-process entries.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                CacheLevelConfig::memory("memory", 1, 1_000, Duration::from_secs(300)),
                CacheLevelConfig::remote("remote", 2, 10_000, Duration::from_secs(3600)),
                CacheLevelConfig::durable("durable", 3, 100_000, Duration::from_secs(86_400)),
            ],
            promotion_enabled: true,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Look up a level by name.
    pub fn level(&self, name: &str) -> Option<&CacheLevelConfig> {
        self.levels.iter().find(|l| l.name == name)
    }

    /// Levels sorted by ascending ordinal.
    pub fn ordered_levels(&self) -> Vec<CacheLevelConfig> {
        let mut levels = self.levels.clone();
        levels.sort_by_key(|l| l.ordinal);
        levels
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - at least one level
    /// - level names and ordinals are unique
    /// - capacities, TTLs and timeouts are positive
    /// - sweep_interval is positive
    pub fn validate(&self) -> TesseraResult<()> {
        if self.levels.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache.levels".to_string(),
            }
            .into());
        }

        let mut names = HashSet::new();
        let mut ordinals = HashSet::new();
        for level in &self.levels {
            level.validate()?;
            if !names.insert(level.name.as_str()) {
                return Err(
                    ConfigError::invalid("cache.levels.name", &level.name, "duplicate level name")
                        .into(),
                );
            }
            if !ordinals.insert(level.ordinal) {
                return Err(
                    ConfigError::invalid("cache.levels.ordinal", level.ordinal, "duplicate ordinal")
                        .into(),
                );
            }
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "cache.sweep_interval",
                format!("{:?}", self.sweep_interval),
                "sweep_interval must be positive",
            )
            .into());
        }

        Ok(())
    }
}

// ============================================================================
// PRIVACY
// ============================================================================

/// Privacy configuration: per-purpose epsilon limits and transform secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Purpose → epsilon limit. A budget is created for each at startup.
    pub budgets: BTreeMap<String, f64>,
    /// Replacement text for `redact`.
    pub redaction_placeholder: String,
    /// Process-wide key for `pseudonymize`.
    pub pseudonym_secret: String,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            budgets: BTreeMap::from([
                ("analytics".to_string(), 5.0),
                ("research".to_string(), 1.0),
            ]),
            redaction_placeholder: "[REDACTED]".to_string(),
            pseudonym_secret: "tessera-development-secret".to_string(),
        }
    }
}

impl PrivacyConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> TesseraResult<()> {
        for (purpose, limit) in &self.budgets {
            if purpose.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "privacy.budgets.<purpose>".to_string(),
                }
                .into());
            }
            if !limit.is_finite() || *limit <= 0.0 {
                return Err(ConfigError::invalid(
                    format!("privacy.budgets.{}", purpose),
                    limit,
                    "epsilon limit must be finite and greater than 0",
                )
                .into());
            }
        }
        if self.pseudonym_secret.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "privacy.pseudonym_secret".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// BATCHING
// ============================================================================

/// Configuration for a bounded batch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush as soon as this many items are pending.
    pub max_batch_size: usize,
    /// Flush pending items at least this often.
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Number of batch members processed concurrently.
    pub max_concurrency: usize,
    /// Bound of the submission channel.
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            flush_interval: Duration::from_millis(100),
            max_concurrency: 5,
            queue_capacity: 1_000,
        }
    }
}

impl BatchConfig {
    /// Set the batch size threshold.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the worker fan-out.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    /// Validate the configuration. `scope` prefixes field names in errors.
    pub fn validate(&self, scope: &str) -> TesseraResult<()> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid(
                format!("{}.max_batch_size", scope),
                self.max_batch_size,
                "max_batch_size must be greater than 0",
            )
            .into());
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid(
                format!("{}.flush_interval", scope),
                format!("{:?}", self.flush_interval),
                "flush_interval must be positive",
            )
            .into());
        }
        if !(1..=64).contains(&self.max_concurrency) {
            return Err(ConfigError::invalid(
                format!("{}.max_concurrency", scope),
                self.max_concurrency,
                "max_concurrency must be between 1 and 64",
            )
            .into());
        }
        if self.queue_capacity < self.max_batch_size {
            return Err(ConfigError::invalid(
                format!("{}.queue_capacity", scope),
                self.queue_capacity,
                "queue_capacity must be at least max_batch_size",
            )
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
