//! Runtime configuration
//!
//! A [`RuntimeConfig`] is read from a TOML file (every block optional, each
//! falling back to its defaults) and then patched by `TESSERA_*` environment
//! variables. Durations are integer milliseconds in both places.
//!
//! ```toml
//! [privacy]
//! redaction_placeholder = "[REDACTED]"
//! pseudonym_secret = "change-me"
//!
//! [privacy.budgets]
//! analytics = 5.0
//! research = 1.0
//!
//! [pipeline_queue]
//! max_batch_size = 10
//! flush_interval = 100
//! max_concurrency = 5
//! queue_capacity = 1000
//!
//! [logging]
//! format = "json"
//! filter = "tessera=debug"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{BatchConfig, CacheConfig, ConfigError, PrivacyConfig, TesseraResult};

// ============================================================================
// LOGGING
// ============================================================================

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable multi-line output for local development.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(ConfigError::invalid(
                "logging.format",
                other,
                "expected \"json\" or \"pretty\"",
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives. `TESSERA_LOG` and `RUST_LOG` take precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Everything the runtime needs at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub pipeline_queue: BatchConfig,
    #[serde(default)]
    pub warming_queue: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing blocks take their defaults.
    pub fn from_toml_str(source: &str) -> TesseraResult<Self> {
        toml::from_str(source).map_err(|e| {
            ConfigError::Parse {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> TesseraResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&source)
    }

    /// Load from `path` when given, otherwise start from defaults; then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> TesseraResult<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TESSERA_*` overrides from the process environment.
    ///
    /// # Environment Variables
    /// - `TESSERA_CACHE_PROMOTION`: enable read-through promotion (`true`/`false`)
    /// - `TESSERA_CACHE_SWEEP_INTERVAL_MS`: expired-entry sweep interval
    /// - `TESSERA_PSEUDONYM_SECRET`: key for pseudonymization
    /// - `TESSERA_REDACTION_PLACEHOLDER`: replacement text for redaction
    /// - `TESSERA_PIPELINE_BATCH_SIZE`, `TESSERA_PIPELINE_CONCURRENCY`,
    ///   `TESSERA_PIPELINE_FLUSH_INTERVAL_MS`: pipeline queue tuning
    /// - `TESSERA_WARMING_BATCH_SIZE`, `TESSERA_WARMING_CONCURRENCY`,
    ///   `TESSERA_WARMING_FLUSH_INTERVAL_MS`: warming queue tuning
    /// - `TESSERA_LOG_FORMAT`: `json` or `pretty`
    /// - `TESSERA_LOG`: filter directives
    pub fn apply_env(self) -> TesseraResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. A present but malformed
    /// value is an error rather than silently ignored.
    pub fn apply_overrides<F>(mut self, lookup: F) -> TesseraResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "TESSERA_CACHE_PROMOTION")? {
            self.cache.promotion_enabled = enabled;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TESSERA_CACHE_SWEEP_INTERVAL_MS")? {
            self.cache.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(secret) = lookup("TESSERA_PSEUDONYM_SECRET") {
            self.privacy.pseudonym_secret = secret;
        }
        if let Some(placeholder) = lookup("TESSERA_REDACTION_PLACEHOLDER") {
            self.privacy.redaction_placeholder = placeholder;
        }

        apply_batch_overrides(&mut self.pipeline_queue, &lookup, "TESSERA_PIPELINE")?;
        apply_batch_overrides(&mut self.warming_queue, &lookup, "TESSERA_WARMING")?;

        if let Some(format) = parse_var::<LogFormat, _>(&lookup, "TESSERA_LOG_FORMAT")? {
            self.logging.format = format;
        }
        if let Some(filter) = lookup("TESSERA_LOG") {
            self.logging.filter = Some(filter);
        }
        Ok(self)
    }

    /// Validate every block.
    pub fn validate(&self) -> TesseraResult<()> {
        self.cache.validate()?;
        self.privacy.validate()?;
        self.pipeline_queue.validate("pipeline_queue")?;
        self.warming_queue.validate("warming_queue")?;
        Ok(())
    }

    /// Short flush intervals and small batches for local runs.
    pub fn development() -> Self {
        let queue = BatchConfig::default()
            .with_batch_size(4)
            .with_flush_interval(Duration::from_millis(20))
            .with_concurrency(2);
        Self {
            cache: CacheConfig {
                sweep_interval: Duration::from_secs(5),
                ..CacheConfig::default()
            },
            pipeline_queue: queue.clone(),
            warming_queue: queue,
            logging: LoggingConfig {
                format: LogFormat::Pretty,
                filter: Some("tessera=debug".to_string()),
            },
            ..Self::default()
        }
    }
}

fn apply_batch_overrides<F>(config: &mut BatchConfig, lookup: &F, prefix: &str) -> TesseraResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(size) = parse_var::<usize, _>(lookup, &format!("{}_BATCH_SIZE", prefix))? {
        config.max_batch_size = size;
    }
    if let Some(concurrency) = parse_var::<usize, _>(lookup, &format!("{}_CONCURRENCY", prefix))? {
        config.max_concurrency = concurrency;
    }
    if let Some(ms) = parse_var::<u64, _>(lookup, &format!("{}_FLUSH_INTERVAL_MS", prefix))? {
        config.flush_interval = Duration::from_millis(ms);
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> TesseraResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, &raw, e.to_string()).into()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
