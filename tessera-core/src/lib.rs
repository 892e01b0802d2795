//! TESSERA Core - Shared Types
//!
//! Error taxonomy, configuration, records and the seams every other crate
//! plugs into (metrics sink, batch queue). No cache or privacy logic lives
//! here.

pub mod batch;
pub mod config;
pub mod error;
pub mod health;
pub mod record;
pub mod telemetry;

pub use batch::{BatchError, BatchHandler, BatchMetrics, BatchMetricsSnapshot, BatchQueue};
pub use config::{BatchConfig, CacheConfig, CacheLevelConfig, LevelKind, PrivacyConfig};
pub use error::{
    CacheError, ConfigError, PipelineError, PrivacyError, TesseraError, TesseraResult,
};
pub use health::{HealthCheck, HealthStatus};
pub use record::{DataRecord, FlowContext};
pub use telemetry::{noop_sink, Labels, MetricsSink, NoopMetricsSink, SharedMetricsSink};

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Cache keys are plain strings, e.g. `student:42`.
pub type CacheKey = String;

/// Cache tags are plain strings, e.g. `cohort-A`.
pub type Tag = String;
