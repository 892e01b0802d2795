//! TESSERA Service
//!
//! Application root: loads [`RuntimeConfig`] from TOML and `TESSERA_*`
//! variables, installs tracing, and owns the constructed cache, privacy and
//! pipeline services in a [`TesseraRuntime`] together with their background
//! jobs.

pub mod config;
pub mod jobs;
pub mod runtime;
pub mod telemetry;

pub use config::{LogFormat, LoggingConfig, RuntimeConfig};
pub use jobs::{cache_sweep_task, CacheSweepConfig, CacheSweepMetrics, CacheSweepSnapshot};
pub use runtime::{RuntimeBackends, RuntimeHealth, TesseraRuntime};
pub use telemetry::{filter_directives, init_tracing, TracingMetricsSink, DEFAULT_LOG_FILTER};
