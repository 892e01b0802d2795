//! Metrics and event sink interface.
//!
//! The core never talks to a metrics backend directly. Components hold a
//! [`SharedMetricsSink`] and report through it; sinks are fire-and-forget and
//! cannot fail an operation because every method is infallible by signature.

use std::sync::Arc;

/// Metric names emitted by TESSERA components.
pub mod names {
    pub const CACHE_HITS: &str = "tessera_cache_hits_total";
    pub const CACHE_MISSES: &str = "tessera_cache_misses_total";
    pub const CACHE_SETS: &str = "tessera_cache_sets_total";
    pub const CACHE_LEVEL_FAILURES: &str = "tessera_cache_level_failures_total";
    pub const CACHE_PROMOTIONS: &str = "tessera_cache_promotions_total";
    pub const CACHE_INVALIDATED_KEYS: &str = "tessera_cache_invalidated_keys_total";
    pub const CACHE_LOOKUP_SECONDS: &str = "tessera_cache_lookup_seconds";
    pub const CACHE_LEVEL_SIZE: &str = "tessera_cache_level_size";

    pub const PRIVACY_BUDGET_CONSUMED: &str = "tessera_privacy_budget_consumed";
    pub const PRIVACY_BUDGET_REJECTIONS: &str = "tessera_privacy_budget_rejections_total";
    pub const PRIVACY_NOISE_APPLIED: &str = "tessera_privacy_noise_applied_total";

    pub const PIPELINE_FLOWS: &str = "tessera_pipeline_flows_total";
    pub const PIPELINE_STAGE_FAILURES: &str = "tessera_pipeline_stage_failures_total";
    pub const PIPELINE_FLOW_SECONDS: &str = "tessera_pipeline_flow_seconds";

    pub const BATCH_ITEMS: &str = "tessera_batch_items_total";
    pub const BATCH_FLUSHES: &str = "tessera_batch_flushes_total";
}

/// Label pairs attached to a metric sample.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for events, counters, histograms and gauges.
///
/// Implementations must return quickly and must not panic.
pub trait MetricsSink: Send + Sync {
    /// Emit a named event with a structured payload. The pipeline executor
    /// mirrors every pipeline event here.
    fn emit(&self, _event: &str, _payload: &serde_json::Value) {}

    /// Increment a counter by `value`.
    fn increment_counter(&self, _name: &str, _value: u64, _labels: Labels<'_>) {}

    /// Record one histogram observation.
    fn record_histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}

    /// Set a gauge to `value`.
    fn set_gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

/// Shared handle to a metrics sink.
pub type SharedMetricsSink = Arc<dyn MetricsSink>;

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

/// Convenience constructor for a shared no-op sink.
pub fn noop_sink() -> SharedMetricsSink {
    Arc::new(NoopMetricsSink)
}
