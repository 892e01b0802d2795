//! Tracing initialization and a tracing-backed metrics sink.

use tessera_core::{ConfigError, Labels, MetricsSink, TesseraResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Filter used when neither the environment nor the config names one.
pub const DEFAULT_LOG_FILTER: &str = "tessera=info";

/// Pick the filter directives: `TESSERA_LOG`, then `RUST_LOG`, then the
/// configured filter, then [`DEFAULT_LOG_FILTER`].
pub fn filter_directives<F>(config: &LoggingConfig, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("TESSERA_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .or_else(|| config.filter.clone())
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> TesseraResult<()> {
    let directives = filter_directives(config, |key| std::env::var(key).ok());
    let env_filter = EnvFilter::try_new(&directives)
        .map_err(|e| ConfigError::invalid("logging.filter", &directives, e.to_string()))?;

    let (json, pretty) = match config.format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().pretty())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|e| ConfigError::Parse {
            reason: format!("Failed to init subscriber: {}", e),
        })?;

    tracing::info!(
        format = ?config.format,
        filter = %directives,
        "Telemetry initialized"
    );

    Ok(())
}

/// Renders every sink call as a `debug` event on the `tessera::metrics`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit(&self, event: &str, payload: &serde_json::Value) {
        tracing::debug!(target: "tessera::metrics", event, payload = %payload, "event");
    }

    fn increment_counter(&self, name: &str, value: u64, labels: Labels<'_>) {
        tracing::debug!(
            target: "tessera::metrics",
            metric = name,
            value,
            labels = ?labels,
            "counter"
        );
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::debug!(
            target: "tessera::metrics",
            metric = name,
            value,
            labels = ?labels,
            "histogram"
        );
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::debug!(
            target: "tessera::metrics",
            metric = name,
            value,
            labels = ?labels,
            "gauge"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tessera_core::TesseraError;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_filter_precedence() {
        let config = LoggingConfig {
            filter: Some("tessera=warn".to_string()),
            ..Default::default()
        };

        assert_eq!(filter_directives(&LoggingConfig::default(), lookup(&[])), DEFAULT_LOG_FILTER);
        assert_eq!(filter_directives(&config, lookup(&[])), "tessera=warn");
        assert_eq!(
            filter_directives(&config, lookup(&[("RUST_LOG", "debug")])),
            "debug"
        );
        assert_eq!(
            filter_directives(
                &config,
                lookup(&[("RUST_LOG", "debug"), ("TESSERA_LOG", "tessera_cache=trace")])
            ),
            "tessera_cache=trace"
        );
        assert_eq!(
            filter_directives(&LoggingConfig::default(), lookup(&[("TESSERA_LOG", "  ")])),
            DEFAULT_LOG_FILTER
        );
    }

    #[test]
    fn test_second_init_is_config_error() {
        // Another test in this binary may have installed it already.
        let _ = init_tracing(&LoggingConfig::default());
        let err = init_tracing(&LoggingConfig::default()).unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[test]
    fn test_tracing_sink_is_infallible() {
        let sink = TracingMetricsSink;
        sink.emit("FlowCompleted", &serde_json::json!({"flow_id": "export"}));
        sink.increment_counter("tessera_cache_hits_total", 1, &[("level", "memory")]);
        sink.record_histogram("tessera_cache_lookup_seconds", 0.002, &[]);
        sink.set_gauge("tessera_cache_level_size", 3.0, &[("level", "memory")]);
    }
}
