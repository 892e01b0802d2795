//! Application root
//!
//! [`TesseraRuntime`] constructs every service from one [`RuntimeConfig`]
//! and owns them for the life of the process: the cache coordinator, the
//! privacy engine, the pipeline executor and its queue, the optional cache
//! warmer, and the expired-entry sweep task. Nothing is global; callers hold
//! the runtime (or the `Arc`s it hands out) and pass references down.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tessera_core::{
    DataRecord, FlowContext, HealthCheck, HealthStatus, PipelineError, SharedMetricsSink,
    TesseraResult,
};
use tessera_pipeline::{FlowDefinition, PipelineExecutor, PipelineQueue, ProcessResult};
use tessera_privacy::PrivacyEngine;
use tessera_storage::{
    CacheCoordinator, CacheWarmer, InMemoryKeyValueBackend, KeyValueBackend, WarmSource,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::jobs::{cache_sweep_task, CacheSweepConfig, CacheSweepMetrics, CacheSweepSnapshot};

/// Remaining epsilon at or below this counts as exhausted.
const EXHAUSTED_EPSILON: f64 = 1e-9;

/// External stores plugged into the cache.
pub struct RuntimeBackends {
    pub remote: Arc<dyn KeyValueBackend>,
    pub durable: Arc<dyn KeyValueBackend>,
    /// Loader for warm-on-miss reads and the warming queue.
    pub warm_source: Option<Arc<dyn WarmSource>>,
}

impl RuntimeBackends {
    /// Process-local stand-ins for the remote and durable stores.
    pub fn in_memory() -> Self {
        Self {
            remote: Arc::new(InMemoryKeyValueBackend::new()),
            durable: Arc::new(InMemoryKeyValueBackend::new()),
            warm_source: None,
        }
    }

    pub fn with_warm_source(mut self, source: Arc<dyn WarmSource>) -> Self {
        self.warm_source = Some(source);
        self
    }
}

/// Health of every component the runtime owns.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeHealth {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

/// Owns the constructed services and the background tasks.
pub struct TesseraRuntime {
    config: RuntimeConfig,
    cache: Arc<CacheCoordinator>,
    privacy: PrivacyEngine,
    executor: Arc<PipelineExecutor>,
    pipeline_queue: PipelineQueue,
    warmer: Option<CacheWarmer>,
    sweep_metrics: Arc<CacheSweepMetrics>,
    shutdown_tx: watch::Sender<bool>,
    sweep: Mutex<Option<JoinHandle<Arc<CacheSweepMetrics>>>>,
}

impl TesseraRuntime {
    /// Validate `config`, build every service and spawn the background
    /// tasks. Must be called inside a tokio runtime.
    pub fn start(
        config: RuntimeConfig,
        backends: RuntimeBackends,
        sink: SharedMetricsSink,
    ) -> TesseraResult<Self> {
        config.validate()?;

        let mut coordinator =
            CacheCoordinator::from_config(&config.cache, backends.remote, backends.durable)?
                .with_metrics(Arc::clone(&sink));
        if let Some(source) = &backends.warm_source {
            coordinator = coordinator.with_loader(Arc::clone(source));
        }
        let cache = Arc::new(coordinator);

        let privacy = PrivacyEngine::from_config(&config.privacy, Arc::clone(&sink))?;
        let executor = Arc::new(PipelineExecutor::new().with_metrics(Arc::clone(&sink)));
        let pipeline_queue = PipelineQueue::start(
            Arc::clone(&executor),
            config.pipeline_queue.clone(),
            Arc::clone(&sink),
        );
        let warmer = backends.warm_source.map(|source| {
            CacheWarmer::start(
                Arc::clone(&cache),
                source,
                config.warming_queue.clone(),
                Arc::clone(&sink),
            )
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep_metrics = Arc::new(CacheSweepMetrics::new());
        let sweep = tokio::spawn(cache_sweep_task(
            Arc::clone(&cache),
            CacheSweepConfig::with_interval(config.cache.sweep_interval),
            Arc::clone(&sweep_metrics),
            shutdown_rx,
        ));

        tracing::info!(
            levels = cache.levels().len(),
            promotion = config.cache.promotion_enabled,
            purposes = config.privacy.budgets.len(),
            warming = warmer.is_some(),
            "TESSERA runtime started"
        );

        Ok(Self {
            config,
            cache,
            privacy,
            executor,
            pipeline_queue,
            warmer,
            sweep_metrics,
            shutdown_tx,
            sweep: Mutex::new(Some(sweep)),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn privacy(&self) -> &PrivacyEngine {
        &self.privacy
    }

    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.executor
    }

    /// `None` unless a warm source was supplied at startup.
    pub fn warmer(&self) -> Option<&CacheWarmer> {
        self.warmer.as_ref()
    }

    pub fn sweep_metrics(&self) -> CacheSweepSnapshot {
        self.sweep_metrics.snapshot()
    }

    pub fn register_flow(&self, definition: FlowDefinition) -> Result<(), PipelineError> {
        self.executor.register_flow(definition)
    }

    /// Run a flow inline on the caller's task.
    pub async fn process(
        &self,
        flow_id: &str,
        record: DataRecord,
        context: &FlowContext,
    ) -> TesseraResult<ProcessResult> {
        self.executor.process(flow_id, record, context).await
    }

    /// Run a flow through the bounded pipeline queue.
    pub async fn submit(
        &self,
        flow_id: impl Into<String>,
        record: DataRecord,
        context: FlowContext,
    ) -> TesseraResult<ProcessResult> {
        self.pipeline_queue.submit(flow_id, record, context).await
    }

    /// Cache level probes plus a budget check per purpose. An exhausted
    /// purpose degrades the privacy component.
    pub async fn health(&self) -> RuntimeHealth {
        let mut checks = self.cache.health().await.levels;
        checks.push(self.privacy_health());

        let queue = self.pipeline_queue.metrics();
        checks.push(
            HealthCheck::healthy("pipeline-queue")
                .with_metadata("submitted", json!(queue.submitted))
                .with_metadata("processed", json!(queue.processed)),
        );

        RuntimeHealth {
            status: HealthCheck::overall(&checks),
            checks,
        }
    }

    fn privacy_health(&self) -> HealthCheck {
        let budgets = match self.privacy.ledger().snapshot() {
            Ok(budgets) => budgets,
            Err(e) => return HealthCheck::unhealthy("privacy", e.to_string()),
        };

        let exhausted: Vec<&str> = budgets
            .iter()
            .filter(|budget| budget.remaining() <= EXHAUSTED_EPSILON)
            .map(|budget| budget.purpose.as_str())
            .collect();
        let remaining: serde_json::Map<String, serde_json::Value> = budgets
            .iter()
            .map(|budget| (budget.purpose.clone(), json!(budget.remaining())))
            .collect();

        let check = if exhausted.is_empty() {
            HealthCheck::healthy("privacy")
        } else {
            let message = format!("budget exhausted for {}", exhausted.join(", "));
            HealthCheck::degraded("privacy", message)
        };
        check.with_metadata("remaining_epsilon", serde_json::Value::Object(remaining))
    }

    /// Stop the sweep, then drain both queues. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.sweep.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Cache sweep task terminated abnormally");
            }
        }

        self.pipeline_queue.shutdown().await;
        if let Some(warmer) = &self.warmer {
            warmer.shutdown().await;
        }

        let sweep = self.sweep_metrics.snapshot();
        let queue = self.pipeline_queue.metrics();
        tracing::info!(
            sweeps = sweep.sweeps,
            entries_purged = sweep.entries_purged,
            flows_processed = queue.processed,
            "TESSERA runtime stopped"
        );
    }
}

impl Drop for TesseraRuntime {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessera_core::{noop_sink, BatchConfig, TesseraError};
    use tessera_storage::{GetOptions, SetOptions};

    fn fast_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.pipeline_queue = BatchConfig::default()
            .with_batch_size(2)
            .with_flush_interval(Duration::from_millis(10));
        config
    }

    fn start(config: RuntimeConfig) -> TesseraRuntime {
        TesseraRuntime::start(config, RuntimeBackends::in_memory(), noop_sink()).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_start() {
        let mut config = fast_config();
        config.privacy.pseudonym_secret.clear();
        let err = TesseraRuntime::start(config, RuntimeBackends::in_memory(), noop_sink())
            .err()
            .unwrap();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[tokio::test]
    async fn test_runtime_wires_cache_and_privacy() {
        let runtime = start(fast_config());

        let outcome = runtime
            .cache()
            .set("student:1", b"v".to_vec(), &SetOptions::default())
            .await;
        assert!(outcome.is_complete());
        assert_eq!(
            runtime.cache().get("student:1", &GetOptions::default()).await,
            Some(b"v".to_vec())
        );
        assert_eq!(runtime.privacy().ledger().remaining("analytics"), Some(5.0));
        assert!(runtime.warmer().is_none());

        let health = runtime.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.checks.iter().any(|c| c.component == "privacy"));

        runtime.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_budget_degrades_health() {
        let runtime = start(fast_config());
        assert!(runtime.privacy().check_budget("research", 1.0));

        let health = runtime.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        let privacy = health
            .checks
            .iter()
            .find(|c| c.component == "privacy")
            .unwrap();
        assert!(privacy.message.as_deref().unwrap().contains("research"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_queue_closed() {
        let runtime = start(fast_config());
        runtime.shutdown().await;

        let result = runtime
            .submit("anything", DataRecord::new(), FlowContext::new("analytics"))
            .await;
        assert!(matches!(
            result,
            Err(TesseraError::Pipeline(PipelineError::QueueClosed))
        ));
    }
}
