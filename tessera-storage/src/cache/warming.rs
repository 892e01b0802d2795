//! Cache warming queue.
//!
//! Keys are submitted to a [`BatchQueue`]; its worker loads each one from a
//! [`WarmSource`] and writes it through the coordinator. Every submission
//! resolves to its own [`WarmOutcome`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::{
    BatchConfig, BatchError, BatchHandler, BatchMetricsSnapshot, BatchQueue, SharedMetricsSink,
};

use super::coordinator::{CacheCoordinator, SetOptions};
use super::traits::BackendError;

/// Source of truth consulted when a key must be (re)loaded into the cache.
#[async_trait]
pub trait WarmSource: Send + Sync {
    /// Load the value for `key`. `None` if the source has nothing for it.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;
}

/// One key to warm.
#[derive(Debug, Clone, Default)]
pub struct WarmRequest {
    pub key: String,
    pub tags: Vec<String>,
    pub ttl: Option<Duration>,
    pub levels: Option<Vec<String>>,
}

impl WarmRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of warming one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmOutcome {
    /// Loaded and written to the listed levels.
    Warmed { levels: Vec<String> },
    /// The source had no value.
    NotFound,
    /// The source failed.
    Failed { reason: String },
}

struct WarmHandler {
    coordinator: Arc<CacheCoordinator>,
    source: Arc<dyn WarmSource>,
}

#[async_trait]
impl BatchHandler for WarmHandler {
    type Item = WarmRequest;
    type Output = WarmOutcome;

    async fn handle(&self, request: WarmRequest) -> WarmOutcome {
        let value = match self.source.load(&request.key).await {
            Ok(Some(value)) => value,
            Ok(None) => return WarmOutcome::NotFound,
            Err(e) => {
                tracing::warn!(key = %request.key, error = %e, "Cache warm load failed");
                return WarmOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let options = SetOptions {
            ttl: request.ttl,
            tags: request.tags,
            levels: request.levels,
        };
        let outcome = self.coordinator.set(&request.key, value, &options).await;
        WarmOutcome::Warmed {
            levels: outcome.written,
        }
    }
}

/// Background cache warmer.
pub struct CacheWarmer {
    queue: BatchQueue<WarmHandler>,
}

impl CacheWarmer {
    /// Start the warming worker. Must be called inside a tokio runtime.
    pub fn start(
        coordinator: Arc<CacheCoordinator>,
        source: Arc<dyn WarmSource>,
        config: BatchConfig,
        sink: SharedMetricsSink,
    ) -> Self {
        let handler = Arc::new(WarmHandler {
            coordinator,
            source,
        });
        Self {
            queue: BatchQueue::start("cache-warming", handler, config, sink),
        }
    }

    pub async fn warm(&self, key: impl Into<String>) -> Result<WarmOutcome, BatchError> {
        self.queue.submit(WarmRequest::new(key)).await
    }

    pub async fn warm_request(&self, request: WarmRequest) -> Result<WarmOutcome, BatchError> {
        self.queue.submit(request).await
    }

    /// Submit many keys at once; results come back in input order.
    pub async fn warm_many<I, S>(&self, keys: I) -> Vec<Result<WarmOutcome, BatchError>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let submissions = keys.into_iter().map(|key| self.warm(key));
        futures_util::future::join_all(submissions).await
    }

    pub fn metrics(&self) -> BatchMetricsSnapshot {
        self.queue.metrics()
    }

    /// Drain pending keys and stop the worker.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{GetOptions, InMemoryKeyValueBackend};
    use std::collections::HashMap;
    use tessera_core::{noop_sink, CacheConfig};

    struct MapSource(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl WarmSource for MapSource {
        async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            if key.starts_with("broken") {
                return Err(BackendError::Io("disk gone".to_string()));
            }
            Ok(self.0.get(key).cloned())
        }
    }

    fn coordinator() -> Arc<CacheCoordinator> {
        Arc::new(
            CacheCoordinator::from_config(
                &CacheConfig::default(),
                Arc::new(InMemoryKeyValueBackend::new()),
                Arc::new(InMemoryKeyValueBackend::new()),
            )
            .unwrap(),
        )
    }

    fn source() -> Arc<dyn WarmSource> {
        let mut data = HashMap::new();
        data.insert("student:1".to_string(), b"ada".to_vec());
        data.insert("student:2".to_string(), b"grace".to_vec());
        Arc::new(MapSource(data))
    }

    #[tokio::test]
    async fn test_warm_many_resolves_each_key() {
        let cache = coordinator();
        let warmer = CacheWarmer::start(
            Arc::clone(&cache),
            source(),
            BatchConfig::default().with_batch_size(2),
            noop_sink(),
        );

        let results = warmer
            .warm_many(["student:1", "missing", "broken:3", "student:2"])
            .await;

        assert!(matches!(results[0], Ok(WarmOutcome::Warmed { .. })));
        assert_eq!(results[1], Ok(WarmOutcome::NotFound));
        assert!(matches!(results[2], Ok(WarmOutcome::Failed { .. })));
        assert!(matches!(results[3], Ok(WarmOutcome::Warmed { .. })));

        assert_eq!(
            cache.get("student:2", &GetOptions::default()).await,
            Some(b"grace".to_vec())
        );
        warmer.shutdown().await;
        assert_eq!(warmer.metrics().processed, 4);
    }

    #[tokio::test]
    async fn test_warm_request_carries_tags() {
        let cache = coordinator();
        let warmer =
            CacheWarmer::start(Arc::clone(&cache), source(), BatchConfig::default(), noop_sink());
        warmer
            .warm_request(WarmRequest::new("student:1").tag("cohort-A"))
            .await
            .unwrap();
        assert_eq!(cache.keys_for_tag("cohort-A"), vec!["student:1".to_string()]);
        warmer.shutdown().await;
    }
}
