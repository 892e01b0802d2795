//! TESSERA Test Utilities
//!
//! Centralized test infrastructure for the TESSERA workspace:
//! - Proptest generators for keys, tags, values and records
//! - Mock backends and a recording metrics sink
//! - Test fixtures for common scenarios
//! - Custom assertions for TESSERA-specific errors

pub use tessera_core::{
    BatchConfig, CacheConfig, CacheLevelConfig, DataRecord, FlowContext, Labels, MetricsSink,
    PipelineError, PrivacyConfig, PrivacyError, SharedMetricsSink, TesseraError, TesseraResult,
};
pub use tessera_pipeline::{FlowDefinition, PipelineExecutor, ProcessResult};
pub use tessera_privacy::{PrivacyBudgetLedger, PrivacyEngine};
pub use tessera_storage::{
    BackendError, CacheCoordinator, InMemoryKeyValueBackend, KeyValueBackend, WarmSource,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

// ============================================================================
// MOCK BACKENDS
// ============================================================================

/// Backend whose every operation fails as unreachable.
#[derive(Debug, Clone, Default)]
pub struct FailingBackend {
    calls: Arc<AtomicU64>,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations attempted against this backend.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Unreachable("connection refused".to_string()))
    }
}

#[async_trait]
impl KeyValueBackend for FailingBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), BackendError> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
        self.fail()
    }

    async fn exists(&self, _key: &str) -> Result<bool, BackendError> {
        self.fail()
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, BackendError> {
        self.fail()
    }
}

/// In-memory backend that sleeps before every operation.
#[derive(Debug, Default)]
pub struct SlowBackend {
    inner: InMemoryKeyValueBackend,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryKeyValueBackend::new(),
            delay,
        }
    }
}

#[async_trait]
impl KeyValueBackend for SlowBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.ttl(key).await
    }
}

/// In-memory backend that can be switched off and on.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: InMemoryKeyValueBackend,
    down: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            Err(BackendError::Unreachable("backend switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BackendError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        self.check()?;
        self.inner.ttl(key).await
    }
}

/// Warm source backed by a fixed map.
#[derive(Debug, Default)]
pub struct MapWarmSource {
    values: HashMap<String, Vec<u8>>,
    loads: AtomicU64,
}

impl MapWarmSource {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            values: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            loads: AtomicU64::new(0),
        }
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WarmSource for MapWarmSource {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.get(key).cloned())
    }
}

// ============================================================================
// RECORDING METRICS SINK
// ============================================================================

/// One captured sink call.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedMetric {
    Event { name: String, payload: serde_json::Value },
    Counter { name: String, value: u64, labels: Vec<(String, String)> },
    Histogram { name: String, value: f64, labels: Vec<(String, String)> },
    Gauge { name: String, value: f64, labels: Vec<(String, String)> },
}

/// Metrics sink that keeps every call for later inspection.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    records: Mutex<Vec<RecordedMetric>>,
}

fn owned_labels(labels: Labels<'_>) -> Vec<(String, String)> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl RecordingMetricsSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, record: RecordedMetric) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn records(&self) -> Vec<RecordedMetric> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sum of every increment of counter `name`.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.records()
            .iter()
            .filter_map(|r| match r {
                RecordedMetric::Counter { name: n, value, .. } if n == name => Some(*value),
                _ => None,
            })
            .sum()
    }

    /// Sum of increments of counter `name` carrying label `key=value`.
    pub fn counter_with_label(&self, name: &str, key: &str, value: &str) -> u64 {
        self.records()
            .iter()
            .filter_map(|r| match r {
                RecordedMetric::Counter {
                    name: n,
                    value: v,
                    labels,
                } if n == name && labels.iter().any(|(k, l)| k == key && l == value) => Some(*v),
                _ => None,
            })
            .sum()
    }

    /// Names of emitted events, in order.
    pub fn events(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| match r {
                RecordedMetric::Event { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn emit(&self, event: &str, payload: &serde_json::Value) {
        self.push(RecordedMetric::Event {
            name: event.to_string(),
            payload: payload.clone(),
        });
    }

    fn increment_counter(&self, name: &str, value: u64, labels: Labels<'_>) {
        self.push(RecordedMetric::Counter {
            name: name.to_string(),
            value,
            labels: owned_labels(labels),
        });
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.push(RecordedMetric::Histogram {
            name: name.to_string(),
            value,
            labels: owned_labels(labels),
        });
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.push(RecordedMetric::Gauge {
            name: name.to_string(),
            value,
            labels: owned_labels(labels),
        });
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for TESSERA inputs.

    use super::*;
    use proptest::prelude::*;

    /// Generate a namespaced cache key, e.g. `student:42`.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("student"), Just("course"), Just("cohort"), Just("grade")],
            0u32..10_000,
        )
            .prop_map(|(ns, id)| format!("{}:{}", ns, id))
    }

    /// Generate a cache tag.
    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z]{1,8}-[A-Z0-9]{1,3}"
    }

    /// Generate up to `max` distinct tags.
    pub fn arb_tags(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set(arb_tag(), 0..=max).prop_map(|set| set.into_iter().collect())
    }

    /// Generate an opaque cache value.
    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..256)
    }

    /// Generate a TTL between one second and one day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400).prop_map(Duration::from_secs)
    }

    /// Generate a positive, finite epsilon.
    pub fn arb_epsilon() -> impl Strategy<Value = f64> {
        (1u32..=2_000).prop_map(|milli| milli as f64 / 1_000.0)
    }

    /// Generate a plausible email address.
    pub fn arb_email() -> impl Strategy<Value = String> {
        ("[a-z]{1,10}", "[a-z]{2,10}", prop_oneof![Just("edu"), Just("org"), Just("com")])
            .prop_map(|(user, domain, tld)| format!("{}@{}.{}", user, domain, tld))
    }

    /// Generate a student record with an id, email, age and score.
    pub fn arb_student_record() -> impl Strategy<Value = DataRecord> {
        ("s-[0-9]{1,6}", arb_email(), 5i64..100, 0.0f64..100.0).prop_map(
            |(id, email, age, score)| {
                DataRecord::new()
                    .with("student_id", id)
                    .with("email", email)
                    .with("age", age)
                    .with("score", score)
            },
        )
    }

    /// Generate a processing purpose.
    pub fn arb_purpose() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("analytics".to_string()),
            Just("research".to_string()),
            "[a-z]{3,12}",
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configurations and components for common scenarios.

    use super::*;
    use tessera_pipeline::{
        AnonymizeStage, DetectPiiStage, FieldKind, PipelineStage, RecordSchema, ValidateStage,
    };
    use tessera_privacy::AnonymizationRule;

    /// Three levels with the given TTL on each.
    pub fn cache_config(ttl: Duration) -> CacheConfig {
        CacheConfig {
            levels: vec![
                CacheLevelConfig::memory("memory", 1, 1_000, ttl),
                CacheLevelConfig::remote("remote", 2, 10_000, ttl),
                CacheLevelConfig::durable("durable", 3, 100_000, ttl),
            ],
            ..CacheConfig::default()
        }
    }

    /// Coordinator over the default layout with in-memory backends.
    pub fn coordinator() -> CacheCoordinator {
        coordinator_with(
            &CacheConfig::default(),
            Arc::new(InMemoryKeyValueBackend::new()),
            Arc::new(InMemoryKeyValueBackend::new()),
        )
    }

    /// Coordinator over `config` with explicit remote and durable backends.
    pub fn coordinator_with(
        config: &CacheConfig,
        remote: Arc<dyn KeyValueBackend>,
        durable: Arc<dyn KeyValueBackend>,
    ) -> CacheCoordinator {
        CacheCoordinator::from_config(config, remote, durable)
            .expect("fixture cache config must be valid")
    }

    /// Small batches and a short flush interval.
    pub fn fast_batch_config() -> BatchConfig {
        BatchConfig::default()
            .with_batch_size(4)
            .with_flush_interval(Duration::from_millis(10))
    }

    pub fn privacy_config() -> PrivacyConfig {
        PrivacyConfig {
            pseudonym_secret: "test-secret".to_string(),
            ..PrivacyConfig::default()
        }
    }

    pub fn privacy_engine() -> PrivacyEngine {
        PrivacyEngine::from_config(&privacy_config(), tessera_core::noop_sink())
            .expect("fixture privacy config must be valid")
    }

    /// The record used by most pipeline scenarios.
    pub fn student_record() -> DataRecord {
        DataRecord::new()
            .with("student_id", "s-42")
            .with("email", "ada.lovelace@school.edu")
            .with("age", 17)
            .with("score", 91.5)
    }

    pub fn student_schema() -> RecordSchema {
        RecordSchema::new()
            .required("student_id", FieldKind::String)
            .optional("email", FieldKind::String)
            .optional("age", FieldKind::Integer)
            .optional("score", FieldKind::Number)
    }

    /// validate -> detect PII -> anonymize(email: hash).
    pub fn student_flow(id: &str, engine: &PrivacyEngine) -> FlowDefinition {
        FlowDefinition::new(id, student_schema())
            .describe("Student export with hashed email")
            .stage(PipelineStage::new("validate", 10, Arc::new(ValidateStage)))
            .stage(PipelineStage::new(
                "detect-pii",
                20,
                Arc::new(DetectPiiStage::new(engine.detector().clone())),
            ))
            .stage(PipelineStage::new(
                "anonymize",
                30,
                Arc::new(AnonymizeStage::new(
                    engine.anonymizer().clone(),
                    vec![AnonymizationRule::hash("email")],
                )),
            ))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for TESSERA-specific results.

    use super::*;

    /// Assert that a TesseraResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a TesseraResult is a BudgetExceeded privacy error for `purpose`.
    #[track_caller]
    pub fn assert_budget_exceeded<T: std::fmt::Debug>(result: &TesseraResult<T>, purpose: &str) {
        match result {
            Err(TesseraError::Privacy(PrivacyError::BudgetExceeded { purpose: p, .. })) => {
                assert_eq!(p, purpose, "Wrong purpose in BudgetExceeded error");
            }
            other => panic!("Expected BudgetExceeded for {}, got: {:?}", purpose, other),
        }
    }

    /// Assert that a TesseraResult is FlowNotFound.
    #[track_caller]
    pub fn assert_flow_not_found<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Pipeline(PipelineError::FlowNotFound { .. })) => {}
            other => panic!("Expected FlowNotFound, got: {:?}", other),
        }
    }

    /// Assert that a TesseraResult is FlowDisabled.
    #[track_caller]
    pub fn assert_flow_disabled<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Pipeline(PipelineError::FlowDisabled { .. })) => {}
            other => panic!("Expected FlowDisabled, got: {:?}", other),
        }
    }

    /// Assert that a TesseraResult is a required StageFailed for `stage`.
    #[track_caller]
    pub fn assert_stage_failed<T: std::fmt::Debug>(result: &TesseraResult<T>, stage: &str) {
        match result {
            Err(TesseraError::Pipeline(PipelineError::StageFailed {
                stage: s, required, ..
            })) => {
                assert_eq!(s, stage, "Wrong stage in StageFailed error");
                assert!(*required, "Expected a required stage failure");
            }
            other => panic!("Expected StageFailed for {}, got: {:?}", stage, other),
        }
    }

    /// Assert that a budget ledger never exceeded its limit.
    #[track_caller]
    pub fn assert_within_budget(ledger: &PrivacyBudgetLedger, purpose: &str) {
        let consumed = ledger.consumed(purpose).expect("purpose must be registered");
        let remaining = ledger.remaining(purpose).expect("purpose must be registered");
        assert!(
            remaining >= -1e-9,
            "Budget for {} overdrawn: consumed {}, remaining {}",
            purpose,
            consumed,
            remaining
        );
    }
}
