//! Privacy facade bundling the anonymizer, detector, ledger and injector.

use std::sync::Arc;

use tessera_core::{DataRecord, PrivacyConfig, PrivacyError, SharedMetricsSink, TesseraResult};

use crate::anonymize::{AnonymizationRule, Anonymizer};
use crate::budget::PrivacyBudgetLedger;
use crate::noise::{NoiseConfig, NoiseInjector};
use crate::pii::{PiiDetector, PiiReport};

/// Explicitly constructed privacy services, shared by reference.
#[derive(Debug, Clone)]
pub struct PrivacyEngine {
    anonymizer: Anonymizer,
    detector: PiiDetector,
    ledger: Arc<PrivacyBudgetLedger>,
    injector: NoiseInjector,
}

impl PrivacyEngine {
    pub fn from_config(config: &PrivacyConfig, sink: SharedMetricsSink) -> TesseraResult<Self> {
        config.validate()?;
        let ledger =
            Arc::new(PrivacyBudgetLedger::from_config(config)?.with_metrics(Arc::clone(&sink)));
        Ok(Self {
            anonymizer: Anonymizer::from_config(config),
            detector: PiiDetector::new(),
            injector: NoiseInjector::new(Arc::clone(&ledger)).with_metrics(sink),
            ledger,
        })
    }

    pub fn with_detector(mut self, detector: PiiDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    pub fn detector(&self) -> &PiiDetector {
        &self.detector
    }

    pub fn ledger(&self) -> &Arc<PrivacyBudgetLedger> {
        &self.ledger
    }

    pub fn injector(&self) -> &NoiseInjector {
        &self.injector
    }

    pub fn apply(
        &self,
        record: &DataRecord,
        rules: &[AnonymizationRule],
    ) -> Result<DataRecord, PrivacyError> {
        self.anonymizer.apply(record, rules)
    }

    pub fn detect(&self, record: &DataRecord) -> PiiReport {
        self.detector.detect(record)
    }

    pub fn add_noise(&self, value: f64, config: &NoiseConfig) -> Result<f64, PrivacyError> {
        self.injector.add_noise(value, config)
    }

    /// Consumes `epsilon` from `purpose` when it returns `true`.
    pub fn check_budget(&self, purpose: &str, epsilon: f64) -> bool {
        self.ledger.check_budget(purpose, epsilon)
    }
}
