//! Built-in stages: validate, detect PII, authorize, anonymize, noisy
//! aggregate and compliance tagging.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tessera_privacy::{
    AnonymizationRule, Anonymizer, NoiseConfig, NoiseInjector, PiiDetector, PiiReport,
};

use crate::flow::{FlowState, StageContext, StageError, StageProcessor};

/// Compliance flag names.
pub mod flags {
    pub const PII_PRESENT: &str = "pii-present";
    pub const ANONYMIZED: &str = "anonymized";
    pub const CONSENT_VERIFIED: &str = "consent-verified";
    pub const NOISE_APPLIED: &str = "noise-applied";
    pub const PURPOSE_PREFIX: &str = "purpose:";
}

/// Checks the record against the flow schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateStage;

#[async_trait]
impl StageProcessor for ValidateStage {
    async fn process(
        &self,
        state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let violations = ctx.schema.violations(&state.record);
        if violations.is_empty() {
            Ok(state)
        } else {
            Err(StageError::rejected(format!(
                "record does not match schema: {}",
                violations.join("; ")
            )))
        }
    }
}

/// Records which fields hold personal data. Never fails.
#[derive(Debug, Clone, Default)]
pub struct DetectPiiStage {
    detector: PiiDetector,
}

impl DetectPiiStage {
    pub fn new(detector: PiiDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl StageProcessor for DetectPiiStage {
    async fn process(
        &self,
        mut state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let report = self.detector.detect(&state.record);
        if !report.is_empty() {
            tracing::debug!(
                flow = ctx.flow_id,
                fields = ?report.fields(),
                "PII detected"
            );
        }
        state.metadata.pii_detected = !report.is_empty();
        state.metadata.pii_fields = report.fields();
        state.metadata.pii_matches = report.matches;
        Ok(state)
    }
}

/// Requires consents and an allowed role on the invocation context.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeStage {
    required_consents: BTreeSet<String>,
    allowed_roles: BTreeSet<String>,
    purpose_consent: bool,
}

impl AuthorizeStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_consent(mut self, consent: impl Into<String>) -> Self {
        self.required_consents.insert(consent.into());
        self
    }

    /// Require a consent named after the invocation's purpose.
    pub fn require_purpose_consent(mut self) -> Self {
        self.purpose_consent = true;
        self
    }

    /// Any one allowed role suffices. No roles configured means any actor.
    pub fn allow_role(mut self, role: impl Into<String>) -> Self {
        self.allowed_roles.insert(role.into());
        self
    }
}

#[async_trait]
impl StageProcessor for AuthorizeStage {
    async fn process(
        &self,
        mut state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let invocation = ctx.invocation;
        let missing: Vec<&str> = self
            .required_consents
            .iter()
            .map(String::as_str)
            .chain(self.purpose_consent.then_some(invocation.purpose.as_str()))
            .filter(|consent| !invocation.has_consent(consent))
            .collect();
        if !missing.is_empty() {
            return Err(StageError::rejected(format!(
                "missing consent: {}",
                missing.join(", ")
            )));
        }

        if !self.allowed_roles.is_empty()
            && !self.allowed_roles.iter().any(|role| invocation.has_role(role))
        {
            return Err(StageError::rejected(format!(
                "actor {} holds none of the allowed roles",
                invocation.actor.as_deref().unwrap_or("<anonymous>")
            )));
        }

        state.metadata.consent_verified = true;
        Ok(state)
    }
}

/// Applies anonymization rules, plus default rules for detected PII fields
/// that no explicit rule covers when `auto_detected` is on.
#[derive(Debug, Clone)]
pub struct AnonymizeStage {
    anonymizer: Anonymizer,
    rules: Vec<AnonymizationRule>,
    auto_detected: bool,
}

impl AnonymizeStage {
    pub fn new(anonymizer: Anonymizer, rules: Vec<AnonymizationRule>) -> Self {
        Self {
            anonymizer,
            rules,
            auto_detected: false,
        }
    }

    pub fn with_detected_fields(mut self) -> Self {
        self.auto_detected = true;
        self
    }
}

#[async_trait]
impl StageProcessor for AnonymizeStage {
    async fn process(
        &self,
        mut state: FlowState,
        _ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let mut rules = self.rules.clone();
        if self.auto_detected {
            let covered: BTreeSet<String> = rules.iter().map(|r| r.field.clone()).collect();
            let report = PiiReport {
                matches: state.metadata.pii_matches.clone(),
            };
            rules.extend(
                report
                    .suggested_rules()
                    .into_iter()
                    .filter(|rule| !covered.contains(&rule.field)),
            );
        }

        let touched: Vec<String> = rules
            .iter()
            .filter(|rule| state.record.contains(&rule.field))
            .map(|rule| rule.field.clone())
            .collect();
        state.record = self.anonymizer.apply(&state.record, &rules)?;

        if !touched.is_empty() {
            state.metadata.anonymized = true;
            state.metadata.anonymized_fields.extend(touched);
        }
        Ok(state)
    }

    fn referenced_fields(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.field.clone()).collect()
    }
}

/// Replaces numeric fields with noised values, charging the invocation
/// purpose's budget. A rejected budget fails the stage; the raw values are
/// never passed on.
#[derive(Debug, Clone)]
pub struct NoisyAggregateStage {
    injector: NoiseInjector,
    fields: Vec<String>,
    config: NoiseConfig,
}

impl NoisyAggregateStage {
    pub fn new(injector: NoiseInjector, fields: Vec<String>, config: NoiseConfig) -> Self {
        Self {
            injector,
            fields,
            config,
        }
    }
}

#[async_trait]
impl StageProcessor for NoisyAggregateStage {
    async fn process(
        &self,
        mut state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let mut present = Vec::new();
        let mut values = Vec::new();
        for field in &self.fields {
            let Some(value) = state.record.get(field) else {
                continue;
            };
            let number = value
                .as_f64()
                .ok_or_else(|| StageError::rejected(format!("field {} is not numeric", field)))?;
            present.push(field.clone());
            values.push(number);
        }
        if values.is_empty() {
            return Ok(state);
        }

        let purpose = ctx.invocation.purpose.as_str();
        let noised = self.injector.release_many(purpose, &values, &self.config)?;
        for (field, value) in present.iter().zip(noised) {
            state.record.insert(field.clone(), value);
        }
        state.metadata.epsilon_consumed += self.config.epsilon * values.len() as f64;
        state.metadata.noised_fields.extend(present);
        Ok(state)
    }

    fn referenced_fields(&self) -> Vec<String> {
        self.fields.clone()
    }
}

/// Derives compliance flags from the metadata gathered so far.
#[derive(Debug, Clone, Default)]
pub struct ComplianceTagStage {
    regimes: Vec<String>,
}

impl ComplianceTagStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regulatory regime tag, e.g. `ferpa` or `gdpr`.
    pub fn regime(mut self, regime: impl Into<String>) -> Self {
        self.regimes.push(regime.into());
        self
    }
}

#[async_trait]
impl StageProcessor for ComplianceTagStage {
    async fn process(
        &self,
        mut state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let meta = &mut state.metadata;
        meta.compliance_flags
            .insert(format!("{}{}", flags::PURPOSE_PREFIX, ctx.invocation.purpose));
        if meta.pii_detected {
            meta.compliance_flags.insert(flags::PII_PRESENT.to_string());
        }
        if meta.anonymized {
            meta.compliance_flags.insert(flags::ANONYMIZED.to_string());
        }
        if meta.consent_verified {
            meta.compliance_flags.insert(flags::CONSENT_VERIFIED.to_string());
        }
        if !meta.noised_fields.is_empty() {
            meta.compliance_flags.insert(flags::NOISE_APPLIED.to_string());
        }
        meta.compliance_flags.extend(self.regimes.iter().cloned());

        let unprotected: Vec<&String> = meta
            .pii_fields
            .iter()
            .filter(|field| {
                state.record.contains(field) && !meta.anonymized_fields.contains(field)
            })
            .collect();
        if !unprotected.is_empty() {
            let warning = format!(
                "PII fields leave the flow unanonymized: {}",
                unprotected
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            state.warnings.push(warning);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FieldKind, RecordSchema};
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::{DataRecord, FlowContext, PrivacyError};
    use tessera_privacy::PrivacyBudgetLedger;

    fn schema() -> RecordSchema {
        RecordSchema::new()
            .required("student_id", FieldKind::String)
            .optional("email", FieldKind::String)
            .optional("score", FieldKind::Number)
    }

    fn record() -> DataRecord {
        DataRecord::new()
            .with("student_id", "s-42")
            .with("email", "ada@example.edu")
            .with("score", 88)
    }

    async fn run(
        stage: &dyn StageProcessor,
        state: FlowState,
        invocation: &FlowContext,
    ) -> Result<FlowState, StageError> {
        let schema = schema();
        let ctx = StageContext {
            flow_id: "test",
            invocation,
            schema: &schema,
        };
        stage.process(state, ctx).await
    }

    #[tokio::test]
    async fn test_validate_stage() {
        let ctx = FlowContext::new("analytics");
        assert!(run(&ValidateStage, FlowState::new(record()), &ctx).await.is_ok());

        let bad = DataRecord::new().with("email", "x@y.io");
        let err = run(&ValidateStage, FlowState::new(bad), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("student_id"));
    }

    #[tokio::test]
    async fn test_detect_then_anonymize_detected() {
        let ctx = FlowContext::new("analytics");
        let detected = run(&DetectPiiStage::default(), FlowState::new(record()), &ctx)
            .await
            .unwrap();
        assert!(detected.metadata.pii_detected);
        assert_eq!(detected.metadata.pii_fields, vec!["email".to_string()]);

        let stage = AnonymizeStage::new(Anonymizer::new("[REDACTED]", b"k"), Vec::new())
            .with_detected_fields();
        let out = run(&stage, detected, &ctx).await.unwrap();
        assert_ne!(out.record.get("email"), Some(&json!("ada@example.edu")));
        assert!(out.metadata.anonymized);
        assert_eq!(out.metadata.anonymized_fields, vec!["email".to_string()]);
    }

    #[tokio::test]
    async fn test_authorize_stage() {
        let stage = AuthorizeStage::new()
            .require_purpose_consent()
            .allow_role("instructor");

        let denied = FlowContext::new("research").with_role("instructor");
        let err = run(&stage, FlowState::new(record()), &denied).await.unwrap_err();
        assert!(err.to_string().contains("research"));

        let wrong_role = FlowContext::new("research").with_consent("research").with_role("student");
        assert!(run(&stage, FlowState::new(record()), &wrong_role).await.is_err());

        let ok = FlowContext::new("research").with_consent("research").with_role("instructor");
        let out = run(&stage, FlowState::new(record()), &ok).await.unwrap();
        assert!(out.metadata.consent_verified);
    }

    #[tokio::test]
    async fn test_noisy_aggregate_consumes_budget() {
        let ledger = Arc::new(PrivacyBudgetLedger::new());
        ledger.register_purpose("analytics", 1.0).unwrap();
        let stage = NoisyAggregateStage::new(
            NoiseInjector::new(Arc::clone(&ledger)),
            vec!["score".to_string()],
            NoiseConfig::laplace(0.6, 1.0),
        );
        let ctx = FlowContext::new("analytics");

        let out = run(&stage, FlowState::new(record()), &ctx).await.unwrap();
        assert_eq!(out.metadata.noised_fields, vec!["score".to_string()]);
        assert!(out.record.get("score").unwrap().is_f64());

        let err = run(&stage, FlowState::new(record()), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            StageError::Privacy(PrivacyError::BudgetExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_compliance_flags_and_unprotected_warning() {
        let ctx = FlowContext::new("analytics");
        let mut state = FlowState::new(record());
        state.metadata.pii_detected = true;
        state.metadata.pii_fields = vec!["email".to_string()];

        let out = run(&ComplianceTagStage::new().regime("ferpa"), state, &ctx)
            .await
            .unwrap();
        let flags: Vec<&str> = out.metadata.compliance_flags.iter().map(String::as_str).collect();
        assert_eq!(flags, vec!["ferpa", "pii-present", "purpose:analytics"]);
        assert_eq!(out.warnings.len(), 1);
    }
}
