//! Error types for TESSERA operations

use std::time::Duration;
use thiserror::Error;

/// Cache layer errors.
///
/// These never reach callers of the cache coordinator's read/write API:
/// the coordinator converts them into per-level misses. They surface only
/// from typed helpers (serialization) and from direct level access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache level {level} unavailable: {reason}")]
    LevelUnavailable { level: String, reason: String },

    #[error("Cache level {level} timed out after {after:?}")]
    Timeout { level: String, after: Duration },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Privacy layer errors.
///
/// Policy violations. These propagate to the caller unchanged and must never
/// be converted into a silent fallback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PrivacyError {
    #[error(
        "Privacy budget exceeded for {purpose}: requested {requested}, consumed {consumed}, limit {limit}"
    )]
    BudgetExceeded {
        purpose: String,
        requested: f64,
        consumed: f64,
        limit: f64,
    },

    #[error("No privacy budget registered for purpose {purpose}")]
    UnknownPurpose { purpose: String },

    #[error("Invalid noise configuration: {reason}")]
    InvalidNoiseConfig { reason: String },

    #[error("Invalid anonymization rule for {field}: {reason}")]
    InvalidRule { field: String, reason: String },

    #[error("Privacy ledger lock poisoned")]
    LockPoisoned,
}

/// Pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },

    #[error("Flow disabled: {flow_id}")]
    FlowDisabled { flow_id: String },

    #[error("Stage {stage} failed in flow {flow_id} (required: {required}): {reason}")]
    StageFailed {
        flow_id: String,
        stage: String,
        required: bool,
        reason: String,
    },

    #[error("Invalid flow definition {flow_id}: {reason}")]
    InvalidFlow { flow_id: String, reason: String },

    #[error("Processing queue closed")]
    QueueClosed,

    #[error("Flow registry lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Master error type for all TESSERA errors.
#[derive(Debug, Clone, Error)]
pub enum TesseraError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Privacy error: {0}")]
    Privacy(#[from] PrivacyError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// True for errors that represent a policy decision (budget, flow
    /// configuration) rather than an infrastructure fault.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            TesseraError::Privacy(PrivacyError::BudgetExceeded { .. })
                | TesseraError::Pipeline(PipelineError::FlowNotFound { .. })
                | TesseraError::Pipeline(PipelineError::FlowDisabled { .. })
        )
    }
}

/// Result type alias for TESSERA operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display_timeout() {
        let err = CacheError::Timeout {
            level: "remote".to_string(),
            after: Duration::from_millis(250),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("remote"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_privacy_error_display_budget_exceeded() {
        let err = PrivacyError::BudgetExceeded {
            purpose: "analytics".to_string(),
            requested: 0.6,
            consumed: 4.5,
            limit: 5.0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("analytics"));
        assert!(msg.contains("0.6"));
        assert!(msg.contains("4.5"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn test_pipeline_error_display_stage_failed() {
        let err = PipelineError::StageFailed {
            flow_id: "grades-export".to_string(),
            stage: "anonymize".to_string(),
            required: true,
            reason: "missing secret".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("grades-export"));
        assert!(msg.contains("anonymize"));
        assert!(msg.contains("required: true"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::invalid("capacity", 0, "must be positive");
        let msg = format!("{}", err);
        assert!(msg.contains("capacity"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_tessera_error_from_variants() {
        let cache = TesseraError::from(CacheError::LockPoisoned);
        assert!(matches!(cache, TesseraError::Cache(_)));

        let privacy = TesseraError::from(PrivacyError::UnknownPurpose {
            purpose: "x".to_string(),
        });
        assert!(matches!(privacy, TesseraError::Privacy(_)));

        let pipeline = TesseraError::from(PipelineError::QueueClosed);
        assert!(matches!(pipeline, TesseraError::Pipeline(_)));

        let config = TesseraError::from(ConfigError::MissingRequired {
            field: "levels".to_string(),
        });
        assert!(matches!(config, TesseraError::Config(_)));
    }

    #[test]
    fn test_policy_violation_classification() {
        let budget = TesseraError::from(PrivacyError::BudgetExceeded {
            purpose: "analytics".to_string(),
            requested: 1.0,
            consumed: 0.0,
            limit: 0.5,
        });
        assert!(budget.is_policy_violation());

        let missing = TesseraError::from(PipelineError::FlowNotFound {
            flow_id: "nope".to_string(),
        });
        assert!(missing.is_policy_violation());

        let cache = TesseraError::from(CacheError::LockPoisoned);
        assert!(!cache.is_policy_violation());
    }
}
