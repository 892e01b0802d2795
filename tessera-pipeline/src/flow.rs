//! Flow definitions: record schema, stages and the state passed between them.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{DataRecord, FlowContext, PipelineError, PrivacyError};
use tessera_privacy::PiiMatch;
use thiserror::Error;

// ============================================================================
// SCHEMA
// ============================================================================

/// JSON shape expected for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// Declaration of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub required: bool,
}

/// Fields a flow accepts. Checked against stages at registration and
/// against records by the validate stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub fields: BTreeMap<String, FieldSpec>,
    /// Accept fields that are not declared.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl RecordSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), FieldSpec { kind, required: true });
        self
    }

    pub fn optional(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), FieldSpec { kind, required: false });
        self
    }

    pub fn allow_unknown(mut self, allow: bool) -> Self {
        self.allow_unknown = allow;
        self
    }

    pub fn declares(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Every violation of this schema in `record`, empty when it conforms.
    pub fn violations(&self, record: &DataRecord) -> Vec<String> {
        let mut violations = Vec::new();
        for (name, spec) in &self.fields {
            match record.get(name) {
                None | Some(Value::Null) if spec.required => {
                    violations.push(format!("missing required field {}", name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    violations.push(format!("field {} is not of kind {:?}", name, spec.kind));
                }
                Some(_) => {}
            }
        }
        if !self.allow_unknown {
            for name in record.field_names() {
                if !self.declares(name) {
                    violations.push(format!("undeclared field {}", name));
                }
            }
        }
        violations
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Flags accumulated while a flow runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub pii_detected: bool,
    pub pii_fields: Vec<String>,
    pub pii_matches: Vec<PiiMatch>,
    pub anonymized: bool,
    pub anonymized_fields: Vec<String>,
    pub consent_verified: bool,
    pub compliance_flags: BTreeSet<String>,
    pub noised_fields: Vec<String>,
    pub epsilon_consumed: f64,
}

/// What one stage hands to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowState {
    pub record: DataRecord,
    pub metadata: FlowMetadata,
    pub warnings: Vec<String>,
}

impl FlowState {
    pub fn new(record: DataRecord) -> Self {
        Self {
            record,
            ..Self::default()
        }
    }
}

/// Read-only inputs shared by every stage of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub flow_id: &'a str,
    pub invocation: &'a FlowContext,
    pub schema: &'a RecordSchema,
}

// ============================================================================
// STAGES
// ============================================================================

/// Why a stage failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Privacy(#[from] PrivacyError),

    #[error("stage timed out after {0:?}")]
    TimedOut(Duration),
}

impl StageError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        StageError::Rejected(reason.into())
    }

    /// Budget rejections abort the flow even from an optional stage.
    pub fn is_budget_rejection(&self) -> bool {
        matches!(self, StageError::Privacy(PrivacyError::BudgetExceeded { .. }))
    }
}

/// Work done by one stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(
        &self,
        state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError>;

    /// Record fields this stage reads or writes by name.
    fn referenced_fields(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A named, ordered stage of a flow.
#[derive(Clone)]
pub struct PipelineStage {
    pub name: String,
    pub order: i32,
    pub enabled: bool,
    pub required_for_privacy: bool,
    /// Overrides the executor's default stage timeout.
    pub timeout: Option<Duration>,
    pub processor: Arc<dyn StageProcessor>,
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("enabled", &self.enabled)
            .field("required_for_privacy", &self.required_for_privacy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PipelineStage {
    /// A required, enabled stage.
    pub fn new(name: impl Into<String>, order: i32, processor: Arc<dyn StageProcessor>) -> Self {
        Self {
            name: name.into(),
            order,
            enabled: true,
            required_for_privacy: true,
            timeout: None,
            processor,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required_for_privacy = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// FLOWS
// ============================================================================

/// A registered flow.
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub id: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub schema: RecordSchema,
    pub stages: Vec<PipelineStage>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, schema: RecordSchema) -> Self {
        Self {
            id: id.into(),
            description: None,
            enabled: true,
            schema,
            stages: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn stage(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::InvalidFlow {
            flow_id: self.id.clone(),
            reason: reason.into(),
        }
    }

    /// Reject empty ids, duplicate stage names and stages that reference
    /// fields the schema does not declare.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("flow id is empty"));
        }
        if self.stages.is_empty() {
            return Err(self.invalid("flow has no stages"));
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(self.invalid(format!("duplicate stage name {}", stage.name)));
            }
            for field in stage.processor.referenced_fields() {
                if !self.schema.declares(&field) {
                    return Err(self.invalid(format!(
                        "stage {} references undeclared field {}",
                        stage.name, field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Enabled stages in ascending order; equal orders keep declaration order.
    pub fn execution_plan(&self) -> Vec<&PipelineStage> {
        let mut plan: Vec<&PipelineStage> = self.stages.iter().filter(|s| s.enabled).collect();
        plan.sort_by_key(|stage| stage.order);
        plan
    }
}
