//! Flow registry and executor.
//!
//! One invocation moves through `Pending -> Running(stage) -> Completed |
//! Failed`. Stages run strictly one after another in ascending `order`. A
//! required stage failure ends the invocation with an error. An optional
//! stage failure is recorded and the next stage receives the state as it was
//! before the failing stage ran. A privacy budget rejection always ends the
//! invocation, required or not, so an aggregate is never released un-noised.
//!
//! Every [`PipelineEvent`] is published on the bus and mirrored into the
//! metrics sink through [`MetricsSink::emit`](tessera_core::MetricsSink::emit).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tessera_core::telemetry::names;
use tessera_core::{
    noop_sink, DataRecord, FlowContext, PipelineError, PrivacyError, SharedMetricsSink,
    TesseraError, TesseraResult,
};
use uuid::Uuid;

use crate::events::{PipelineEvent, PipelineEventBus};
use crate::flow::{FlowDefinition, FlowMetadata, FlowState, PipelineStage, StageContext, StageError};

/// Applied to stages without their own timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

/// Per-stage trace of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub elapsed_ms: u64,
}

/// Outcome of a completed invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub flow_id: String,
    pub correlation_id: Uuid,
    pub data: DataRecord,
    pub metadata: FlowMetadata,
    pub warnings: Vec<String>,
    /// Failures of optional stages.
    pub errors: Vec<PipelineError>,
    pub stages: Vec<StageReport>,
}

/// Registry of flows plus the machinery to run them.
pub struct PipelineExecutor {
    flows: RwLock<HashMap<String, Arc<FlowDefinition>>>,
    bus: PipelineEventBus,
    sink: SharedMetricsSink,
    default_timeout: Duration,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineExecutor {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            bus: PipelineEventBus::default(),
            sink: noop_sink(),
            default_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_event_bus(mut self, bus: PipelineEventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_metrics(mut self, sink: SharedMetricsSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn events(&self) -> &PipelineEventBus {
        &self.bus
    }

    /// Validate and register a flow, replacing any flow with the same id.
    pub fn register_flow(&self, definition: FlowDefinition) -> Result<(), PipelineError> {
        definition.validate()?;
        let id = definition.id.clone();
        let stages = definition.stages.len();
        let replaced = self
            .flows
            .write()
            .map_err(|_| PipelineError::LockPoisoned)?
            .insert(id.clone(), Arc::new(definition))
            .is_some();
        tracing::info!(flow = %id, stages, replaced, "Registered flow");
        Ok(())
    }

    pub fn unregister_flow(&self, flow_id: &str) -> Result<bool, PipelineError> {
        Ok(self
            .flows
            .write()
            .map_err(|_| PipelineError::LockPoisoned)?
            .remove(flow_id)
            .is_some())
    }

    /// Enable or disable a registered flow.
    pub fn set_flow_enabled(&self, flow_id: &str, enabled: bool) -> Result<(), PipelineError> {
        let mut flows = self.flows.write().map_err(|_| PipelineError::LockPoisoned)?;
        let flow = flows.get_mut(flow_id).ok_or_else(|| PipelineError::FlowNotFound {
            flow_id: flow_id.to_string(),
        })?;
        Arc::make_mut(flow).enabled = enabled;
        Ok(())
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let flows = self.flows.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = flows.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lookup(&self, flow_id: &str) -> Result<Arc<FlowDefinition>, PipelineError> {
        let flows = self.flows.read().map_err(|_| PipelineError::LockPoisoned)?;
        let flow = flows.get(flow_id).ok_or_else(|| PipelineError::FlowNotFound {
            flow_id: flow_id.to_string(),
        })?;
        if !flow.enabled {
            return Err(PipelineError::FlowDisabled {
                flow_id: flow_id.to_string(),
            });
        }
        Ok(Arc::clone(flow))
    }

    /// Run `record` through the flow registered as `flow_id`.
    ///
    /// Unknown or disabled flows fail before any stage runs. A privacy
    /// budget rejection from any stage returns that [`PrivacyError`]
    /// unchanged; any other required failure is
    /// [`PipelineError::StageFailed`].
    pub async fn process(
        &self,
        flow_id: &str,
        record: DataRecord,
        context: &FlowContext,
    ) -> TesseraResult<ProcessResult> {
        let flow = self.lookup(flow_id)?;
        let started = Instant::now();
        let correlation_id = context.correlation_id;
        let ctx = StageContext {
            flow_id,
            invocation: context,
            schema: &flow.schema,
        };

        let mut state = FlowState::new(record);
        let mut errors = Vec::new();
        let mut reports = Vec::new();

        for stage in flow.execution_plan() {
            let stage_started = Instant::now();
            let before = state.clone();
            let outcome = self.run_stage(stage, state, ctx).await;
            let elapsed_ms = stage_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(next) => {
                    reports.push(StageReport {
                        stage: stage.name.clone(),
                        status: StageStatus::Succeeded,
                        elapsed_ms,
                    });
                    state = next;
                }
                Err(error) => {
                    reports.push(StageReport {
                        stage: stage.name.clone(),
                        status: StageStatus::Failed,
                        elapsed_ms,
                    });
                    self.report_stage_failure(flow_id, correlation_id, context, stage, &error);

                    if stage.required_for_privacy || error.is_budget_rejection() {
                        return Err(self.fail_flow(flow_id, correlation_id, stage, error, started));
                    }

                    tracing::warn!(
                        flow = flow_id,
                        stage = %stage.name,
                        error = %error,
                        "Optional stage failed; continuing with pre-stage data"
                    );
                    state = before;
                    state
                        .warnings
                        .push(format!("optional stage {} failed: {}", stage.name, error));
                    errors.push(PipelineError::StageFailed {
                        flow_id: flow_id.to_string(),
                        stage: stage.name.clone(),
                        required: false,
                        reason: error.to_string(),
                    });
                }
            }
        }

        if state.metadata.pii_detected {
            self.publish(PipelineEvent::PiiDetected {
                flow_id: flow_id.to_string(),
                correlation_id,
                fields: state.metadata.pii_fields.clone(),
            });
        }
        self.publish(PipelineEvent::FlowCompleted {
            flow_id: flow_id.to_string(),
            correlation_id,
            warnings: state.warnings.len(),
            at: chrono::Utc::now(),
        });
        self.observe_flow(flow_id, "completed", started);

        let FlowState {
            record,
            metadata,
            warnings,
        } = state;
        Ok(ProcessResult {
            flow_id: flow_id.to_string(),
            correlation_id,
            data: record,
            metadata,
            warnings,
            errors,
            stages: reports,
        })
    }

    async fn run_stage(
        &self,
        stage: &PipelineStage,
        state: FlowState,
        ctx: StageContext<'_>,
    ) -> Result<FlowState, StageError> {
        let limit = stage.timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(limit, stage.processor.process(state, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::TimedOut(limit)),
        }
    }

    fn report_stage_failure(
        &self,
        flow_id: &str,
        correlation_id: Uuid,
        context: &FlowContext,
        stage: &PipelineStage,
        error: &StageError,
    ) {
        let required = if stage.required_for_privacy { "true" } else { "false" };
        self.sink.increment_counter(
            names::PIPELINE_STAGE_FAILURES,
            1,
            &[("flow", flow_id), ("stage", stage.name.as_str()), ("required", required)],
        );
        self.publish(PipelineEvent::StageFailed {
            flow_id: flow_id.to_string(),
            correlation_id,
            stage: stage.name.clone(),
            required: stage.required_for_privacy,
            reason: error.to_string(),
        });
        if let StageError::Privacy(PrivacyError::BudgetExceeded { requested, .. }) = error {
            self.publish(PipelineEvent::BudgetRejected {
                flow_id: flow_id.to_string(),
                correlation_id,
                purpose: context.purpose.clone(),
                requested: *requested,
            });
        }
    }

    fn fail_flow(
        &self,
        flow_id: &str,
        correlation_id: Uuid,
        stage: &PipelineStage,
        error: StageError,
        started: Instant,
    ) -> TesseraError {
        tracing::warn!(
            flow = flow_id,
            stage = %stage.name,
            error = %error,
            "Stage failed; aborting flow"
        );
        self.publish(PipelineEvent::FlowFailed {
            flow_id: flow_id.to_string(),
            correlation_id,
            stage: stage.name.clone(),
            reason: error.to_string(),
            at: chrono::Utc::now(),
        });
        self.observe_flow(flow_id, "failed", started);

        match error {
            StageError::Privacy(budget @ PrivacyError::BudgetExceeded { .. }) => budget.into(),
            other => PipelineError::StageFailed {
                flow_id: flow_id.to_string(),
                stage: stage.name.clone(),
                required: true,
                reason: other.to_string(),
            }
            .into(),
        }
    }

    fn publish(&self, event: PipelineEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.sink.emit(event.event_type(), &payload);
        self.bus.publish(event);
    }

    fn observe_flow(&self, flow_id: &str, status: &str, started: Instant) {
        let labels = [("flow", flow_id), ("status", status)];
        self.sink.increment_counter(names::PIPELINE_FLOWS, 1, &labels);
        self.sink.record_histogram(
            names::PIPELINE_FLOW_SECONDS,
            started.elapsed().as_secs_f64(),
            &labels,
        );
    }
}
