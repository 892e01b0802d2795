//! TESSERA Pipeline
//!
//! Registered flows of ordered stages that move a record through validation,
//! PII detection, authorization, anonymization and noisy aggregation before
//! it is released.

pub mod events;
pub mod executor;
pub mod flow;
pub mod queue;
pub mod stages;

pub use events::{PipelineEvent, PipelineEventBus, DEFAULT_EVENT_CAPACITY};
pub use executor::{
    PipelineExecutor, ProcessResult, StageReport, StageStatus, DEFAULT_STAGE_TIMEOUT,
};
pub use flow::{
    FieldKind, FieldSpec, FlowDefinition, FlowMetadata, FlowState, PipelineStage, RecordSchema,
    StageContext, StageError, StageProcessor,
};
pub use queue::{FlowJob, PipelineQueue, PIPELINE_QUEUE_NAME};
pub use stages::{
    flags, AnonymizeStage, AuthorizeStage, ComplianceTagStage, DetectPiiStage,
    NoisyAggregateStage, ValidateStage,
};
