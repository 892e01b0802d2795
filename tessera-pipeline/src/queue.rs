//! Batched flow processing.
//!
//! Wraps [`BatchQueue`] so many records can be pushed through the executor
//! with bounded concurrency. Each submission resolves with its own result;
//! one record failing a required stage never affects its batch siblings.

use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{
    BatchConfig, BatchError, BatchHandler, BatchMetricsSnapshot, BatchQueue, DataRecord,
    FlowContext, PipelineError, SharedMetricsSink, TesseraResult,
};

use crate::executor::{PipelineExecutor, ProcessResult};

/// Name the processing queue reports under.
pub const PIPELINE_QUEUE_NAME: &str = "pipeline";

/// One queued invocation.
#[derive(Debug, Clone)]
pub struct FlowJob {
    pub flow_id: String,
    pub record: DataRecord,
    pub context: FlowContext,
}

struct FlowJobHandler {
    executor: Arc<PipelineExecutor>,
}

#[async_trait]
impl BatchHandler for FlowJobHandler {
    type Item = FlowJob;
    type Output = TesseraResult<ProcessResult>;

    async fn handle(&self, job: FlowJob) -> TesseraResult<ProcessResult> {
        self.executor
            .process(&job.flow_id, job.record, &job.context)
            .await
    }
}

/// Bounded-concurrency front door to a [`PipelineExecutor`].
pub struct PipelineQueue {
    queue: BatchQueue<FlowJobHandler>,
}

impl PipelineQueue {
    /// Spawn the queue worker. Must be called inside a tokio runtime.
    pub fn start(
        executor: Arc<PipelineExecutor>,
        config: BatchConfig,
        sink: SharedMetricsSink,
    ) -> Self {
        let handler = Arc::new(FlowJobHandler { executor });
        Self {
            queue: BatchQueue::start(PIPELINE_QUEUE_NAME, handler, config, sink),
        }
    }

    /// Queue one record and wait for its own result.
    pub async fn submit(
        &self,
        flow_id: impl Into<String>,
        record: DataRecord,
        context: FlowContext,
    ) -> TesseraResult<ProcessResult> {
        let job = FlowJob {
            flow_id: flow_id.into(),
            record,
            context,
        };
        match self.queue.submit(job).await {
            Ok(result) => result,
            Err(BatchError::Closed { .. }) => Err(PipelineError::QueueClosed.into()),
            Err(BatchError::Dropped { queue }) => {
                tracing::warn!(queue = %queue, "Flow job dropped before completion");
                Err(PipelineError::QueueClosed.into())
            }
        }
    }

    pub fn metrics(&self) -> BatchMetricsSnapshot {
        self.queue.metrics()
    }

    /// Process what is pending, then stop.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
