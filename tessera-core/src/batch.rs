//! Bounded batch queue with isolated, bounded-concurrency processing.
//!
//! Submissions go through a bounded channel into a background worker. The
//! worker flushes when `max_batch_size` items are pending or when the flush
//! interval ticks, whichever comes first. Each batch member runs in its own
//! task, at most `max_concurrency` at a time, and resolves its submitter's
//! future independently: a failing or panicking member never affects its
//! siblings.
//!
//! # Usage
//!
//! ```ignore
//! let queue = BatchQueue::start("warming", Arc::new(handler), BatchConfig::default(), sink);
//! let output = queue.submit(item).await?;
//! queue.shutdown().await; // drains pending items, then stops the worker
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::BatchConfig;
use crate::telemetry::{names, SharedMetricsSink};

/// Processes one batch member.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    async fn handle(&self, item: Self::Item) -> Self::Output;
}

/// Errors returned to a submitter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch queue {queue} is closed")]
    Closed { queue: String },

    #[error("Batch item in {queue} was dropped before completion")]
    Dropped { queue: String },
}

/// Counters for a batch queue.
#[derive(Debug, Default)]
pub struct BatchMetrics {
    pub submitted: AtomicU64,
    pub processed: AtomicU64,
    pub flushes: AtomicU64,
    pub dropped: AtomicU64,
}

/// Point-in-time copy of [`BatchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchMetricsSnapshot {
    pub submitted: u64,
    pub processed: u64,
    pub flushes: u64,
    pub dropped: u64,
}

impl BatchMetrics {
    pub fn snapshot(&self) -> BatchMetricsSnapshot {
        BatchMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Job<H: BatchHandler> {
    item: H::Item,
    reply: oneshot::Sender<H::Output>,
}

/// Handle to a running batch queue.
pub struct BatchQueue<H: BatchHandler> {
    name: String,
    tx: mpsc::Sender<Job<H>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<BatchMetrics>,
}

impl<H: BatchHandler> BatchQueue<H> {
    /// Spawn the background worker. Must be called inside a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        handler: Arc<H>,
        config: BatchConfig,
        sink: SharedMetricsSink,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(BatchMetrics::default());

        let worker = tokio::spawn(run_worker(
            name.clone(),
            handler,
            config,
            rx,
            shutdown_rx,
            Arc::clone(&metrics),
            sink,
        ));

        Self {
            name,
            tx,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit one item and wait for its individual result.
    pub async fn submit(&self, item: H::Item) -> Result<H::Output, BatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { item, reply })
            .await
            .map_err(|_| BatchError::Closed {
                queue: self.name.clone(),
            })?;
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        rx.await.map_err(|_| {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            BatchError::Dropped {
                queue: self.name.clone(),
            }
        })
    }

    pub fn metrics(&self) -> BatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting work, flush what is pending and wait for the worker.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(
                    queue = %self.name,
                    error = %e,
                    "Batch worker terminated abnormally"
                );
            }
        }
    }
}

impl<H: BatchHandler> Drop for BatchQueue<H> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_worker<H: BatchHandler>(
    name: String,
    handler: Arc<H>,
    config: BatchConfig,
    mut rx: mpsc::Receiver<Job<H>>,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<BatchMetrics>,
    sink: SharedMetricsSink,
) {
    let max_batch = config.max_batch_size.max(1);
    let mut pending: Vec<Job<H>> = Vec::with_capacity(max_batch);

    let mut ticker = interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        queue = %name,
        max_batch_size = max_batch,
        max_concurrency = config.max_concurrency,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        "Batch worker started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            job = rx.recv() => match job {
                Some(job) => {
                    pending.push(job);
                    if pending.len() >= max_batch {
                        let batch = std::mem::take(&mut pending);
                        let limit = config.max_concurrency;
                        flush(&name, &handler, batch, limit, &metrics, &sink).await;
                    }
                }
                None => break,
            },

            _ = ticker.tick() => {
                if pending.is_empty() {
                    tracing::trace!(queue = %name, "Flush tick with nothing pending");
                } else {
                    let batch = std::mem::take(&mut pending);
                    flush(&name, &handler, batch, config.max_concurrency, &metrics, &sink).await;
                }
            }
        }
    }

    // Drain whatever was accepted before shutdown.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        pending.push(job);
    }
    if !pending.is_empty() {
        flush(&name, &handler, pending, config.max_concurrency, &metrics, &sink).await;
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        queue = %name,
        submitted = snapshot.submitted,
        processed = snapshot.processed,
        flushes = snapshot.flushes,
        "Batch worker stopped"
    );
}

async fn flush<H: BatchHandler>(
    name: &str,
    handler: &Arc<H>,
    batch: Vec<Job<H>>,
    concurrency: usize,
    metrics: &BatchMetrics,
    sink: &SharedMetricsSink,
) {
    let size = batch.len();
    metrics.flushes.fetch_add(1, Ordering::Relaxed);
    sink.increment_counter(names::BATCH_FLUSHES, 1, &[("queue", name)]);

    stream::iter(batch)
        .for_each_concurrent(concurrency.max(1), |job| {
            let handler = Arc::clone(handler);
            async move {
                let Job { item, reply } = job;
                // Own task per member so a panic stays contained.
                match tokio::spawn(async move { handler.handle(item).await }).await {
                    Ok(output) => {
                        metrics.processed.fetch_add(1, Ordering::Relaxed);
                        let _ = reply.send(output);
                    }
                    Err(e) => {
                        tracing::warn!(queue = %name, error = %e, "Batch member panicked");
                        // Dropping `reply` resolves the submitter with `Dropped`.
                    }
                }
            }
        })
        .await;

    sink.increment_counter(names::BATCH_ITEMS, size as u64, &[("queue", name)]);
    tracing::debug!(queue = %name, size, "Batch flushed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::noop_sink;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Doubler {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for Doubler {
        type Item = i64;
        type Output = Result<i64, String>;

        async fn handle(&self, item: i64) -> Result<i64, String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if item < 0 {
                Err(format!("negative: {}", item))
            } else {
                Ok(item * 2)
            }
        }
    }

    fn doubler() -> Arc<Doubler> {
        Arc::new(Doubler {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_siblings() {
        let handler = doubler();
        let config = BatchConfig::default().with_batch_size(3);
        let queue = Arc::new(BatchQueue::start("test", handler, config, noop_sink()));

        let a = { let q = Arc::clone(&queue); tokio::spawn(async move { q.submit(1).await }) };
        let b = { let q = Arc::clone(&queue); tokio::spawn(async move { q.submit(-1).await }) };
        let c = { let q = Arc::clone(&queue); tokio::spawn(async move { q.submit(3).await }) };

        assert_eq!(a.await.unwrap().unwrap(), Ok(2));
        assert!(b.await.unwrap().unwrap().is_err());
        assert_eq!(c.await.unwrap().unwrap(), Ok(6));

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let handler = doubler();
        let config = BatchConfig::default()
            .with_batch_size(20)
            .with_concurrency(3)
            .with_flush_interval(Duration::from_millis(10));
        let queue = Arc::new(BatchQueue::start(
            "bounded",
            Arc::clone(&handler),
            config,
            noop_sink(),
        ));

        let mut handles = Vec::new();
        for i in 0..20 {
            let q = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { q.submit(i).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }

        assert!(handler.max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.metrics().processed, 20);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_interval_drains_partial_batch() {
        let config = BatchConfig::default()
            .with_batch_size(100)
            .with_flush_interval(Duration::from_millis(20));
        let queue = BatchQueue::start("interval", doubler(), config, noop_sink());

        let out = tokio::time::timeout(Duration::from_secs(2), queue.submit(21))
            .await
            .expect("flush interval should drain a partial batch");
        assert_eq!(out.unwrap(), Ok(42));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let queue = BatchQueue::start("closed", doubler(), BatchConfig::default(), noop_sink());
        queue.shutdown().await;

        let err = queue.submit(1).await.unwrap_err();
        assert!(matches!(err, BatchError::Closed { .. }));
    }

    struct Panicky;

    #[async_trait]
    impl BatchHandler for Panicky {
        type Item = u32;
        type Output = u32;

        async fn handle(&self, item: u32) -> u32 {
            if item == 13 {
                panic!("unlucky");
            }
            item
        }
    }

    #[tokio::test]
    async fn test_panicking_member_is_isolated() {
        let config = BatchConfig::default().with_batch_size(2);
        let queue = Arc::new(BatchQueue::start("panicky", Arc::new(Panicky), config, noop_sink()));

        let bad = { let q = Arc::clone(&queue); tokio::spawn(async move { q.submit(13).await }) };
        let good = { let q = Arc::clone(&queue); tokio::spawn(async move { q.submit(7).await }) };

        assert!(matches!(bad.await.unwrap(), Err(BatchError::Dropped { .. })));
        assert_eq!(good.await.unwrap(), Ok(7));
        queue.shutdown().await;
    }
}
