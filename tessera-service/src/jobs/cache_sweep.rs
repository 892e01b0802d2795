//! Expired-Entry Sweep Background Task
//!
//! In-process cache levels drop expired entries lazily when they are read.
//! Entries that are never read again would otherwise sit in memory until
//! eviction, so this task periodically asks the coordinator to purge them.
//! The interval comes from `cache.sweep_interval` in the runtime config.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_storage::CacheCoordinator;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Default sweep interval in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the sweep task.
#[derive(Debug, Clone)]
pub struct CacheSweepConfig {
    /// How often to purge (default: 60 seconds)
    pub interval: Duration,

    /// Whether to log sweeps that purged something (default: true)
    pub log_purges: bool,
}

impl Default for CacheSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            log_purges: true,
        }
    }
}

impl CacheSweepConfig {
    /// Sweep on the cache's configured interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the sweep task.
#[derive(Debug, Default)]
pub struct CacheSweepMetrics {
    /// Sweep cycles completed
    pub sweeps: AtomicU64,

    /// Expired entries purged since startup
    pub entries_purged: AtomicU64,
}

impl CacheSweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CacheSweepSnapshot {
        CacheSweepSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            entries_purged: self.entries_purged.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSweepSnapshot {
    pub sweeps: u64,
    pub entries_purged: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Periodically purge expired entries until the shutdown signal is received.
///
/// `metrics` is shared with the caller so counters can be read while the
/// task runs; the same handle is returned when it stops.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let metrics = Arc::new(CacheSweepMetrics::new());
/// let handle = tokio::spawn(cache_sweep_task(
///     Arc::clone(&coordinator),
///     CacheSweepConfig::default(),
///     Arc::clone(&metrics),
///     shutdown_rx,
/// ));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn cache_sweep_task(
    coordinator: Arc<CacheCoordinator>,
    config: CacheSweepConfig,
    metrics: Arc<CacheSweepMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CacheSweepMetrics> {
    let mut sweep_interval = interval(config.interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; nothing has expired yet.
    sweep_interval.tick().await;

    tracing::info!(
        interval_ms = config.interval.as_millis() as u64,
        "Cache sweep task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(&coordinator, &config, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        entries_purged = snapshot.entries_purged,
        "Cache sweep task completed"
    );

    metrics
}

/// Perform one sweep cycle.
fn sweep_once(
    coordinator: &CacheCoordinator,
    config: &CacheSweepConfig,
    metrics: &CacheSweepMetrics,
) {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);
    let purged = coordinator.purge_expired() as u64;
    metrics.entries_purged.fetch_add(purged, Ordering::Relaxed);

    if purged > 0 && config.log_purges {
        tracing::info!(purged, "Cache sweep purged expired entries");
    } else {
        tracing::trace!(purged, "Cache sweep cycle completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::CacheConfig;
    use tessera_storage::{GetOptions, InMemoryKeyValueBackend, SetOptions};

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

    #[test]
    fn test_sweep_config_default() {
        let config = CacheSweepConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert!(config.log_purges);
        assert_eq!(
            CacheSweepConfig::with_interval(Duration::from_secs(5)).interval,
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_unread_expired_entries() {
        let cache = coordinator();
        let options = SetOptions::default()
            .ttl(Duration::from_millis(100))
            .levels(["memory"]);
        cache.set("session:1", b"a".to_vec(), &options).await;
        cache.set("session:2", b"b".to_vec(), &options).await;
        cache
            .set("roster:A", b"kept".to_vec(), &SetOptions::default().levels(["memory"]))
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(CacheSweepMetrics::new());
        let handle = tokio::spawn(cache_sweep_task(
            Arc::clone(&cache),
            CacheSweepConfig::with_interval(Duration::from_secs(1)),
            Arc::clone(&metrics),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweeps, 1);
        assert_eq!(snapshot.entries_purged, 2);
        assert_eq!(
            cache.level("memory").map(|level| level.len()),
            Some(1)
        );
        assert!(cache.get("roster:A", &GetOptions::default()).await.is_some());

        shutdown_tx.send(true).unwrap();
        let finished = handle.await.unwrap();
        assert_eq!(finished.snapshot().entries_purged, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stops_when_sender_dropped() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(cache_sweep_task(
            coordinator(),
            CacheSweepConfig::with_interval(Duration::from_secs(5)),
            Arc::new(CacheSweepMetrics::new()),
            shutdown_rx,
        ));
        drop(shutdown_tx);
        let metrics = handle.await.unwrap();
        assert_eq!(metrics.snapshot().sweeps, 0);
    }
}
