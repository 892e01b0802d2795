//! Background jobs owned by the runtime.

pub mod cache_sweep;

pub use cache_sweep::{
    cache_sweep_task, CacheSweepConfig, CacheSweepMetrics, CacheSweepSnapshot,
    DEFAULT_SWEEP_INTERVAL_MS,
};
