//! TESSERA Storage - Tiered Cache
//!
//! Ordered cache levels (in-process, remote, durable) behind a coordinator
//! that handles read-through promotion, fan-out writes and tag invalidation.

pub mod cache;

pub use cache::{
    BackendError, BackendLevel, CacheCoordinator, CacheHealth, CacheLevelStore, CacheWarmer,
    CachedValue, GetOptions, InMemoryKeyValueBackend, KeyValueBackend, LevelStats,
    LevelStatsSnapshot, MemoryLevel, SetOptions, SetOutcome, WarmOutcome, WarmRequest, WarmSource,
};
