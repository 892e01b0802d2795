//! Tiered cache: level stores, backends and the cross-level coordinator.
//!
//! ```text
//! CacheCoordinator ─┬─ MemoryLevel           (L1, in-process, sharded)
//!                   ├─ BackendLevel<remote>  (L2, KeyValueBackend)
//!                   └─ BackendLevel<durable> (L3, KeyValueBackend)
//! ```

mod backend_level;
mod coordinator;
mod in_memory_backend;
mod memory;
mod shard;
mod traits;
mod warming;

pub use backend_level::BackendLevel;
pub use coordinator::{CacheCoordinator, CacheHealth, GetOptions, SetOptions, SetOutcome};
pub use in_memory_backend::InMemoryKeyValueBackend;
pub use memory::MemoryLevel;
pub use traits::{
    BackendError, CacheLevelStore, CachedValue, KeyValueBackend, LevelStats, LevelStatsSnapshot,
};
pub use warming::{CacheWarmer, WarmOutcome, WarmRequest, WarmSource};
