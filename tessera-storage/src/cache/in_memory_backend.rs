//! DashMap-backed [`KeyValueBackend`] for embedded deployments and tests.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::traits::{BackendError, KeyValueBackend};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// Process-local stand-in for a remote or durable key-value store.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueBackend {
    entries: DashMap<String, StoredValue>,
    max_value_bytes: Option<usize>,
}

impl InMemoryKeyValueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values larger than `limit` bytes, as a network store would.
    pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
        self.max_value_bytes = Some(limit);
        self
    }

    /// Number of stored (possibly expired) values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let stored = self.entries.get(key)?.clone();
        if now >= stored.expires_at {
            self.entries.remove_if(key, |_, v| now >= v.expires_at);
            return None;
        }
        Some(stored)
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryKeyValueBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.live(key).map(|v| v.bytes))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BackendError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(BackendError::Rejected(format!(
                    "value of {} bytes exceeds limit of {} bytes",
                    value.len(),
                    limit
                )));
            }
        }
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BackendError> {
        let now = Instant::now();
        Ok(self.live(key).map(|v| v.expires_at.saturating_duration_since(now)))
    }
}
