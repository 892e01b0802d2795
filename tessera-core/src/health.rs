//! Health check types shared by cache levels and the runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but degraded
    Degraded,
    /// Component is not operational
    Unhealthy,
    /// Health status is unknown (e.g., disabled or not yet checked)
    Unknown,
}

/// Health check result for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    pub message: Option<String>,
    /// Probe round trip in milliseconds, when a probe was made.
    pub response_time_ms: Option<u64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, component, None)
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, component, Some(message.into()))
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, component, Some(message.into()))
    }

    pub fn unknown(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unknown, component, Some(message.into()))
    }

    fn with_status(
        status: HealthStatus,
        component: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            status,
            component: component.into(),
            message,
            response_time_ms: None,
            metadata: None,
        }
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Worst status across a set of checks (`Unknown` entries are ignored).
    pub fn overall(checks: &[HealthCheck]) -> HealthStatus {
        let mut overall = HealthStatus::Healthy;
        for check in checks {
            match check.status {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded => overall = HealthStatus::Degraded,
                HealthStatus::Healthy | HealthStatus::Unknown => {}
            }
        }
        overall
    }
}
