//! Per-purpose privacy budget accounting.
//!
//! The ledger is the one strictly serialized structure in TESSERA: the check
//! and the commit of [`PrivacyBudgetLedger::check_and_consume`] happen under a
//! single mutex acquisition, so two concurrent requests can never both pass
//! the check against the same remaining budget.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tessera_core::telemetry::names;
use tessera_core::{noop_sink, PrivacyConfig, PrivacyError, SharedMetricsSink};

/// Slack for float accumulation when a request exactly fills the budget.
const LIMIT_TOLERANCE: f64 = 1e-9;

/// Budget state of one purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub purpose: String,
    pub consumed_epsilon: f64,
    pub limit_epsilon: f64,
}

impl PrivacyBudget {
    pub fn remaining(&self) -> f64 {
        (self.limit_epsilon - self.consumed_epsilon).max(0.0)
    }
}

/// Successful consumption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetGrant {
    pub consumed: f64,
    pub remaining: f64,
}

#[derive(Debug, Clone, Copy)]
struct BudgetState {
    consumed: f64,
    limit: f64,
}

/// Mutex-guarded ledger of per-purpose budgets.
pub struct PrivacyBudgetLedger {
    budgets: Mutex<BTreeMap<String, BudgetState>>,
    sink: SharedMetricsSink,
}

impl std::fmt::Debug for PrivacyBudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyBudgetLedger")
            .field("budgets", &self.budgets)
            .finish()
    }
}

impl Default for PrivacyBudgetLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivacyBudgetLedger {
    pub fn new() -> Self {
        Self {
            budgets: Mutex::new(BTreeMap::new()),
            sink: noop_sink(),
        }
    }

    /// Ledger with one budget per configured purpose.
    pub fn from_config(config: &PrivacyConfig) -> Result<Self, PrivacyError> {
        let ledger = Self::new();
        for (purpose, limit) in &config.budgets {
            ledger.register_purpose(purpose, *limit)?;
        }
        Ok(ledger)
    }

    pub fn with_metrics(mut self, sink: SharedMetricsSink) -> Self {
        self.sink = sink;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, BudgetState>>, PrivacyError> {
        self.budgets.lock().map_err(|_| PrivacyError::LockPoisoned)
    }

    /// Create a budget for `purpose`. Returns `false` (and changes nothing)
    /// if the purpose already has one.
    pub fn register_purpose(&self, purpose: &str, limit: f64) -> Result<bool, PrivacyError> {
        if !limit.is_finite() || limit <= 0.0 {
            return Err(PrivacyError::InvalidNoiseConfig {
                reason: format!(
                    "budget limit for {} must be finite and > 0, got {}",
                    purpose, limit
                ),
            });
        }
        let mut budgets = self.lock()?;
        if budgets.contains_key(purpose) {
            return Ok(false);
        }
        budgets.insert(
            purpose.to_string(),
            BudgetState {
                consumed: 0.0,
                limit,
            },
        );
        tracing::info!(purpose, limit, "Registered privacy budget");
        Ok(true)
    }

    /// Atomically consume `epsilon` from `purpose`, or reject without any
    /// change if that would exceed the limit.
    pub fn check_and_consume(
        &self,
        purpose: &str,
        epsilon: f64,
    ) -> Result<BudgetGrant, PrivacyError> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(PrivacyError::InvalidNoiseConfig {
                reason: format!("epsilon must be finite and > 0, got {}", epsilon),
            });
        }

        let mut budgets = self.lock()?;
        let state = budgets
            .get_mut(purpose)
            .ok_or_else(|| PrivacyError::UnknownPurpose {
                purpose: purpose.to_string(),
            })?;

        if state.consumed + epsilon > state.limit + LIMIT_TOLERANCE {
            let rejected = PrivacyError::BudgetExceeded {
                purpose: purpose.to_string(),
                requested: epsilon,
                consumed: state.consumed,
                limit: state.limit,
            };
            drop(budgets);
            self.sink
                .increment_counter(names::PRIVACY_BUDGET_REJECTIONS, 1, &[("purpose", purpose)]);
            tracing::warn!(
                purpose,
                requested = epsilon,
                error = %rejected,
                "Privacy budget rejected request"
            );
            return Err(rejected);
        }

        state.consumed = (state.consumed + epsilon).min(state.limit);
        let grant = BudgetGrant {
            consumed: state.consumed,
            remaining: state.limit - state.consumed,
        };
        drop(budgets);

        self.sink
            .set_gauge(names::PRIVACY_BUDGET_CONSUMED, grant.consumed, &[("purpose", purpose)]);
        tracing::debug!(purpose, epsilon, consumed = grant.consumed, "Privacy budget consumed");
        Ok(grant)
    }

    /// Boolean form of [`check_and_consume`](Self::check_and_consume).
    /// Consumes on `true`. Unknown purposes and invalid epsilons are `false`.
    pub fn check_budget(&self, purpose: &str, epsilon: f64) -> bool {
        self.check_and_consume(purpose, epsilon).is_ok()
    }

    pub fn consumed(&self, purpose: &str) -> Option<f64> {
        self.lock().ok()?.get(purpose).map(|s| s.consumed)
    }

    pub fn remaining(&self, purpose: &str) -> Option<f64> {
        self.lock()
            .ok()?
            .get(purpose)
            .map(|s| (s.limit - s.consumed).max(0.0))
    }

    pub fn snapshot(&self) -> Result<Vec<PrivacyBudget>, PrivacyError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(purpose, state)| PrivacyBudget {
                purpose: purpose.clone(),
                consumed_epsilon: state.consumed,
                limit_epsilon: state.limit,
            })
            .collect())
    }

    /// Administrative reset of `purpose` to zero consumption.
    pub fn reset_budget(&self, purpose: &str) -> Result<(), PrivacyError> {
        let mut budgets = self.lock()?;
        let state = budgets
            .get_mut(purpose)
            .ok_or_else(|| PrivacyError::UnknownPurpose {
                purpose: purpose.to_string(),
            })?;
        let previous = state.consumed;
        state.consumed = 0.0;
        drop(budgets);

        self.sink
            .set_gauge(names::PRIVACY_BUDGET_CONSUMED, 0.0, &[("purpose", purpose)]);
        tracing::info!(purpose, previous, "Privacy budget reset");
        Ok(())
    }
}
