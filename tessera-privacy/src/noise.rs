//! Differential-privacy noise.
//!
//! `scale = sensitivity / epsilon`. Laplace noise is drawn by inverse CDF from
//! a uniform `u` in `[-0.5, 0.5)`; Gaussian noise by Box-Muller, scaled by
//! `sqrt(scale)` so its variance equals `scale`.

use std::f64::consts::PI;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tessera_core::telemetry::names;
use tessera_core::{noop_sink, PrivacyError, SharedMetricsSink};

use crate::budget::PrivacyBudgetLedger;

/// Noise distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMechanism {
    Laplace,
    Gaussian,
}

impl NoiseMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseMechanism::Laplace => "laplace",
            NoiseMechanism::Gaussian => "gaussian",
        }
    }
}

/// Parameters of one noise draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    pub epsilon: f64,
    #[serde(default)]
    pub delta: f64,
    pub sensitivity: f64,
    pub mechanism: NoiseMechanism,
    /// Clamp results below zero (counts and other non-negative quantities).
    #[serde(default)]
    pub clamp_non_negative: bool,
}

impl NoiseConfig {
    pub fn laplace(epsilon: f64, sensitivity: f64) -> Self {
        Self {
            epsilon,
            delta: 0.0,
            sensitivity,
            mechanism: NoiseMechanism::Laplace,
            clamp_non_negative: false,
        }
    }

    pub fn gaussian(epsilon: f64, delta: f64, sensitivity: f64) -> Self {
        Self {
            epsilon,
            delta,
            sensitivity,
            mechanism: NoiseMechanism::Gaussian,
            clamp_non_negative: false,
        }
    }

    /// Treat the noised quantity as a count.
    pub fn non_negative(mut self) -> Self {
        self.clamp_non_negative = true;
        self
    }

    pub fn scale(&self) -> f64 {
        self.sensitivity / self.epsilon
    }

    pub fn validate(&self) -> Result<(), PrivacyError> {
        let invalid = |reason: String| Err(PrivacyError::InvalidNoiseConfig { reason });
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return invalid(format!("epsilon must be finite and > 0, got {}", self.epsilon));
        }
        if !self.sensitivity.is_finite() || self.sensitivity <= 0.0 {
            return invalid(format!("sensitivity must be finite and > 0, got {}", self.sensitivity));
        }
        if !(0.0..1.0).contains(&self.delta) {
            return invalid(format!("delta must be in [0, 1), got {}", self.delta));
        }
        Ok(())
    }
}

/// One Laplace(0, scale) sample.
pub fn laplace_sample<R: Rng>(scale: f64, rng: &mut R) -> f64 {
    loop {
        let u: f64 = rng.random::<f64>() - 0.5;
        let tail = 1.0 - 2.0 * u.abs();
        // u = -0.5 would give ln(0).
        if tail > 0.0 {
            return -scale * u.signum() * tail.ln();
        }
    }
}

/// One Gaussian sample with variance `scale`.
pub fn gaussian_sample<R: Rng>(scale: f64, rng: &mut R) -> f64 {
    // u1 in (0, 1] keeps ln finite.
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    z * scale.sqrt()
}

/// Add noise to `value` with the given random source.
pub fn add_noise_with<R: Rng>(
    value: f64,
    config: &NoiseConfig,
    rng: &mut R,
) -> Result<f64, PrivacyError> {
    config.validate()?;
    let scale = config.scale();
    let noise = match config.mechanism {
        NoiseMechanism::Laplace => laplace_sample(scale, rng),
        NoiseMechanism::Gaussian => gaussian_sample(scale, rng),
    };
    let noised = value + noise;
    Ok(if config.clamp_non_negative {
        noised.max(0.0)
    } else {
        noised
    })
}

/// Add noise to `value` using the thread-local generator.
pub fn add_noise(value: f64, config: &NoiseConfig) -> Result<f64, PrivacyError> {
    add_noise_with(value, config, &mut rand::rng())
}

/// Budget-aware noise injection.
///
/// Every noised release consumes `config.epsilon` from the purpose's budget
/// first; a rejected budget means no value is produced.
#[derive(Clone)]
pub struct NoiseInjector {
    ledger: Arc<PrivacyBudgetLedger>,
    sink: SharedMetricsSink,
}

impl std::fmt::Debug for NoiseInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseInjector")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl NoiseInjector {
    pub fn new(ledger: Arc<PrivacyBudgetLedger>) -> Self {
        Self {
            ledger,
            sink: noop_sink(),
        }
    }

    pub fn with_metrics(mut self, sink: SharedMetricsSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn ledger(&self) -> &Arc<PrivacyBudgetLedger> {
        &self.ledger
    }

    /// Noise without budget accounting.
    pub fn add_noise(&self, value: f64, config: &NoiseConfig) -> Result<f64, PrivacyError> {
        add_noise(value, config)
    }

    /// Consume budget for `purpose`, then release a noised `value`.
    pub fn release(
        &self,
        purpose: &str,
        value: f64,
        config: &NoiseConfig,
    ) -> Result<f64, PrivacyError> {
        config.validate()?;
        self.ledger.check_and_consume(purpose, config.epsilon)?;
        let noised = add_noise(value, config)?;
        self.sink.increment_counter(
            names::PRIVACY_NOISE_APPLIED,
            1,
            &[("purpose", purpose), ("mechanism", config.mechanism.as_str())],
        );
        Ok(noised)
    }

    /// Release several values under one budget charge of `config.epsilon`
    /// per value. Either all are released or none.
    pub fn release_many(
        &self,
        purpose: &str,
        values: &[f64],
        config: &NoiseConfig,
    ) -> Result<Vec<f64>, PrivacyError> {
        config.validate()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        self.ledger
            .check_and_consume(purpose, config.epsilon * values.len() as f64)?;
        let mut rng = rand::rng();
        let noised = values
            .iter()
            .map(|v| add_noise_with(*v, config, &mut rng))
            .collect::<Result<Vec<_>, _>>()?;
        self.sink.increment_counter(
            names::PRIVACY_NOISE_APPLIED,
            values.len() as u64,
            &[("purpose", purpose), ("mechanism", config.mechanism.as_str())],
        );
        Ok(noised)
    }
}
