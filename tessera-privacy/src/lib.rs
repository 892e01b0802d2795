//! TESSERA Privacy
//!
//! Transforms applied to records before they leave a trust boundary:
//! field-level anonymization, PII detection, differential-privacy noise and
//! the per-purpose epsilon ledger that gates noisy releases.

pub mod anonymize;
pub mod budget;
pub mod engine;
pub mod noise;
pub mod pii;

pub use anonymize::{AnonymizationMethod, AnonymizationRule, Anonymizer};
pub use budget::{BudgetGrant, PrivacyBudget, PrivacyBudgetLedger};
pub use engine::PrivacyEngine;
pub use noise::{add_noise, add_noise_with, NoiseConfig, NoiseInjector, NoiseMechanism};
pub use pii::{luhn_valid, DetectionSource, PiiCategory, PiiDetector, PiiMatch, PiiReport};
