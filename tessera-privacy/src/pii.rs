//! Personally identifiable information detection.
//!
//! Values are scanned with regular expressions (strings nested in arrays or
//! objects included); field names are checked against a list of hints.
//! Payment card candidates must pass the Luhn check.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::DataRecord;

use crate::anonymize::AnonymizationRule;

/// Kind of personal data found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiCategory {
    Email,
    Phone,
    IpAddress,
    NationalId,
    PaymentCard,
    DateOfBirth,
    Address,
    Name,
}

impl PiiCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiCategory::Email => "email",
            PiiCategory::Phone => "phone",
            PiiCategory::IpAddress => "ip_address",
            PiiCategory::NationalId => "national_id",
            PiiCategory::PaymentCard => "payment_card",
            PiiCategory::DateOfBirth => "date_of_birth",
            PiiCategory::Address => "address",
            PiiCategory::Name => "name",
        }
    }

    /// Default transform for a field holding this kind of data.
    pub fn default_rule(&self, field: &str) -> AnonymizationRule {
        match self {
            PiiCategory::Email | PiiCategory::Name => AnonymizationRule::pseudonymize(field),
            PiiCategory::IpAddress => AnonymizationRule::generalize(field),
            PiiCategory::DateOfBirth => {
                AnonymizationRule::generalize(field).with_param("precision", "year")
            }
            PiiCategory::Phone | PiiCategory::Address => AnonymizationRule::redact(field),
            PiiCategory::NationalId | PiiCategory::PaymentCard => {
                AnonymizationRule::suppress(field)
            }
        }
    }
}

impl std::fmt::Display for PiiCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Value,
    FieldName,
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PiiMatch {
    pub field: String,
    pub category: PiiCategory,
    pub source: DetectionSource,
}

/// All findings for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiReport {
    pub matches: Vec<PiiMatch>,
}

impl PiiReport {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Distinct fields with at least one finding, sorted.
    pub fn fields(&self) -> Vec<String> {
        self.matches
            .iter()
            .map(|m| m.field.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn categories(&self) -> BTreeSet<PiiCategory> {
        self.matches.iter().map(|m| m.category).collect()
    }

    /// One default rule per flagged field, using the field's first category.
    pub fn suggested_rules(&self) -> Vec<AnonymizationRule> {
        let mut seen = BTreeSet::new();
        self.matches
            .iter()
            .filter(|m| seen.insert(m.field.clone()))
            .map(|m| m.category.default_rule(&m.field))
            .collect()
    }
}

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("Invalid email regex")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\d])(?:\+?1[\s.-]?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}(?:[^\d]|$)")
        .expect("Invalid phone regex")
});

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
        .expect("Invalid IPv4 regex")
});

static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("Invalid SSN regex"));

static CARD_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("Invalid card regex"));

// First match wins, so more specific hints come first.
const FIELD_HINTS: &[(&str, PiiCategory)] = &[
    ("ip_address", PiiCategory::IpAddress),
    ("card_number", PiiCategory::PaymentCard),
    ("email", PiiCategory::Email),
    ("e_mail", PiiCategory::Email),
    ("phone", PiiCategory::Phone),
    ("mobile", PiiCategory::Phone),
    ("ssn", PiiCategory::NationalId),
    ("social_security", PiiCategory::NationalId),
    ("national_id", PiiCategory::NationalId),
    ("dob", PiiCategory::DateOfBirth),
    ("birth", PiiCategory::DateOfBirth),
    ("address", PiiCategory::Address),
    ("street", PiiCategory::Address),
    ("postal", PiiCategory::Address),
    ("zip", PiiCategory::Address),
    ("first_name", PiiCategory::Name),
    ("last_name", PiiCategory::Name),
    ("full_name", PiiCategory::Name),
    ("surname", PiiCategory::Name),
];

/// Regex and field-name based PII detector.
#[derive(Debug, Clone)]
pub struct PiiDetector {
    use_field_hints: bool,
    ignored_fields: BTreeSet<String>,
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self {
            use_field_hints: true,
            ignored_fields: BTreeSet::new(),
        }
    }
}

impl PiiDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only scan values; ignore field names.
    pub fn values_only(mut self) -> Self {
        self.use_field_hints = false;
        self
    }

    /// Never report `field`.
    pub fn ignore_field(mut self, field: impl Into<String>) -> Self {
        self.ignored_fields.insert(field.into());
        self
    }

    pub fn detect(&self, record: &DataRecord) -> PiiReport {
        let mut matches = BTreeSet::new();
        for (field, value) in record.fields() {
            if self.ignored_fields.contains(field) {
                continue;
            }
            if self.use_field_hints {
                if let Some(category) = hint_for(field) {
                    matches.insert(PiiMatch {
                        field: field.clone(),
                        category,
                        source: DetectionSource::FieldName,
                    });
                }
            }
            let mut found = BTreeSet::new();
            scan_value(value, &mut found);
            for category in found {
                matches.insert(PiiMatch {
                    field: field.clone(),
                    category,
                    source: DetectionSource::Value,
                });
            }
        }
        PiiReport {
            matches: matches.into_iter().collect(),
        }
    }

    /// Categories present in a free-text string.
    pub fn scan_text(&self, text: &str) -> BTreeSet<PiiCategory> {
        let mut found = BTreeSet::new();
        scan_str(text, &mut found);
        found
    }
}

fn hint_for(field: &str) -> Option<PiiCategory> {
    let lowered = field.to_ascii_lowercase();
    FIELD_HINTS
        .iter()
        .find(|(hint, _)| lowered.contains(hint))
        .map(|(_, category)| *category)
}

fn scan_value(value: &Value, found: &mut BTreeSet<PiiCategory>) {
    match value {
        Value::String(s) => scan_str(s, found),
        Value::Array(items) => items.iter().for_each(|v| scan_value(v, found)),
        Value::Object(map) => map.values().for_each(|v| scan_value(v, found)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn scan_str(text: &str, found: &mut BTreeSet<PiiCategory>) {
    if EMAIL.is_match(text) {
        found.insert(PiiCategory::Email);
    }
    if SSN.is_match(text) {
        found.insert(PiiCategory::NationalId);
    }
    if IPV4.is_match(text) {
        found.insert(PiiCategory::IpAddress);
    }
    let has_card = CARD_CANDIDATE
        .find_iter(text)
        .any(|m| luhn_valid(m.as_str()));
    if has_card {
        found.insert(PiiCategory::PaymentCard);
    } else if PHONE.is_match(text) && !SSN.is_match(text) && !IPV4.is_match(text) {
        found.insert(PiiCategory::Phone);
    }
}

/// Luhn checksum over the digits of `candidate` (separators ignored).
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
