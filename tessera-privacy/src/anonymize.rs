//! Field-level anonymization rules.
//!
//! Every rule reads the *input* record and writes the output record, so the
//! result does not depend on rule order. Two rules for the same field are
//! rejected up front.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Datelike, NaiveDate};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tessera_core::{DataRecord, PrivacyConfig, PrivacyError};

type HmacSha256 = Hmac<Sha256>;

/// Bucket used by `generalize` for numbers when no `bucket` is given.
pub const DEFAULT_NUMERIC_BUCKET: f64 = 10.0;

/// How a field is transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymizationMethod {
    /// SHA-256, hex encoded.
    Hash,
    /// Replace with the placeholder.
    Redact,
    /// Reduce precision (IP prefix, numeric bucket, date precision, prefix).
    Generalize,
    /// Remove the field.
    Suppress,
    /// Keyed HMAC-SHA256, hex encoded.
    Pseudonymize,
}

/// Date precision for `generalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
}

impl DatePrecision {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "year" => Some(DatePrecision::Year),
            "month" => Some(DatePrecision::Month),
            "day" => Some(DatePrecision::Day),
            _ => None,
        }
    }
}

/// One field transform.
///
/// Recognised parameters:
///
/// | method       | parameter     | meaning                                  |
/// |--------------|---------------|------------------------------------------|
/// | hash         | `salt`        | string prepended before hashing          |
/// | redact       | `placeholder` | overrides the configured placeholder     |
/// | generalize   | `bucket`      | round numbers to the nearest multiple    |
/// | generalize   | `precision`   | `year`, `month` or `day` for dates       |
/// | generalize   | `keep_prefix` | keep N leading characters, mask the rest |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizationRule {
    pub field: String,
    pub method: AnonymizationMethod,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl AnonymizationRule {
    pub fn new(field: impl Into<String>, method: AnonymizationMethod) -> Self {
        Self {
            field: field.into(),
            method,
            parameters: BTreeMap::new(),
        }
    }

    pub fn hash(field: impl Into<String>) -> Self {
        Self::new(field, AnonymizationMethod::Hash)
    }

    pub fn redact(field: impl Into<String>) -> Self {
        Self::new(field, AnonymizationMethod::Redact)
    }

    pub fn generalize(field: impl Into<String>) -> Self {
        Self::new(field, AnonymizationMethod::Generalize)
    }

    pub fn suppress(field: impl Into<String>) -> Self {
        Self::new(field, AnonymizationMethod::Suppress)
    }

    pub fn pseudonymize(field: impl Into<String>) -> Self {
        Self::new(field, AnonymizationMethod::Pseudonymize)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> PrivacyError {
        PrivacyError::InvalidRule {
            field: self.field.clone(),
            reason: reason.into(),
        }
    }

    fn str_param(&self, name: &str) -> Result<Option<&str>, PrivacyError> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.invalid(format!("{} must be a string, got {}", name, other))),
        }
    }

    fn bucket(&self) -> Result<Option<f64>, PrivacyError> {
        match self.parameters.get("bucket") {
            None => Ok(None),
            Some(value) => match value.as_f64() {
                Some(b) if b.is_finite() && b > 0.0 => Ok(Some(b)),
                _ => Err(self.invalid(format!("bucket must be a positive number, got {}", value))),
            },
        }
    }

    fn precision(&self) -> Result<Option<DatePrecision>, PrivacyError> {
        match self.str_param("precision")? {
            None => Ok(None),
            Some(raw) => DatePrecision::parse(raw)
                .map(Some)
                .ok_or_else(|| self.invalid(format!("unknown precision {:?}", raw))),
        }
    }

    fn keep_prefix(&self) -> Result<Option<usize>, PrivacyError> {
        match self.parameters.get("keep_prefix") {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| {
                    self.invalid(format!(
                        "keep_prefix must be a non-negative integer, got {}",
                        value
                    ))
                }),
        }
    }

    /// Check the parameters this rule's method understands.
    pub fn validate(&self) -> Result<(), PrivacyError> {
        if self.field.trim().is_empty() {
            return Err(self.invalid("field name is empty"));
        }
        match self.method {
            AnonymizationMethod::Hash => {
                self.str_param("salt")?;
            }
            AnonymizationMethod::Redact => {
                self.str_param("placeholder")?;
            }
            AnonymizationMethod::Generalize => {
                self.bucket()?;
                self.precision()?;
                self.keep_prefix()?;
            }
            AnonymizationMethod::Suppress | AnonymizationMethod::Pseudonymize => {}
        }
        Ok(())
    }
}

/// Applies [`AnonymizationRule`]s to records.
#[derive(Clone)]
pub struct Anonymizer {
    placeholder: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anonymizer")
            .field("placeholder", &self.placeholder)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Anonymizer {
    pub fn new(placeholder: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            placeholder: placeholder.into(),
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn from_config(config: &PrivacyConfig) -> Self {
        Self::new(&config.redaction_placeholder, config.pseudonym_secret.as_bytes())
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Validate a rule set: every rule well-formed, at most one rule per field.
    pub fn validate_rules(rules: &[AnonymizationRule]) -> Result<(), PrivacyError> {
        let mut seen = HashSet::new();
        for rule in rules {
            rule.validate()?;
            if !seen.insert(rule.field.as_str()) {
                return Err(rule.invalid("more than one rule targets this field"));
            }
        }
        Ok(())
    }

    /// Transform `record` according to `rules`. Fields without a rule pass
    /// through unchanged; rules for absent fields are ignored.
    pub fn apply(
        &self,
        record: &DataRecord,
        rules: &[AnonymizationRule],
    ) -> Result<DataRecord, PrivacyError> {
        Self::validate_rules(rules)?;
        let mut output = record.clone();
        for rule in rules {
            let Some(original) = record.get(&rule.field) else {
                continue;
            };
            match self.transform(rule, original)? {
                Some(value) => {
                    output.insert(rule.field.clone(), value);
                }
                None => {
                    output.remove(&rule.field);
                }
            }
        }
        Ok(output)
    }

    /// Transform one value. `None` means the field is removed.
    pub fn transform(
        &self,
        rule: &AnonymizationRule,
        value: &Value,
    ) -> Result<Option<Value>, PrivacyError> {
        let transformed = match rule.method {
            AnonymizationMethod::Hash => {
                let salt = rule.str_param("salt")?.unwrap_or("");
                Value::String(sha256_hex(salt, &canonical(value)))
            }
            AnonymizationMethod::Redact => {
                let placeholder = rule.str_param("placeholder")?.unwrap_or(&self.placeholder);
                Value::String(placeholder.to_string())
            }
            AnonymizationMethod::Generalize => self.generalize(rule, value)?,
            AnonymizationMethod::Suppress => return Ok(None),
            AnonymizationMethod::Pseudonymize => Value::String(self.pseudonym(&canonical(value))),
        };
        Ok(Some(transformed))
    }

    /// Keyed pseudonym for a raw string.
    pub fn pseudonym(&self, input: &str) -> String {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mut mac) => {
                mac.update(input.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Err(_) => sha256_hex(&String::from_utf8_lossy(&self.secret), input),
        }
    }

    fn generalize(&self, rule: &AnonymizationRule, value: &Value) -> Result<Value, PrivacyError> {
        if let Some(number) = value.as_f64() {
            let bucket = rule.bucket()?.unwrap_or(DEFAULT_NUMERIC_BUCKET);
            return Ok(round_to_bucket(number, bucket, value.is_i64() || value.is_u64()));
        }

        let Value::String(text) = value else {
            tracing::debug!(field = %rule.field, "Generalize has no shape for value; redacting");
            return Ok(Value::String(self.placeholder.clone()));
        };

        if let Some(precision) = rule.precision()? {
            if let Some(date) = parse_date(text) {
                return Ok(Value::String(truncate_date(date, precision)));
            }
        }
        if let Some(keep) = rule.keep_prefix()? {
            return Ok(Value::String(mask_after(text, keep)));
        }
        if let Ok(ip) = text.parse::<IpAddr>() {
            return Ok(Value::String(generalize_ip(ip)));
        }
        if let Some(date) = parse_date(text) {
            return Ok(Value::String(truncate_date(date, DatePrecision::Year)));
        }

        tracing::debug!(field = %rule.field, "Generalize has no shape for value; redacting");
        Ok(Value::String(self.placeholder.clone()))
    }
}

/// Text form of a value used as hash input: strings raw, everything else JSON.
fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sha256_hex(salt: &str, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn round_to_bucket(number: f64, bucket: f64, integral: bool) -> Value {
    let rounded = (number / bucket).round() * bucket;
    if integral && rounded.fract() == 0.0 && rounded.abs() < i64::MAX as f64 {
        Value::from(rounded as i64)
    } else {
        serde_json::Number::from_f64(rounded)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn generalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            Ipv4Addr::new(a, b, c, 0).to_string()
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            Ipv6Addr::new(s[0], s[1], s[2], 0, 0, 0, 0, 0).to_string()
        }
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

fn truncate_date(date: NaiveDate, precision: DatePrecision) -> String {
    match precision {
        DatePrecision::Year => format!("{:04}", date.year()),
        DatePrecision::Month => format!("{:04}-{:02}", date.year(), date.month()),
        DatePrecision::Day => date.format("%Y-%m-%d").to_string(),
    }
}

fn mask_after(text: &str, keep: usize) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| if i < keep { c } else { '*' })
        .collect()
}
