//! Records flowing through the privacy pipeline and their invocation context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A flat field → value record.
///
/// Field values are arbitrary JSON; nested objects are treated as opaque
/// values by field-level transforms.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRecord(Map<String, Value>);

impl DataRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Insert or overwrite a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for DataRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for DataRecord {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Shared context of one flow invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowContext {
    /// Processing purpose. Also selects the privacy budget.
    pub purpose: String,
    /// Consents granted by the data subject for this invocation.
    pub consents: BTreeSet<String>,
    /// Roles held by the requesting actor.
    pub roles: BTreeSet<String>,
    pub actor: Option<String>,
    pub correlation_id: Uuid,
}

impl FlowContext {
    /// New context with a fresh correlation id.
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            consents: BTreeSet::new(),
            roles: BTreeSet::new(),
            actor: None,
            correlation_id: Uuid::now_v7(),
        }
    }

    pub fn with_consent(mut self, consent: impl Into<String>) -> Self {
        self.consents.insert(consent.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn has_consent(&self, consent: &str) -> bool {
        self.consents.contains(consent)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_from_value_requires_object() {
        assert!(DataRecord::from_value(json!({"a": 1})).is_some());
        assert!(DataRecord::from_value(json!([1, 2])).is_none());
        assert!(DataRecord::from_value(json!("x")).is_none());
    }

    #[test]
    fn test_record_serializes_transparently() {
        let record = DataRecord::new().with("email", "a@b.edu").with("score", 91);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"email": "a@b.edu", "score": 91})
        );
    }

    #[test]
    fn test_context_builder() {
        let ctx = FlowContext::new("analytics")
            .with_consent("analytics")
            .with_role("instructor")
            .with_actor("u-1");
        assert!(ctx.has_consent("analytics"));
        assert!(!ctx.has_consent("marketing"));
        assert!(ctx.has_role("instructor"));
        assert_eq!(ctx.actor.as_deref(), Some("u-1"));
    }
}
