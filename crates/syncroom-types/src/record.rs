//! Upstream session records.
//!
//! The host application exchanges flat JSON objects tagged by a `func` field
//! with a third-party service. The engine only inspects `func`; every other
//! field is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no string `func` field")]
    MissingFunc,

    #[error("record `func` is empty")]
    EmptyFunc,

    #[error("record is not valid JSON: {0}")]
    Json(String),
}

/// A single `func`-tagged upstream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct UpstreamRecord {
    func: String,
    fields: Map<String, Value>,
}

impl UpstreamRecord {
    /// Build a record with no fields besides `func`.
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Parse and validate a record from raw JSON text.
    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RecordError::Json(e.to_string()))?;
        Self::try_from(value)
    }

    pub fn to_value(&self) -> Value {
        Value::from(self.clone())
    }
}

impl TryFrom<Value> for UpstreamRecord {
    type Error = RecordError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err(RecordError::NotAnObject);
        };
        let func = match fields.remove("func") {
            Some(Value::String(func)) => func,
            _ => return Err(RecordError::MissingFunc),
        };
        if func.trim().is_empty() {
            return Err(RecordError::EmptyFunc);
        }
        Ok(Self { func, fields })
    }
}

impl From<UpstreamRecord> for Value {
    fn from(record: UpstreamRecord) -> Self {
        let mut map = record.fields;
        map.insert("func".to_string(), Value::String(record.func));
        Value::Object(map)
    }
}

impl std::fmt::Display for UpstreamRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.func)
    }
}
