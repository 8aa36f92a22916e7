use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag set attached to a sample. Ordered so encoded output is deterministic.
pub type Tags = BTreeMap<String, String>;

/// A single decoded register value ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Measurement name (the register field name, e.g. "pressure").
    pub measurement: String,

    /// Merged tags (template, field and device tags).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,

    /// The decoded value.
    pub value: FieldValue,

    /// Unix epoch milliseconds when the poll attempt started.
    pub timestamp: i64,
}

impl Sample {
    /// Create a new sample with no tags.
    pub fn new(measurement: impl Into<String>, value: FieldValue, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Tags::new(),
            value,
            timestamp,
        }
    }

    /// Add a tag to this sample.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Replace the tag set of this sample.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// Typed sample value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Floating point value (f32 registers, or any scaled value).
    Float(f64),

    /// Signed integer value.
    Integer(i64),

    /// Unsigned integer value.
    Unsigned(u64),
}

impl FieldValue {
    /// Numeric value as f64 (lossy for very large integers).
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Float(v) => v,
            FieldValue::Integer(v) => v as f64,
            FieldValue::Unsigned(v) => v as f64,
        }
    }

    /// Whether the value can be stored by the sink (no NaN or infinity).
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Unsigned(v)
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
