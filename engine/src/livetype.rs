//! LiveType field registers.
//!
//! Every field of a collection is a last-write-wins register: a typed
//! value paired with a timestamp. Decode and merge are idempotent and
//! commutative under "largest timestamp wins", which is what lets peers
//! apply the same set of writes in any order and converge.

use crate::{error::Result, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-field metadata carried alongside the materialized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMeta {
    /// Timestamp of the write that produced the current value
    pub timestamp: Timestamp,
}

/// A materialized field: current value plus its meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    pub value: Value,
    pub meta: FieldMeta,
}

impl FieldValue {
    /// Build a field value from a plain value and timestamp.
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self {
            value,
            meta: FieldMeta { timestamp },
        }
    }

    /// The timestamp of the last accepted write.
    pub fn timestamp(&self) -> &Timestamp {
        &self.meta.timestamp
    }
}

/// A field as it travels on the wire: encoded value plus timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedField {
    pub value: Value,
    pub timestamp: Timestamp,
}

impl EncodedField {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

impl From<&FieldValue> for EncodedField {
    fn from(field: &FieldValue) -> Self {
        Self {
            value: field.value.clone(),
            timestamp: field.meta.timestamp.clone(),
        }
    }
}

/// The closed set of field codecs.
///
/// Each variant defines what plain JSON values the field accepts;
/// encode/decode/merge behavior is shared LWW-register logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LiveType {
    Number,
    Text,
    Boolean,
    /// ISO-8601 date-time string
    Date,
    /// Foreign key into another collection
    Reference,
    /// Wrapper permitting an absent (`null`) value
    Optional { inner: Box<LiveType> },
}

impl std::fmt::Display for LiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveType::Number => write!(f, "number"),
            LiveType::Text => write!(f, "text"),
            LiveType::Boolean => write!(f, "boolean"),
            LiveType::Date => write!(f, "date"),
            LiveType::Reference => write!(f, "reference"),
            LiveType::Optional { inner } => write!(f, "optional<{inner}>"),
        }
    }
}

impl LiveType {
    /// Wrap a type so that `null` becomes a legal value.
    pub fn optional(inner: LiveType) -> Self {
        LiveType::Optional {
            inner: Box::new(inner),
        }
    }

    /// Whether this type permits an absent value.
    pub fn is_optional(&self) -> bool {
        matches!(self, LiveType::Optional { .. })
    }

    /// Type-check a plain JSON value against this codec.
    pub fn validates(&self, value: &Value) -> bool {
        match self {
            LiveType::Number => value.is_number(),
            LiveType::Text => value.is_string(),
            LiveType::Boolean => value.is_boolean(),
            LiveType::Date => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            LiveType::Reference => value.is_string(),
            LiveType::Optional { inner } => value.is_null() || inner.validates(value),
        }
    }

    /// Encode a plain input value into its wire form.
    ///
    /// Deterministic and pure: the same `(input, timestamp)` always yields
    /// the same payload.
    pub fn encode(&self, input: Value, timestamp: Timestamp) -> Result<EncodedField> {
        if !self.validates(&input) {
            return Err(Error::InvalidPayload(format!(
                "value {input} is not a valid {self}"
            )));
        }
        Ok(EncodedField::new(input, timestamp))
    }

    /// Decode a wire payload against an optional prior materialized value.
    ///
    /// Idempotent and commutative: for any set of payloads the final value
    /// depends only on the set, never the arrival order.
    pub fn decode(&self, wire: &EncodedField, prior: Option<&FieldValue>) -> FieldValue {
        let incoming = FieldValue::new(wire.value.clone(), wire.timestamp.clone());
        match prior {
            Some(prior) if !wins(&incoming, prior) => prior.clone(),
            _ => incoming,
        }
    }

    /// Merge an incoming materialized value over a prior one.
    ///
    /// Returns the merged value and whether the incoming write was
    /// accepted. `false` means the write was stale and the prior value
    /// stands untouched.
    pub fn merge(&self, incoming: FieldValue, prior: Option<&FieldValue>) -> (FieldValue, bool) {
        match prior {
            Some(prior) if !wins(&incoming, prior) => (prior.clone(), false),
            _ => (incoming, true),
        }
    }
}

/// Largest timestamp wins; ties resolve by lexicographic comparison of the
/// encoded payload so every peer picks the same winner.
fn wins(incoming: &FieldValue, prior: &FieldValue) -> bool {
    match incoming.meta.timestamp.cmp(&prior.meta.timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => canonical(&incoming.value) > canonical(&prior.value),
        std::cmp::Ordering::Less => false,
    }
}

fn canonical(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
