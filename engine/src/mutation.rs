//! Mutation messages.
//!
//! Changes travel as mutation messages, not direct state writes. The
//! server folds them into storage; clients fold broadcasts of them into
//! their mirrors. Both use the same merge, so both converge.

use crate::{EncodedField, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Message-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationMeta {
    /// Timestamp the originating client stamped the mutation with
    pub timestamp: Timestamp,
}

/// The kind of a write mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    Insert,
    Update,
}

/// An `INSERT` or `UPDATE` carrying encoded fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteMutation {
    /// Target collection
    pub resource: String,
    /// Target record id
    pub resource_id: RecordId,
    /// Encoded fields to fold in
    pub payload: BTreeMap<String, EncodedField>,
    /// Message metadata
    pub meta: MutationMeta,
}

/// A call to a route-declared custom mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCall {
    /// Target collection
    pub resource: String,
    /// Optional target record id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<RecordId>,
    /// Name of the declared mutation
    pub procedure: String,
    /// Validated input payload
    pub input: Value,
}

/// A mutation message.
///
/// Serialized with `procedure` as the tag: `"INSERT"` and `"UPDATE"` are
/// reserved; any other procedure name dispatches to a custom mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "procedure")]
pub enum Mutation {
    #[serde(rename = "INSERT")]
    Insert(WriteMutation),
    #[serde(rename = "UPDATE")]
    Update(WriteMutation),
    #[serde(untagged)]
    Custom(CustomCall),
}

impl Mutation {
    /// The collection this mutation targets.
    pub fn resource(&self) -> &str {
        match self {
            Mutation::Insert(m) | Mutation::Update(m) => &m.resource,
            Mutation::Custom(c) => &c.resource,
        }
    }

    /// The record id this mutation targets, if any.
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Mutation::Insert(m) | Mutation::Update(m) => Some(&m.resource_id),
            Mutation::Custom(c) => c.resource_id.as_deref(),
        }
    }

    /// The procedure name (`INSERT`, `UPDATE`, or the custom name).
    pub fn procedure(&self) -> &str {
        match self {
            Mutation::Insert(_) => "INSERT",
            Mutation::Update(_) => "UPDATE",
            Mutation::Custom(c) => &c.procedure,
        }
    }

    /// The message timestamp, absent for custom calls.
    pub fn timestamp(&self) -> Option<&Timestamp> {
        match self {
            Mutation::Insert(m) | Mutation::Update(m) => Some(&m.meta.timestamp),
            Mutation::Custom(_) => None,
        }
    }

    /// The kind of a write mutation, `None` for custom calls.
    pub fn kind(&self) -> Option<MutationKind> {
        match self {
            Mutation::Insert(_) => Some(MutationKind::Insert),
            Mutation::Update(_) => Some(MutationKind::Update),
            Mutation::Custom(_) => None,
        }
    }
}

impl WriteMutation {
    /// Build a write mutation.
    pub fn new(
        resource: impl Into<String>,
        resource_id: impl Into<RecordId>,
        payload: BTreeMap<String, EncodedField>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            resource: resource.into(),
            resource_id: resource_id.into(),
            payload,
            meta: MutationMeta { timestamp },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> BTreeMap<String, EncodedField> {
        let mut map = BTreeMap::new();
        map.insert(
            "title".to_string(),
            EncodedField::new(json!("hello"), Timestamp::new("T1")),
        );
        map
    }

    #[test]
    fn accessors() {
        let m = Mutation::Insert(WriteMutation::new(
            "cards",
            "c1",
            payload(),
            Timestamp::new("T1"),
        ));
        assert_eq!(m.resource(), "cards");
        assert_eq!(m.resource_id(), Some("c1"));
        assert_eq!(m.procedure(), "INSERT");
        assert_eq!(m.kind(), Some(MutationKind::Insert));
        assert_eq!(m.timestamp(), Some(&Timestamp::new("T1")));
    }

    #[test]
    fn serialization_tags_on_procedure() {
        let m = Mutation::Update(WriteMutation::new(
            "cards",
            "c1",
            payload(),
            Timestamp::new("T2"),
        ));
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"procedure\":\"UPDATE\""));
        assert!(json.contains("\"resourceId\":\"c1\""));
        assert!(json.contains("\"meta\""));

        let parsed: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(m, parsed);
    }

    #[test]
    fn custom_call_roundtrip() {
        let m = Mutation::Custom(CustomCall {
            resource: "cards".to_string(),
            resource_id: Some("c1".to_string()),
            procedure: "archive".to_string(),
            input: json!({"reason": "done"}),
        });

        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"procedure\":\"archive\""));

        let parsed: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(m, parsed);
        assert_eq!(parsed.procedure(), "archive");
        assert_eq!(parsed.kind(), None);
    }

    #[test]
    fn unknown_procedure_parses_as_custom() {
        let json = r#"{
            "resource": "cards",
            "procedure": "reorder",
            "input": {"after": "c9"}
        }"#;
        let parsed: Mutation = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, Mutation::Custom(_)));
        assert_eq!(parsed.resource_id(), None);
    }
}
