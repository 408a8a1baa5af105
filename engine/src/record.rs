//! Materialized records.

use crate::{FieldValue, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Related records embedded into a record by an include tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Related {
    /// At most one target record (`one` relation)
    One(Option<Box<Record>>),
    /// Target records keyed by id (`many` relation)
    Many(BTreeMap<RecordId, Record>),
}

/// A materialized record: id plus per-field values with their meta.
///
/// Fields and relations live in BTreeMaps so serialization is
/// deterministic - query hashing and snapshot comparison depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Authoritative identity of the record
    pub id: RecordId,
    /// Field name to materialized value
    pub fields: BTreeMap<String, FieldValue>,
    /// Relation name to embedded target records, present only when a
    /// query included them
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub related: BTreeMap<String, Related>,
}

impl Record {
    /// Create an empty record with the given id.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            related: BTreeMap::new(),
        }
    }

    /// Get a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Set a field, replacing any existing value.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Embed related records under a relation name.
    pub fn set_related(&mut self, relation: impl Into<String>, related: Related) {
        self.related.insert(relation.into(), related);
    }

    /// Flatten to plain JSON: field values without meta, with embedded
    /// relations inlined (objects for `one`, arrays for `many`).
    ///
    /// This is the shape where-clauses and authorization policies
    /// evaluate against.
    pub fn infer(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        for (name, field) in &self.fields {
            out.insert(name.clone(), field.value.clone());
        }
        for (name, related) in &self.related {
            let value = match related {
                Related::One(Some(record)) => record.infer(),
                Related::One(None) => Value::Null,
                Related::Many(records) => {
                    Value::Array(records.values().map(Record::infer).collect())
                }
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }
}
