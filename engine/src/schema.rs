//! Schema definition and whole-record merge.
//!
//! A schema names the collections, their fields, and the relations
//! between them. It is constructed once at program start and shared by
//! every subsystem that needs to interpret records.

use crate::{
    error::Result, EncodedField, Error, FieldValue, LiveType, MutationKind, Record, RecordId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// At most one target record per owner
    One,
    /// Any number of target records per owner
    Many,
}

/// A directed relation from the declaring collection to a target.
///
/// Relations are declared on both ends; each side names the column that
/// holds the foreign key. For a `one` relation the key lives on the
/// declaring collection, for a `many` relation it lives on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    name: String,
    target: String,
    kind: RelationKind,
    column: String,
}

impl Relation {
    /// Declare a `one` relation. The foreign key column on the declaring
    /// collection defaults to `<name>Id`.
    pub fn one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        let column = format!("{name}Id");
        Self {
            name,
            target: target.into(),
            kind: RelationKind::One,
            column,
        }
    }

    /// Declare a `many` relation. `column` is the foreign key column on
    /// the target collection pointing back at the declaring one.
    pub fn many(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::Many,
            column: column.into(),
        }
    }

    /// Override the foreign key column.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// The column holding the foreign key (on the owner for `one`, on the
    /// target for `many`).
    pub fn column(&self) -> &str {
        &self.column
    }
}

/// A named collection of records: row schema and relation adjacency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    name: String,
    fields: BTreeMap<String, LiveType>,
    relations: BTreeMap<String, Relation>,
}

impl Collection {
    /// Start a collection definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, ty: LiveType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    /// Add a relation.
    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.insert(relation.name.clone(), relation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field map, including `id`.
    pub fn fields(&self) -> &BTreeMap<String, LiveType> {
        &self.fields
    }

    /// Look up the codec for a field.
    pub fn live_type(&self, field: &str) -> Option<&LiveType> {
        self.fields.get(field)
    }

    /// Look up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// The relation adjacency list.
    pub fn relations(&self) -> &BTreeMap<String, Relation> {
        &self.relations
    }

    fn validate(&self) -> Result<()> {
        if !is_ident(&self.name) {
            return Err(Error::InvalidSchema(format!(
                "collection name '{}' is not a valid identifier",
                self.name
            )));
        }
        for name in self.fields.keys().chain(self.relations.keys()) {
            if !is_ident(name) {
                return Err(Error::InvalidSchema(format!(
                    "name '{name}' on collection '{}' is not a valid identifier",
                    self.name
                )));
            }
        }
        match self.fields.get("id") {
            Some(LiveType::Text) => Ok(()),
            Some(other) => Err(Error::InvalidSchema(format!(
                "collection '{}' declares id as {other}, expected text",
                self.name
            ))),
            None => Err(Error::InvalidSchema(format!(
                "collection '{}' is missing an id field",
                self.name
            ))),
        }
    }
}

fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The full schema: every collection, indexed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    collections: HashMap<String, Collection>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection, validating its shape (identifier names, an `id`
    /// text field).
    pub fn with_collection(mut self, collection: Collection) -> Result<Self> {
        collection.validate()?;
        self.collections
            .insert(collection.name.clone(), collection);
        Ok(self)
    }

    /// Look up a collection.
    pub fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Whether a collection exists.
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Iterate collections in name order (deterministic).
    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        let mut all: Vec<_> = self.collections.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all.into_iter()
    }

    /// Check every relation points at a declared collection. Run once
    /// after construction; relations may legally form cycles.
    pub fn validate_relations(&self) -> Result<()> {
        for collection in self.collections.values() {
            for relation in collection.relations.values() {
                if !self.collections.contains_key(&relation.target) {
                    return Err(Error::InvalidSchema(format!(
                        "relation '{}' on '{}' targets unknown collection '{}'",
                        relation.name, collection.name, relation.target
                    )));
                }
            }
        }
        Ok(())
    }

    /// A stable fingerprint of the schema shape, used to guard snapshot
    /// imports.
    pub fn fingerprint(&self) -> u32 {
        let mut shape: Vec<_> = self
            .collections
            .values()
            .map(|c| serde_json::to_string(c).unwrap_or_default())
            .collect();
        shape.sort();
        xxhash_rust::xxh3::xxh3_64(shape.join("\n").as_bytes()) as u32
    }

    /// Fold a mutation's encoded fields into a record.
    ///
    /// For [`MutationKind::Insert`] the target must be absent and every
    /// input field decodes into a fresh record. For
    /// [`MutationKind::Update`] each input field merges against the
    /// target under field-level LWW; omitted fields are preserved
    /// verbatim.
    ///
    /// Returns the merged record and the map of fields actually written;
    /// `None` means every input field was stale and nothing changed.
    pub fn merge_mutation(
        &self,
        resource: &str,
        kind: MutationKind,
        input: &BTreeMap<String, EncodedField>,
        target: Option<&Record>,
    ) -> Result<(Record, Option<BTreeMap<String, FieldValue>>)> {
        let collection = self.collection(resource)?;
        match kind {
            MutationKind::Insert => {
                if target.is_some() {
                    return Err(Error::InvalidPayload(
                        "insert cannot target an existing record".to_string(),
                    ));
                }
                let id = insert_id(input)?;
                let mut record = Record::new(id);
                let mut accepted = BTreeMap::new();
                for (name, wire) in input {
                    let ty = field_type(collection, name)?;
                    check_type(ty, name, &wire.value)?;
                    let value = ty.decode(wire, None);
                    record.set_field(name.clone(), value.clone());
                    accepted.insert(name.clone(), value);
                }
                Ok((record, Some(accepted)))
            }
            MutationKind::Update => {
                let target = target.ok_or_else(|| {
                    Error::InvalidPayload("update requires an existing record".to_string())
                })?;
                let mut merged = target.clone();
                let mut accepted = BTreeMap::new();
                for (name, wire) in input {
                    let ty = field_type(collection, name)?;
                    check_type(ty, name, &wire.value)?;
                    let incoming = FieldValue::new(wire.value.clone(), wire.timestamp.clone());
                    let (value, written) = ty.merge(incoming, merged.field(name));
                    if written {
                        merged.set_field(name.clone(), value.clone());
                        accepted.insert(name.clone(), value);
                    }
                }
                let accepted = (!accepted.is_empty()).then_some(accepted);
                Ok((merged, accepted))
            }
        }
    }
}

fn insert_id(input: &BTreeMap<String, EncodedField>) -> Result<RecordId> {
    let field = input
        .get("id")
        .ok_or_else(|| Error::MissingField("id".to_string()))?;
    field
        .value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::TypeMismatch {
            field: "id".to_string(),
            expected: "text".to_string(),
            got: json_type_name(&field.value).to_string(),
        })
}

fn field_type<'a>(collection: &'a Collection, name: &str) -> Result<&'a LiveType> {
    collection
        .live_type(name)
        .ok_or_else(|| Error::UnknownField {
            collection: collection.name().to_string(),
            field: name.to_string(),
        })
}

fn check_type(ty: &LiveType, name: &str, value: &Value) -> Result<()> {
    if ty.validates(value) {
        Ok(())
    } else {
        Err(Error::TypeMismatch {
            field: name.to_string(),
            expected: ty.to_string(),
            got: json_type_name(value).to_string(),
        })
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate a custom-mutation input against its declared field types.
///
/// Unknown keys are ignored; declared non-optional fields must be
/// present and non-null.
pub fn validate_input(fields: &BTreeMap<String, LiveType>, input: &Value) -> Result<()> {
    let obj = input
        .as_object()
        .ok_or_else(|| Error::InvalidPayload("input must be an object".to_string()))?;
    for (name, ty) in fields {
        match obj.get(name) {
            None | Some(Value::Null) if !ty.is_optional() => {
                return Err(Error::MissingField(name.clone()));
            }
            Some(value) => check_type(ty, name, value)?,
            None => {}
        }
    }
    Ok(())
}
