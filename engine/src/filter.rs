//! Where-clause parsing and evaluation.
//!
//! A where-clause is a nested predicate tree evaluated against the plain
//! (inferred) JSON form of a record. Object shape means conjunction;
//! `$and` / `$or` junctions nest; a key naming a relation recurses into
//! the related record (or existentially over an array of them).

use crate::{error::Result, query::IncludeClause, query::IncludeEntry, Collection, Error, Schema};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const OPERATORS: [&str; 7] = ["$eq", "$in", "$not", "$gt", "$gte", "$lt", "$lte"];

/// A leaf predicate on a single key.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Strict equality (`null` matches only `null`)
    Eq(Value),
    /// Membership in a set of values
    In(Vec<Value>),
    /// Inverts the final boolean at the leaf
    Not(Box<Condition>),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    /// Recursion into a related record's shape
    Nested(WhereClause),
}

/// A where-clause: `$and` / `$or` arms plus per-key conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    pub and: Vec<WhereClause>,
    pub or: Vec<WhereClause>,
    pub fields: BTreeMap<String, Condition>,
}

impl WhereClause {
    /// A clause with a single key condition.
    pub fn field(key: impl Into<String>, condition: Condition) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(key.into(), condition);
        Self {
            fields,
            ..Default::default()
        }
    }

    /// A clause requiring strict equality on a key.
    pub fn eq(key: impl Into<String>, value: Value) -> Self {
        Self::field(key, Condition::Eq(value))
    }

    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty() && self.fields.is_empty()
    }

    /// Conjoin two clauses: `self AND other`.
    pub fn and(self, other: WhereClause) -> WhereClause {
        WhereClause {
            and: vec![self, other],
            ..Default::default()
        }
    }

    /// Shallow-merge of the top-level object, later wins on duplicate
    /// keys (the composition rule for repeated builder `filter` calls).
    pub fn shallow_merge(mut self, later: WhereClause) -> WhereClause {
        if !later.and.is_empty() {
            self.and = later.and;
        }
        if !later.or.is_empty() {
            self.or = later.or;
        }
        self.fields.extend(later.fields);
        self
    }

    /// Evaluate against a record in plain JSON form.
    pub fn matches(&self, record: &Value) -> bool {
        self.eval(record, false)
    }

    /// Evaluate with an explicit negation flag. Negation inverts the
    /// boolean produced at each leaf, not the clause structure, so
    /// existential array semantics are preserved under `$not`.
    pub fn eval(&self, record: &Value, negate: bool) -> bool {
        if let Value::Array(items) = record {
            // existential: at least one element matches
            return items.iter().any(|item| self.eval(item, negate));
        }
        for arm in &self.and {
            if !arm.eval(record, negate) {
                return false;
            }
        }
        if !self.or.is_empty() && !self.or.iter().any(|arm| arm.eval(record, negate)) {
            return false;
        }
        for (key, condition) in &self.fields {
            let value = record.get(key).unwrap_or(&Value::Null);
            if !condition.eval(value, negate) {
                return false;
            }
        }
        true
    }

    /// Keys this clause reads at the top level of the record, descending
    /// through `$and` / `$or` arms. Used to decide cheaply whether a
    /// mutation can have changed the clause's outcome.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        self.collect_fields(&mut keys);
        keys
    }

    fn collect_fields(&self, keys: &mut BTreeSet<String>) {
        for arm in self.and.iter().chain(self.or.iter()) {
            arm.collect_fields(keys);
        }
        keys.extend(self.fields.keys().cloned());
    }

    /// The minimum include tree required to evaluate this clause: every
    /// key naming a relation on `collection` is promoted to an include
    /// entry, nested clauses to a deeper tree. Non-relation keys are
    /// ignored.
    pub fn extract_include(&self, collection: &Collection, schema: &Schema) -> IncludeClause {
        let mut include = IncludeClause::default();
        for arm in self.and.iter().chain(self.or.iter()) {
            include.merge(arm.extract_include(collection, schema));
        }
        for (key, condition) in &self.fields {
            let Some(relation) = collection.relation(key) else {
                continue;
            };
            let entry = match condition {
                Condition::Nested(sub) => match schema.collection(relation.target()) {
                    Ok(target) => {
                        let deeper = sub.extract_include(target, schema);
                        if deeper.is_empty() {
                            IncludeEntry::All
                        } else {
                            IncludeEntry::sub_include(deeper)
                        }
                    }
                    Err(_) => IncludeEntry::All,
                },
                _ => IncludeEntry::All,
            };
            let mut single = IncludeClause::default();
            single.relations.insert(key.clone(), entry);
            include.merge(single);
        }
        include
    }

    /// Parse from the JSON clause shape.
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("where clause must be an object".to_string()))?;
        let mut clause = WhereClause::default();
        for (key, entry) in obj {
            match key.as_str() {
                "$and" => clause.and = parse_arms(entry)?,
                "$or" => clause.or = parse_arms(entry)?,
                _ => {
                    clause.fields.insert(key.clone(), Condition::parse(entry)?);
                }
            }
        }
        Ok(clause)
    }

    /// Serialize back to the JSON clause shape.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if !self.and.is_empty() {
            obj.insert(
                "$and".to_string(),
                Value::Array(self.and.iter().map(WhereClause::to_value).collect()),
            );
        }
        if !self.or.is_empty() {
            obj.insert(
                "$or".to_string(),
                Value::Array(self.or.iter().map(WhereClause::to_value).collect()),
            );
        }
        for (key, condition) in &self.fields {
            obj.insert(key.clone(), condition.to_value());
        }
        Value::Object(obj)
    }
}

fn parse_arms(value: &Value) -> Result<Vec<WhereClause>> {
    value
        .as_array()
        .ok_or_else(|| Error::InvalidQuery("$and/$or requires an array".to_string()))?
        .iter()
        .map(WhereClause::parse)
        .collect()
}

impl Condition {
    fn parse(value: &Value) -> Result<Self> {
        let Some(obj) = value.as_object() else {
            // scalar leaf (including null and arrays): implicit equality
            return Ok(Condition::Eq(value.clone()));
        };
        let has_operator = obj.keys().any(|k| OPERATORS.contains(&k.as_str()));
        if !has_operator {
            // plain object: recurse into a related record's shape
            return Ok(Condition::Nested(WhereClause::parse(value)?));
        }
        if obj.len() != 1 {
            return Err(Error::InvalidQuery(
                "operator object must contain exactly one operator".to_string(),
            ));
        }
        let (op, operand) = obj.iter().next().expect("len checked above");
        match op.as_str() {
            "$eq" => Ok(Condition::Eq(operand.clone())),
            "$in" => operand
                .as_array()
                .map(|items| Condition::In(items.clone()))
                .ok_or_else(|| Error::InvalidQuery("$in requires an array".to_string())),
            "$not" => Ok(Condition::Not(Box::new(Condition::parse(operand)?))),
            "$gt" => numeric_operand(op, operand).map(Condition::Gt),
            "$gte" => numeric_operand(op, operand).map(Condition::Gte),
            "$lt" => numeric_operand(op, operand).map(Condition::Lt),
            "$lte" => numeric_operand(op, operand).map(Condition::Lte),
            other => Err(Error::InvalidQuery(format!("unknown operator {other}"))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            // scalars serialize as the implicit-equality form; objects
            // keep the explicit $eq wrapper so reparsing is unambiguous
            Condition::Eq(value) if !value.is_object() => value.clone(),
            Condition::Eq(value) => operator_object("$eq", value.clone()),
            Condition::In(items) => operator_object("$in", Value::Array(items.clone())),
            Condition::Not(inner) => operator_object("$not", inner.to_value()),
            Condition::Gt(n) => operator_object("$gt", number(*n)),
            Condition::Gte(n) => operator_object("$gte", number(*n)),
            Condition::Lt(n) => operator_object("$lt", number(*n)),
            Condition::Lte(n) => operator_object("$lte", number(*n)),
            Condition::Nested(clause) => clause.to_value(),
        }
    }

    fn eval(&self, value: &Value, negate: bool) -> bool {
        match self {
            Condition::Not(inner) => inner.eval(value, !negate),
            Condition::Nested(clause) => clause.eval(value, negate),
            Condition::Eq(expected) => (value == expected) ^ negate,
            Condition::In(items) => items.contains(value) ^ negate,
            // range operators apply only to numeric record values
            Condition::Gt(n) => value.as_f64().map(|v| v > *n).unwrap_or(false) ^ negate,
            Condition::Gte(n) => value.as_f64().map(|v| v >= *n).unwrap_or(false) ^ negate,
            Condition::Lt(n) => value.as_f64().map(|v| v < *n).unwrap_or(false) ^ negate,
            Condition::Lte(n) => value.as_f64().map(|v| v <= *n).unwrap_or(false) ^ negate,
        }
    }
}

fn numeric_operand(op: &str, operand: &Value) -> Result<f64> {
    operand
        .as_f64()
        .ok_or_else(|| Error::InvalidQuery(format!("{op} requires a number")))
}

fn operator_object(op: &str, operand: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(op.to_string(), operand);
    Value::Object(obj)
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl Serialize for WhereClause {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WhereClause {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        WhereClause::parse(&value).map_err(de::Error::custom)
    }
}

/// Rewrite the literal string `"null"` to JSON `null` at every depth.
///
/// Query-string transports deliver every scalar as a string; this runs
/// over a parsed `where` value before clause parsing so `null` semantics
/// hold inside `$eq`, `$not`, and `$in` as well as at leaves.
pub fn normalize_query_nulls(value: Value) -> Value {
    match value {
        Value::String(s) if s == "null" => Value::Null,
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_query_nulls).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_query_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}
