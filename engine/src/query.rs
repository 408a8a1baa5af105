//! Query requests, include trees, and the immutable builder.

use crate::{error::Result, Error, WhereClause};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stable 32-bit identifier of a query request.
pub type QueryHash = u32;

/// A sub-query scoping an included relation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQuery {
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<WhereClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<IncludeClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One entry of an include tree: `true` or a sub-query.
#[derive(Debug, Clone, PartialEq)]
pub enum IncludeEntry {
    /// Include shallowly with the default filter
    All,
    /// Include as a scoped sub-query
    Sub(SubQuery),
}

impl IncludeEntry {
    /// A sub-entry carrying only a deeper include tree.
    pub fn sub_include(include: IncludeClause) -> Self {
        IncludeEntry::Sub(SubQuery {
            include: Some(include),
            ..Default::default()
        })
    }

    /// Deep-merge with a later entry: a sub-query always outranks `All`;
    /// two sub-queries merge field-wise with the later side winning.
    fn merge(self, later: IncludeEntry) -> IncludeEntry {
        match (self, later) {
            (IncludeEntry::All, IncludeEntry::All) => IncludeEntry::All,
            (IncludeEntry::All, sub @ IncludeEntry::Sub(_))
            | (sub @ IncludeEntry::Sub(_), IncludeEntry::All) => sub,
            (IncludeEntry::Sub(a), IncludeEntry::Sub(b)) => IncludeEntry::Sub(SubQuery {
                filter: match (a.filter, b.filter) {
                    (Some(x), Some(y)) => Some(x.shallow_merge(y)),
                    (x, y) => y.or(x),
                },
                include: match (a.include, b.include) {
                    (Some(mut x), Some(y)) => {
                        x.merge(y);
                        Some(x)
                    }
                    (x, y) => y.or(x),
                },
                limit: b.limit.or(a.limit),
            }),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            IncludeEntry::All => Value::Bool(true),
            IncludeEntry::Sub(sub) => serde_json::to_value(sub).unwrap_or(Value::Bool(true)),
        }
    }

    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(true) => Ok(IncludeEntry::All),
            Value::Object(_) => serde_json::from_value(value.clone())
                .map(IncludeEntry::Sub)
                .map_err(|e| Error::InvalidQuery(format!("invalid include entry: {e}"))),
            other => Err(Error::InvalidQuery(format!(
                "include entry must be true or an object, got {other}"
            ))),
        }
    }
}

/// A tree paralleling the relation graph, naming what to embed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncludeClause {
    pub relations: BTreeMap<String, IncludeEntry>,
}

impl IncludeClause {
    /// An include tree with a single shallow relation.
    pub fn relation(name: impl Into<String>) -> Self {
        let mut relations = BTreeMap::new();
        relations.insert(name.into(), IncludeEntry::All);
        Self { relations }
    }

    /// An include tree with a single sub-query relation.
    pub fn relation_sub(name: impl Into<String>, sub: SubQuery) -> Self {
        let mut relations = BTreeMap::new();
        relations.insert(name.into(), IncludeEntry::Sub(sub));
        Self { relations }
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Deep-merge another include tree into this one.
    pub fn merge(&mut self, other: IncludeClause) {
        for (name, entry) in other.relations {
            let merged = match self.relations.remove(&name) {
                Some(existing) => existing.merge(entry),
                None => entry,
            };
            self.relations.insert(name, merged);
        }
    }

    fn to_value(&self) -> Value {
        Value::Object(
            self.relations
                .iter()
                .map(|(name, entry)| (name.clone(), entry.to_value()))
                .collect(),
        )
    }

    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("include clause must be an object".to_string()))?;
        let mut relations = BTreeMap::new();
        for (name, entry) in obj {
            relations.insert(name.clone(), IncludeEntry::parse(entry)?);
        }
        Ok(Self { relations })
    }
}

impl Serialize for IncludeClause {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IncludeClause {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        IncludeClause::parse(&value).map_err(de::Error::custom)
    }
}

/// A query request: `{resource, where, include, limit}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub resource: String,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<WhereClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<IncludeClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryRequest {
    /// A bare query for a whole collection.
    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filter: None,
            include: None,
            limit: None,
        }
    }

    /// Stable identifier: xxh3 of the canonical JSON form, truncated to
    /// 32 bits. Canonical because every map in the request serializes
    /// with sorted keys.
    pub fn hash(&self) -> QueryHash {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        xxhash_rust::xxh3::xxh3_64(&canonical) as QueryHash
    }
}

/// Immutable builder composing query requests.
///
/// Every method returns a fresh builder; the receiver is never changed.
/// Repeated `filter` calls shallow-merge (later wins on duplicate
/// top-level keys), `include` calls deep-merge, `limit` replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    request: QueryRequest,
}

impl QueryBuilder {
    /// Start a builder for a collection.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            request: QueryRequest::resource(resource),
        }
    }

    /// Compose a where-clause into the query.
    pub fn filter(&self, clause: WhereClause) -> Self {
        let mut next = self.clone();
        next.request.filter = Some(match next.request.filter.take() {
            Some(current) => current.shallow_merge(clause),
            None => clause,
        });
        next
    }

    /// Compose an include tree into the query.
    pub fn include(&self, include: IncludeClause) -> Self {
        let mut next = self.clone();
        next.request.include = Some(match next.request.include.take() {
            Some(mut current) => {
                current.merge(include);
                current
            }
            None => include,
        });
        next
    }

    /// Replace the result limit.
    pub fn limit(&self, limit: usize) -> Self {
        let mut next = self.clone();
        next.request.limit = Some(limit);
        next
    }

    /// Compose with another builder for the same resource; the other
    /// builder's clauses are applied after this one's.
    pub fn merge(&self, other: &QueryBuilder) -> Self {
        let mut next = self.clone();
        if let Some(filter) = other.request.filter.clone() {
            next = next.filter(filter);
        }
        if let Some(include) = other.request.include.clone() {
            next = next.include(include);
        }
        if let Some(limit) = other.request.limit {
            next = next.limit(limit);
        }
        next
    }

    /// The composed request.
    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Clone out the composed request.
    pub fn build(&self) -> QueryRequest {
        self.request.clone()
    }

    /// Stable identifier of the composed request.
    pub fn hash(&self) -> QueryHash {
        self.request.hash()
    }
}
