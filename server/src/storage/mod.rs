//! Storage interface and adapters.
//!
//! Storage is the only writer of committed state. Routes read through
//! `raw_find*` and write only inside a transaction obtained from
//! [`Storage::begin`]. Dropping a transaction without committing
//! discards every staged write.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tether_engine::{FieldValue, IncludeClause, Record, RecordId, Schema, WhereClause};

/// Relational persistence for materialized records.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch one record, hydrating the given include tree.
    async fn raw_find_by_id(
        &self,
        resource: &str,
        id: &str,
        include: Option<&IncludeClause>,
    ) -> Result<Option<Record>>;

    /// Fetch records matching a where-clause, relations embedded when
    /// included. Relations the clause itself reaches through are
    /// hydrated as well so evaluation can see them.
    async fn raw_find(
        &self,
        resource: &str,
        filter: Option<&WhereClause>,
        include: Option<&IncludeClause>,
        limit: Option<usize>,
    ) -> Result<BTreeMap<RecordId, Record>>;

    /// Open a single-writer, read-committed transaction.
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>>;
}

/// A transactional handle shadowing the top-level operations.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn raw_find_by_id(&mut self, resource: &str, id: &str) -> Result<Option<Record>>;

    /// Insert a new record. Fails if the id already exists.
    async fn raw_insert(&mut self, resource: &str, id: &str, record: &Record) -> Result<Record>;

    /// Write the given fields onto an existing record.
    async fn raw_update(
        &mut self,
        resource: &str,
        id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Record>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The include tree a find actually needs: what the caller asked for
/// merged with what the where-clause reaches through.
pub(crate) fn required_include(
    schema: &Schema,
    resource: &str,
    filter: Option<&WhereClause>,
    include: Option<&IncludeClause>,
) -> Option<IncludeClause> {
    let mut needed = include.cloned().unwrap_or_default();
    if let (Some(filter), Ok(collection)) = (filter, schema.collection(resource)) {
        needed.merge(filter.extract_include(collection, schema));
    }
    (!needed.is_empty()).then_some(needed)
}

/// Evaluate the where-clause over hydrated records and apply the limit.
/// Iteration is in id order, so limits are deterministic.
pub(crate) fn filter_and_limit(
    records: BTreeMap<RecordId, Record>,
    filter: Option<&WhereClause>,
    limit: Option<usize>,
) -> BTreeMap<RecordId, Record> {
    records
        .into_iter()
        .filter(|(_, record)| {
            filter
                .map(|clause| clause.matches(&record.infer()))
                .unwrap_or(true)
        })
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
