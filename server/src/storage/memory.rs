//! In-memory storage adapter.
//!
//! Backs tests and embedded single-process deployments. Transactions
//! take the collection map's writer lock for their whole lifetime and
//! stage writes that publish atomically on commit.

use crate::error::{AppError, Result};
use crate::storage::{filter_and_limit, required_include, Storage, StorageTransaction};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tether_engine::{
    Error as EngineError, FieldValue, IncludeClause, IncludeEntry, Record, RecordId, Related,
    RelationKind, Schema, SubQuery, WhereClause,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Collections = HashMap<String, BTreeMap<RecordId, Record>>;

/// Storage over process-local collection maps.
pub struct MemoryStorage {
    schema: Schema,
    state: Arc<Mutex<Collections>>,
}

impl MemoryStorage {
    pub fn new(schema: Schema) -> Self {
        let state = schema
            .collections()
            .map(|c| (c.name().to_string(), BTreeMap::new()))
            .collect();
        Self {
            schema,
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn raw_find_by_id(
        &self,
        resource: &str,
        id: &str,
        include: Option<&IncludeClause>,
    ) -> Result<Option<Record>> {
        self.schema.collection(resource)?;
        let data = self.state.lock().await;
        let Some(record) = data.get(resource).and_then(|records| records.get(id)) else {
            return Ok(None);
        };
        match include {
            Some(include) => hydrate(&self.schema, &data, resource, record, include).map(Some),
            None => Ok(Some(record.clone())),
        }
    }

    async fn raw_find(
        &self,
        resource: &str,
        filter: Option<&WhereClause>,
        include: Option<&IncludeClause>,
        limit: Option<usize>,
    ) -> Result<BTreeMap<RecordId, Record>> {
        self.schema.collection(resource)?;
        let needed = required_include(&self.schema, resource, filter, include);
        let data = self.state.lock().await;
        let records = data.get(resource).cloned().unwrap_or_default();
        let hydrated = records
            .into_iter()
            .map(|(id, record)| match &needed {
                Some(include) => {
                    hydrate(&self.schema, &data, resource, &record, include).map(|r| (id, r))
                }
                None => Ok((id, record)),
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(filter_and_limit(hydrated, filter, limit))
    }

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            schema: self.schema.clone(),
            guard,
            staged: Vec::new(),
        }))
    }
}

/// Embed related records per the include tree, reading from the locked
/// collection maps. Recursion depth is bounded by the include tree.
fn hydrate(
    schema: &Schema,
    data: &Collections,
    resource: &str,
    record: &Record,
    include: &IncludeClause,
) -> Result<Record> {
    let collection = schema.collection(resource)?;
    let mut out = record.clone();
    for (name, entry) in &include.relations {
        let relation =
            collection
                .relation(name)
                .ok_or_else(|| EngineError::UnknownRelation {
                    collection: resource.to_string(),
                    relation: name.clone(),
                })?;
        let (sub_filter, sub_include, sub_limit) = entry_parts(entry);

        match relation.kind() {
            RelationKind::One => {
                let foreign_key = record
                    .field(relation.column())
                    .and_then(|field| field.value.as_str().map(str::to_string));
                let target = foreign_key
                    .and_then(|fk| data.get(relation.target())?.get(&fk))
                    .map(|rec| match sub_include {
                        Some(include) => hydrate(schema, data, relation.target(), rec, include),
                        None => Ok(rec.clone()),
                    })
                    .transpose()?
                    .filter(|rec| matches(sub_filter, rec));
                out.set_related(name.clone(), Related::One(target.map(Box::new)));
            }
            RelationKind::Many => {
                let mut related = BTreeMap::new();
                let limit = sub_limit.unwrap_or(usize::MAX);
                if let Some(candidates) = data.get(relation.target()) {
                    for (id, rec) in candidates {
                        if !points_back(rec, relation.column(), &record.id) {
                            continue;
                        }
                        let rec = match sub_include {
                            Some(include) => {
                                hydrate(schema, data, relation.target(), rec, include)?
                            }
                            None => rec.clone(),
                        };
                        if matches(sub_filter, &rec) {
                            related.insert(id.clone(), rec);
                            if related.len() >= limit {
                                break;
                            }
                        }
                    }
                }
                out.set_related(name.clone(), Related::Many(related));
            }
        }
    }
    Ok(out)
}

fn entry_parts(entry: &IncludeEntry) -> (Option<&WhereClause>, Option<&IncludeClause>, Option<usize>) {
    match entry {
        IncludeEntry::All => (None, None, None),
        IncludeEntry::Sub(SubQuery {
            filter,
            include,
            limit,
        }) => (filter.as_ref(), include.as_ref(), *limit),
    }
}

fn matches(filter: Option<&WhereClause>, record: &Record) -> bool {
    filter
        .map(|clause| clause.matches(&record.infer()))
        .unwrap_or(true)
}

fn points_back(record: &Record, column: &str, owner_id: &str) -> bool {
    record
        .field(column)
        .and_then(|field| field.value.as_str())
        .map(|value| value == owner_id)
        .unwrap_or(false)
}

/// A staged write set over the held writer lock.
pub struct MemoryTransaction {
    schema: Schema,
    guard: OwnedMutexGuard<Collections>,
    staged: Vec<(String, RecordId, Record)>,
}

impl MemoryTransaction {
    fn lookup(&self, resource: &str, id: &str) -> Option<Record> {
        // staged writes shadow committed state, latest first
        self.staged
            .iter()
            .rev()
            .find(|(res, rid, _)| res == resource && rid == id)
            .map(|(_, _, record)| record.clone())
            .or_else(|| self.guard.get(resource)?.get(id).cloned())
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn raw_find_by_id(&mut self, resource: &str, id: &str) -> Result<Option<Record>> {
        self.schema.collection(resource)?;
        Ok(self.lookup(resource, id))
    }

    async fn raw_insert(&mut self, resource: &str, id: &str, record: &Record) -> Result<Record> {
        self.schema.collection(resource)?;
        if self.lookup(resource, id).is_some() {
            return Err(AppError::Conflict(id.to_string()));
        }
        self.staged
            .push((resource.to_string(), id.to_string(), record.clone()));
        Ok(record.clone())
    }

    async fn raw_update(
        &mut self,
        resource: &str,
        id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Record> {
        self.schema.collection(resource)?;
        let mut current = self
            .lookup(resource, id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        for (name, value) in fields {
            current.set_field(name.clone(), value.clone());
        }
        self.staged
            .push((resource.to_string(), id.to_string(), current.clone()));
        Ok(current)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        for (resource, id, record) in std::mem::take(&mut self.staged) {
            self.guard.entry(resource).or_default().insert(id, record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // staged writes are simply dropped with the lock
        Ok(())
    }
}
