//! PostgreSQL storage adapter.
//!
//! One table per collection: `id TEXT PRIMARY KEY` plus a
//! `"<field>_value" JSONB` / `"<field>_meta" TEXT` pair per non-id
//! field. The table layout is derived from the schema at boot, so no
//! migration files exist; field and collection names are validated
//! identifiers, which keeps the generated SQL well-formed.

use crate::error::{AppError, Result};
use crate::storage::{filter_and_limit, required_include, Storage, StorageTransaction};
use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;
use tether_engine::{
    Collection, Error as EngineError, FieldValue, IncludeClause, IncludeEntry, Record, RecordId,
    Related, RelationKind, Schema, SubQuery, Timestamp, WhereClause,
};

/// Storage over a PostgreSQL pool.
pub struct PostgresStorage {
    pool: PgPool,
    schema: Schema,
}

impl PostgresStorage {
    /// Connect a pool for the given schema.
    pub async fn connect(database_url: &str, schema: Schema) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool, schema })
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create any missing collection tables.
    pub async fn ensure_tables(&self) -> Result<()> {
        for collection in self.schema.collections() {
            let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
            for field in non_id_fields(collection) {
                columns.push(format!("\"{field}_value\" JSONB"));
                columns.push(format!("\"{field}_meta\" TEXT"));
            }
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
                collection.name(),
                columns.join(", ")
            );
            sqlx::query(&sql).execute(&self.pool).await?;
            tracing::debug!(collection = collection.name(), "ensured table");
        }
        Ok(())
    }

    async fn fetch_by_id(&self, collection: &Collection, id: &str) -> Result<Option<Record>> {
        let sql = format!("{} WHERE id = $1", select_sql(collection));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row_to_record(collection, &row)).transpose()
    }

    async fn fetch_all(&self, collection: &Collection) -> Result<BTreeMap<RecordId, Record>> {
        let sql = format!("{} ORDER BY id", select_sql(collection));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row_to_record(collection, row).map(|record| (record.id.clone(), record)))
            .collect()
    }

    async fn fetch_pointing_back(
        &self,
        target: &Collection,
        column: &str,
        owner_id: &str,
    ) -> Result<Vec<Record>> {
        let sql = format!(
            "{} WHERE \"{column}_value\" = $1 ORDER BY id",
            select_sql(target)
        );
        let rows = sqlx::query(&sql)
            .bind(serde_json::Value::String(owner_id.to_string()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row_to_record(target, row)).collect()
    }

    /// Embed related records per the include tree. Boxed for async
    /// recursion; depth is bounded by the include tree.
    fn hydrate<'a>(
        &'a self,
        record: &'a mut Record,
        collection: &'a Collection,
        include: &'a IncludeClause,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (name, entry) in &include.relations {
                let relation =
                    collection
                        .relation(name)
                        .ok_or_else(|| EngineError::UnknownRelation {
                            collection: collection.name().to_string(),
                            relation: name.clone(),
                        })?;
                let target = self.schema.collection(relation.target())?;
                let (sub_filter, sub_include, sub_limit) = entry_parts(entry);

                match relation.kind() {
                    RelationKind::One => {
                        let foreign_key = record
                            .field(relation.column())
                            .and_then(|field| field.value.as_str().map(str::to_string));
                        let mut related = match foreign_key {
                            Some(fk) => self.fetch_by_id(target, &fk).await?,
                            None => None,
                        };
                        if let (Some(rec), Some(include)) = (related.as_mut(), sub_include) {
                            self.hydrate(rec, target, include).await?;
                        }
                        let related = related.filter(|rec| clause_matches(sub_filter, rec));
                        record.set_related(name.clone(), Related::One(related.map(Box::new)));
                    }
                    RelationKind::Many => {
                        let candidates = self
                            .fetch_pointing_back(target, relation.column(), &record.id)
                            .await?;
                        let limit = sub_limit.unwrap_or(usize::MAX);
                        let mut related = BTreeMap::new();
                        for mut rec in candidates {
                            if let Some(include) = sub_include {
                                self.hydrate(&mut rec, target, include).await?;
                            }
                            if clause_matches(sub_filter, &rec) {
                                related.insert(rec.id.clone(), rec);
                                if related.len() >= limit {
                                    break;
                                }
                            }
                        }
                        record.set_related(name.clone(), Related::Many(related));
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn raw_find_by_id(
        &self,
        resource: &str,
        id: &str,
        include: Option<&IncludeClause>,
    ) -> Result<Option<Record>> {
        let collection = self.schema.collection(resource)?;
        let Some(mut record) = self.fetch_by_id(collection, id).await? else {
            return Ok(None);
        };
        if let Some(include) = include {
            self.hydrate(&mut record, collection, include).await?;
        }
        Ok(Some(record))
    }

    async fn raw_find(
        &self,
        resource: &str,
        filter: Option<&WhereClause>,
        include: Option<&IncludeClause>,
        limit: Option<usize>,
    ) -> Result<BTreeMap<RecordId, Record>> {
        let collection = self.schema.collection(resource)?;
        let needed = required_include(&self.schema, resource, filter, include);
        let mut records = self.fetch_all(collection).await?;
        if let Some(include) = &needed {
            for record in records.values_mut() {
                self.hydrate(record, collection, include).await?;
            }
        }
        Ok(filter_and_limit(records, filter, limit))
    }

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction {
            schema: self.schema.clone(),
            tx,
        }))
    }
}

/// A `sqlx` transaction bound to the schema.
pub struct PostgresTransaction {
    schema: Schema,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTransaction for PostgresTransaction {
    async fn raw_find_by_id(&mut self, resource: &str, id: &str) -> Result<Option<Record>> {
        let collection = self.schema.collection(resource)?;
        let sql = format!("{} WHERE id = $1", select_sql(collection));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|row| row_to_record(collection, &row)).transpose()
    }

    async fn raw_insert(&mut self, resource: &str, id: &str, record: &Record) -> Result<Record> {
        let collection = self.schema.collection(resource)?;
        let fields: Vec<&String> = non_id_fields(collection).collect();

        let mut columns = vec!["id".to_string()];
        let mut placeholders = vec!["$1".to_string()];
        let mut position = 2;
        for field in &fields {
            columns.push(format!("\"{field}_value\""));
            columns.push(format!("\"{field}_meta\""));
            placeholders.push(format!("${position}"));
            placeholders.push(format!("${}", position + 1));
            position += 2;
        }
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            collection.name(),
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(id.to_string());
        for field in &fields {
            let value = record.field(field);
            query = query
                .bind(value.map(|f| f.value.clone()))
                .bind(value.map(|f| f.meta.timestamp.as_str().to_string()));
        }
        query.execute(&mut *self.tx).await.map_err(|error| {
            if is_unique_violation(&error) {
                AppError::Conflict(id.to_string())
            } else {
                error.into()
            }
        })?;
        Ok(record.clone())
    }

    async fn raw_update(
        &mut self,
        resource: &str,
        id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Record> {
        let collection = self.schema.collection(resource)?;
        for name in fields.keys() {
            if name != "id" && collection.live_type(name).is_none() {
                return Err(EngineError::UnknownField {
                    collection: resource.to_string(),
                    field: name.clone(),
                }
                .into());
            }
        }

        let written: Vec<(&String, &FieldValue)> =
            fields.iter().filter(|(name, _)| *name != "id").collect();
        if !written.is_empty() {
            let mut assignments = Vec::new();
            let mut position = 2;
            for (name, _) in &written {
                assignments.push(format!(
                    "\"{name}_value\" = ${position}, \"{name}_meta\" = ${}",
                    position + 1
                ));
                position += 2;
            }
            let sql = format!(
                "UPDATE \"{}\" SET {} WHERE id = $1",
                collection.name(),
                assignments.join(", ")
            );
            let mut query = sqlx::query(&sql).bind(id.to_string());
            for (_, value) in &written {
                query = query
                    .bind(value.value.clone())
                    .bind(value.meta.timestamp.as_str().to_string());
            }
            let outcome = query.execute(&mut *self.tx).await?;
            if outcome.rows_affected() == 0 {
                return Err(AppError::NotFound(id.to_string()));
            }
        }

        self.raw_find_by_id(resource, id)
            .await?
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn non_id_fields(collection: &Collection) -> impl Iterator<Item = &String> {
    collection.fields().keys().filter(|name| *name != "id")
}

fn select_sql(collection: &Collection) -> String {
    let mut columns = vec!["id".to_string()];
    for field in non_id_fields(collection) {
        columns.push(format!("\"{field}_value\""));
        columns.push(format!("\"{field}_meta\""));
    }
    format!(
        "SELECT {} FROM \"{}\"",
        columns.join(", "),
        collection.name()
    )
}

fn row_to_record(collection: &Collection, row: &PgRow) -> Result<Record> {
    let id: String = row.try_get("id")?;
    let mut record = Record::new(id);
    for field in non_id_fields(collection) {
        let value: Option<serde_json::Value> = row.try_get(format!("{field}_value").as_str())?;
        let meta: Option<String> = row.try_get(format!("{field}_meta").as_str())?;
        if let (Some(value), Some(meta)) = (value, meta) {
            record.set_field(field.clone(), FieldValue::new(value, Timestamp::new(meta)));
        }
    }
    Ok(record)
}

fn entry_parts(
    entry: &IncludeEntry,
) -> (Option<&WhereClause>, Option<&IncludeClause>, Option<usize>) {
    match entry {
        IncludeEntry::All => (None, None, None),
        IncludeEntry::Sub(SubQuery {
            filter,
            include,
            limit,
        }) => (filter.as_ref(), include.as_ref(), *limit),
    }
}

fn clause_matches(filter: Option<&WhereClause>, record: &Record) -> bool {
    filter
        .map(|clause| clause.matches(&record.infer()))
        .unwrap_or(true)
}

/// PostgreSQL unique violation code is "23505".
fn is_unique_violation(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_error) = error {
        db_error.code().map(|code| code == "23505").unwrap_or(false)
    } else {
        false
    }
}
