//! The client's materialized mirror.
//!
//! Holds the records the server has streamed down, one map per
//! collection. The mirror has a single writer (the watch engine); every
//! write flows through the schema's field-level merge, so replaying the
//! same broadcasts in any order - or on top of optimistic local writes -
//! always lands on the same state.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tether_engine::{
    CollectionName, EncodedField, Mutation, MutationKind, Record, RecordId, Schema, Timestamp,
};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the mirror, for persistence by the
/// embedding application. BTreeMaps keep serialization deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Fingerprint of the schema the snapshot was taken under
    pub schema_fingerprint: u32,
    /// All records organized by collection, then by record id
    pub collections: BTreeMap<CollectionName, BTreeMap<RecordId, Record>>,
}

impl StoreSnapshot {
    /// Reject snapshots taken under a different format or schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(ClientError::InvalidSnapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        if self.schema_fingerprint != schema.fingerprint() {
            return Err(ClientError::InvalidSnapshot(
                "schema fingerprint mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

/// The materialized mirror of the authoritative store.
#[derive(Debug, Clone)]
pub struct ClientStore {
    schema: Schema,
    collections: HashMap<CollectionName, BTreeMap<RecordId, Record>>,
}

impl ClientStore {
    /// Create an empty mirror for a schema.
    pub fn new(schema: Schema) -> Self {
        let collections = schema
            .collections()
            .map(|c| (c.name().to_string(), BTreeMap::new()))
            .collect();
        Self {
            schema,
            collections,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get a record by collection and id.
    pub fn get(&self, resource: &str, id: &str) -> Option<&Record> {
        self.collections.get(resource)?.get(id)
    }

    /// All mirrored records of a collection.
    pub fn records(&self, resource: &str) -> Option<&BTreeMap<RecordId, Record>> {
        self.collections.get(resource)
    }

    /// Fold a server-provided record into the mirror.
    ///
    /// Each field merges under LWW against whatever is already mirrored,
    /// so a result set arriving after a local optimistic write never
    /// moves a field backwards. Embedded relations are replaced
    /// wholesale - the server hydrated them fresh.
    pub fn load(&mut self, resource: &str, incoming: Record) -> Result<&Record> {
        let collection = self.schema.collection(resource)?.clone();
        let records = self
            .collections
            .entry(resource.to_string())
            .or_default();

        let id = incoming.id.clone();
        match records.get_mut(&id) {
            None => {
                records.insert(id.clone(), incoming);
            }
            Some(existing) => {
                for (name, field) in incoming.fields {
                    if let Some(ty) = collection.live_type(&name) {
                        let (merged, _) = ty.merge(field, existing.field(&name));
                        existing.set_field(name, merged);
                    }
                }
                existing.related = incoming.related;
            }
        }
        Ok(&records[&id])
    }

    /// Apply a mutation to the mirror.
    ///
    /// Returns the post-merge record when the mutation changed (or
    /// created) state, `None` when it was entirely stale or a custom
    /// call. An `INSERT` for a mirrored id degrades to a field merge and
    /// an `UPDATE` for an unmirrored id materializes a partial record,
    /// so broadcast redelivery and arrival-order races stay convergent.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<Option<Record>> {
        let resource = mutation.resource().to_string();
        let (payload, resource_id, timestamp) = match mutation {
            Mutation::Insert(m) | Mutation::Update(m) => {
                (&m.payload, &m.resource_id, &m.meta.timestamp)
            }
            Mutation::Custom(_) => return Ok(None),
        };

        let existing = self.get(&resource, resource_id).cloned();
        let effective_kind = if existing.is_some() {
            MutationKind::Update
        } else {
            MutationKind::Insert
        };

        let input = match effective_kind {
            MutationKind::Insert => with_id_backfilled(payload, resource_id, timestamp),
            MutationKind::Update => payload.clone(),
        };

        let (merged, accepted) = self.schema.merge_mutation(
            &resource,
            effective_kind,
            &input,
            existing.as_ref(),
        )?;

        if accepted.is_none() {
            return Ok(None);
        }
        let records = self.collections.entry(resource).or_default();
        records.insert(merged.id.clone(), merged.clone());
        Ok(Some(merged))
    }

    /// Export the mirror as a snapshot.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        let collections = self
            .collections
            .iter()
            .map(|(name, records)| (name.clone(), records.clone()))
            .collect();
        StoreSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_fingerprint: self.schema.fingerprint(),
            collections,
        }
    }

    /// Replace the mirror's contents from a snapshot.
    pub fn import_snapshot(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;
        for records in self.collections.values_mut() {
            records.clear();
        }
        for (name, records) in snapshot.collections {
            if self.schema.has_collection(&name) {
                self.collections.insert(name, records);
            }
        }
        Ok(())
    }
}

fn with_id_backfilled(
    payload: &BTreeMap<String, EncodedField>,
    resource_id: &str,
    timestamp: &Timestamp,
) -> BTreeMap<String, EncodedField> {
    let mut input = payload.clone();
    input.entry("id".to_string()).or_insert_with(|| {
        EncodedField::new(serde_json::json!(resource_id), timestamp.clone())
    });
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_engine::{Collection, LiveType, WriteMutation};

    fn test_schema() -> Schema {
        Schema::new()
            .with_collection(
                Collection::new("cards")
                    .field("id", LiveType::Text)
                    .field("title", LiveType::Text)
                    .field("done", LiveType::Boolean),
            )
            .unwrap()
    }

    fn wire(value: serde_json::Value, stamp: &str) -> EncodedField {
        EncodedField::new(value, Timestamp::new(stamp))
    }

    fn insert(id: &str, title: &str, stamp: &str) -> Mutation {
        let payload = [
            ("title".to_string(), wire(json!(title), stamp)),
            ("done".to_string(), wire(json!(false), stamp)),
        ]
        .into_iter()
        .collect();
        Mutation::Insert(WriteMutation::new("cards", id, payload, Timestamp::new(stamp)))
    }

    fn update(id: &str, field: &str, value: serde_json::Value, stamp: &str) -> Mutation {
        let payload = [(field.to_string(), wire(value, stamp))].into_iter().collect();
        Mutation::Update(WriteMutation::new("cards", id, payload, Timestamp::new(stamp)))
    }

    #[test]
    fn insert_then_update() {
        let mut store = ClientStore::new(test_schema());
        store.apply(&insert("c1", "hello", "T1")).unwrap();
        store.apply(&update("c1", "done", json!(true), "T2")).unwrap();

        let record = store.get("cards", "c1").unwrap();
        assert_eq!(record.infer()["done"], json!(true));
        assert_eq!(record.infer()["title"], json!("hello"));
    }

    #[test]
    fn stale_update_is_dropped() {
        let mut store = ClientStore::new(test_schema());
        store.apply(&insert("c1", "hello", "T5")).unwrap();
        let result = store
            .apply(&update("c1", "title", json!("old"), "T3"))
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.get("cards", "c1").unwrap().infer()["title"], json!("hello"));
    }

    #[test]
    fn duplicate_insert_converges() {
        let mut store = ClientStore::new(test_schema());
        store.apply(&insert("c1", "hello", "T1")).unwrap();
        // redelivered broadcast of the same insert
        let second = store.apply(&insert("c1", "hello", "T1")).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn update_before_insert_materializes_partial_record() {
        let mut store = ClientStore::new(test_schema());
        store.apply(&update("c9", "done", json!(true), "T2")).unwrap();

        let record = store.get("cards", "c9").unwrap();
        assert_eq!(record.id, "c9");
        assert_eq!(record.infer()["done"], json!(true));
    }

    #[test]
    fn load_never_moves_fields_backwards() {
        let mut store = ClientStore::new(test_schema());
        store.apply(&insert("c1", "optimistic", "T9")).unwrap();

        // server result carrying an older title but a newer done flag
        let mut server_copy = Record::new("c1");
        server_copy.set_field("title", tether_engine::FieldValue::new(json!("server"), Timestamp::new("T4")));
        server_copy.set_field("done", tether_engine::FieldValue::new(json!(true), Timestamp::new("T10")));
        store.load("cards", server_copy).unwrap();

        let inferred = store.get("cards", "c1").unwrap().infer();
        assert_eq!(inferred["title"], json!("optimistic"));
        assert_eq!(inferred["done"], json!(true));
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut store = ClientStore::new(test_schema());
        store.apply(&insert("c1", "hello", "T1")).unwrap();

        let snapshot = store.export_snapshot();
        let mut restored = ClientStore::new(test_schema());
        restored.import_snapshot(snapshot.clone()).unwrap();
        assert_eq!(
            restored.get("cards", "c1").unwrap().infer(),
            store.get("cards", "c1").unwrap().infer()
        );

        // a different schema refuses the snapshot
        let other = Schema::new()
            .with_collection(Collection::new("boards").field("id", LiveType::Text))
            .unwrap();
        let mut wrong = ClientStore::new(other);
        assert!(matches!(
            wrong.import_snapshot(snapshot),
            Err(ClientError::InvalidSnapshot(_))
        ));
    }
}
