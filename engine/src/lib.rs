//! # Tether Engine
//!
//! The deterministic core of the Tether live synchronization engine.
//!
//! This crate holds everything both sides of a sync session agree on:
//! the schema model, per-field last-write-wins merge, the where-clause
//! evaluator, query building and hashing, and the wire protocol frames.
//! It performs no IO and produces the same outputs for the same inputs on
//! every peer - that property is what makes replicas converge.
//!
//! ## Core Concepts
//!
//! ### Collections and LiveTypes
//!
//! Applications declare named collections of records. Every field is a
//! [`LiveType`] register: a typed value paired with a lexicographically
//! comparable timestamp. Concurrent writes to the same field resolve by
//! largest timestamp, with ties broken by the encoded payload, so the
//! outcome never depends on delivery order.
//!
//! ### Mutations
//!
//! Changes travel as [`Mutation`] messages - `INSERT`, `UPDATE`, or a
//! named custom procedure. [`Schema::merge_mutation`] folds a mutation
//! into a materialized [`Record`], reporting which fields were actually
//! accepted (stale fields are dropped without effect).
//!
//! ### Queries
//!
//! A [`QueryBuilder`] composes `{resource, where, include, limit}`
//! requests immutably. Requests hash to a stable 32-bit identifier used
//! to key live subscriptions on both client and server.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use tether_engine::{
//!     Clock, Collection, EncodedField, LiveType, MutationKind, Schema,
//! };
//!
//! let schema = Schema::new()
//!     .with_collection(
//!         Collection::new("todos")
//!             .field("id", LiveType::Text)
//!             .field("title", LiveType::Text)
//!             .field("done", LiveType::Boolean),
//!     )
//!     .unwrap();
//!
//! let mut clock = Clock::new("node-1");
//! let ts = clock.tick(1_706_745_600_000);
//!
//! let payload = [
//!     ("id".to_string(), EncodedField::new(json!("t1"), ts.clone())),
//!     ("title".to_string(), EncodedField::new(json!("write docs"), ts.clone())),
//!     ("done".to_string(), EncodedField::new(json!(false), ts)),
//! ]
//! .into_iter()
//! .collect();
//!
//! let (record, accepted) = schema
//!     .merge_mutation("todos", MutationKind::Insert, &payload, None)
//!     .unwrap();
//! assert_eq!(record.id, "t1");
//! assert_eq!(accepted.unwrap().len(), 3);
//! ```

pub mod clock;
pub mod error;
pub mod filter;
pub mod livetype;
pub mod mutation;
pub mod protocol;
pub mod query;
pub mod record;
pub mod schema;

// Re-export main types at crate root
pub use clock::{Clock, Timestamp};
pub use error::Error;
pub use filter::{normalize_query_nulls, Condition, WhereClause};
pub use livetype::{EncodedField, FieldMeta, FieldValue, LiveType};
pub use mutation::{CustomCall, Mutation, MutationKind, MutationMeta, WriteMutation};
pub use protocol::{ClientFrame, ErrorCode, ServerFrame};
pub use query::{IncludeClause, IncludeEntry, QueryBuilder, QueryHash, QueryRequest, SubQuery};
pub use record::{Record, Related};
pub use schema::{validate_input, Collection, Relation, RelationKind, Schema};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
