//! # Tether Client
//!
//! The client side of the Tether live synchronization engine: an
//! outbound WebSocket transport with an offline queue, a single-writer
//! materialized mirror of the server's store, and an incremental query
//! engine that keeps registered live queries current as mutations
//! stream in.
//!
//! ## Flow
//!
//! A [`Client`] connects to a Tether server, registers queries built
//! with [`tether_engine::QueryBuilder`], and surfaces their result sets
//! through [`LiveQuery`] handles. Locally originated mutations apply to
//! the mirror optimistically before the server acknowledges; the
//! field-level last-write-wins merge guarantees the mirror converges to
//! the server's state either way.

pub mod client;
pub mod connection;
pub mod error;
pub mod store;
pub mod watch;

pub use client::{Client, LiveQuery, MutateOutcome};
pub use connection::{Connection, ConnectionStatus};
pub use error::ClientError;
pub use store::{ClientStore, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use watch::{RelationSource, WatchCallback, WatchEngine, WatchSubscription};
