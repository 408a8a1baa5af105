//! Subscription registry and broadcast fan-out.
//!
//! Tracks every connection's live queries and routes committed
//! mutations to the connections whose queries they may affect.
//! Process-wide state with an explicit lifecycle: constructed at server
//! boot, shut down with the transport.

use crate::server::BroadcastEvent;
use crate::storage::Storage;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tether_engine::{QueryHash, QueryRequest, Schema, ServerFrame};
use tokio::sync::mpsc;

/// Sender for frames to one connection. Per-connection channels keep
/// delivery ordered; fan-out runs under the commit lock, so that order
/// is commit order.
pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

struct ConnectionEntry {
    sender: FrameSender,
    /// frame id -> (resource, query hash), for unsubscribe by id
    subscriptions: Mutex<HashMap<u64, (String, QueryHash)>>,
    auth_failures: AtomicU32,
}

struct QueryEntry {
    request: QueryRequest,
    connections: HashSet<String>,
}

/// Registry of connections and their live queries.
pub struct SubscriptionRegistry {
    connections: DashMap<String, ConnectionEntry>,
    /// (resource, query hash) -> subscribed connections
    index: DashMap<(String, QueryHash), QueryEntry>,
    commit_lock: tokio::sync::Mutex<()>,
    auth_failure_limit: u32,
}

impl SubscriptionRegistry {
    pub fn new(auth_failure_limit: u32) -> Self {
        Self {
            connections: DashMap::new(),
            index: DashMap::new(),
            commit_lock: tokio::sync::Mutex::new(()),
            auth_failure_limit,
        }
    }

    /// Create a registry wrapped in Arc for sharing.
    pub fn new_shared(auth_failure_limit: u32) -> Arc<Self> {
        Arc::new(Self::new(auth_failure_limit))
    }

    /// Serializes mutation commit + fan-out so broadcasts reach every
    /// connection in commit order.
    pub async fn commit_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.commit_lock.lock().await
    }

    /// Register a new connection. Returns its id.
    pub fn register(&self, sender: FrameSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(
            conn_id.clone(),
            ConnectionEntry {
                sender,
                subscriptions: Mutex::new(HashMap::new()),
                auth_failures: AtomicU32::new(0),
            },
        );
        tracing::info!(conn_id = %conn_id, "connection registered");
        conn_id
    }

    /// Drop a connection and every query it subscribed to.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, entry)) = self.connections.remove(conn_id) {
            let subscriptions = entry
                .subscriptions
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner);
            for (_, (resource, hash)) in subscriptions {
                self.drop_subscription(conn_id, resource, hash);
            }
            tracing::info!(conn_id = %conn_id, "connection unregistered");
        }
    }

    /// Record a live query for a connection under the client's frame id.
    pub fn subscribe(&self, conn_id: &str, frame_id: u64, request: QueryRequest) {
        let hash = request.hash();
        let resource = request.resource.clone();
        let Some(connection) = self.connections.get(conn_id) else {
            return;
        };
        connection
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(frame_id, (resource.clone(), hash));
        drop(connection);

        self.index
            .entry((resource, hash))
            .or_insert_with(|| QueryEntry {
                request,
                connections: HashSet::new(),
            })
            .connections
            .insert(conn_id.to_string());
    }

    /// Drop one of a connection's live queries by frame id.
    pub fn unsubscribe(&self, conn_id: &str, frame_id: u64) {
        let Some(connection) = self.connections.get(conn_id) else {
            return;
        };
        let removed = connection
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame_id);
        drop(connection);
        if let Some((resource, hash)) = removed {
            self.drop_subscription(conn_id, resource, hash);
        }
    }

    fn drop_subscription(&self, conn_id: &str, resource: String, hash: QueryHash) {
        let key = (resource, hash);
        let empty = match self.index.get_mut(&key) {
            Some(mut entry) => {
                entry.connections.remove(conn_id);
                entry.connections.is_empty()
            }
            None => false,
        };
        if empty {
            self.index.remove(&key);
        }
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a frame to one connection.
    pub fn send_to(&self, conn_id: &str, frame: ServerFrame) -> bool {
        self.connections
            .get(conn_id)
            .map(|connection| connection.sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Count an authorization failure against a connection. Returns true
    /// once the configured limit is exceeded, at which point the
    /// transport should drop the connection.
    pub fn record_auth_failure(&self, conn_id: &str) -> bool {
        self.connections
            .get(conn_id)
            .map(|connection| {
                let failures = connection.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > self.auth_failure_limit {
                    tracing::warn!(conn_id = %conn_id, failures, "auth failure limit exceeded");
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false)
    }

    /// Push a committed mutation to every connection subscribed to an
    /// affected query. One connection's send failure never affects the
    /// others.
    pub async fn fan_out(
        &self,
        event: &BroadcastEvent,
        storage: &dyn Storage,
        schema: &Schema,
        exclude: Option<&str>,
    ) {
        // collect outside the shard locks; affected-ness checks await
        let candidates: Vec<(QueryRequest, Vec<String>)> = self
            .index
            .iter()
            .filter(|entry| entry.key().0 == event.resource)
            .map(|entry| {
                (
                    entry.value().request.clone(),
                    entry.value().connections.iter().cloned().collect(),
                )
            })
            .collect();

        let mut targets: BTreeSet<String> = BTreeSet::new();
        for (request, connections) in candidates {
            if connections.is_empty() {
                continue;
            }
            if query_affected(&request, event, storage, schema).await {
                targets.extend(connections);
            }
        }

        let frame = event.frame();
        let mut delivered = 0usize;
        for conn_id in targets {
            if Some(conn_id.as_str()) == exclude {
                continue;
            }
            if self.send_to(&conn_id, frame.clone()) {
                delivered += 1;
            }
        }
        tracing::debug!(
            resource = %event.resource,
            procedure = %event.procedure,
            delivered,
            "broadcast fan-out"
        );
    }
}

/// Decide whether a mutation can affect a query's result set.
///
/// Queries without a where-clause match every mutation on the resource.
/// Otherwise the record is re-read through storage with the include
/// tree the clause needs and evaluated; a cheap field-overlap check
/// additionally catches records transitioning *out* of the result set.
async fn query_affected(
    request: &QueryRequest,
    event: &BroadcastEvent,
    storage: &dyn Storage,
    schema: &Schema,
) -> bool {
    let Some(filter) = &request.filter else {
        return true;
    };
    let touched_referenced_field = {
        let referenced = filter.referenced_fields();
        event.payload.keys().any(|field| referenced.contains(field))
    };
    let Some(id) = &event.resource_id else {
        // custom broadcast without a target: deliver
        return true;
    };

    let mut include = request.include.clone().unwrap_or_default();
    if let Ok(collection) = schema.collection(&event.resource) {
        include.merge(filter.extract_include(collection, schema));
    }
    let include = (!include.is_empty()).then_some(include);

    match storage
        .raw_find_by_id(&event.resource, id, include.as_ref())
        .await
    {
        Ok(Some(record)) => filter.matches(&record.infer()) || touched_referenced_field,
        Ok(None) => touched_referenced_field,
        Err(error) => {
            // deliver on doubt; the client re-evaluates anyway
            tracing::warn!(%error, "affected-query check failed");
            true
        }
    }
}
