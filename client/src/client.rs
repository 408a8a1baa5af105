//! The client facade.
//!
//! Ties the transport, the mirror, and the watch engine together:
//! `subscribe` registers live queries on both sides, `insert`/`update`
//! apply optimistically before the server acknowledges, and the event
//! loop folds broadcasts into the watch engine as they arrive.

use crate::connection::{Connection, ConnectionStatus};
use crate::error::{ClientError, Result};
use crate::store::StoreSnapshot;
use crate::watch::{RelationSource, WatchCallback, WatchEngine, WatchSubscription};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_engine::{
    ClientFrame, Clock, CustomCall, EncodedField, FieldValue, IncludeClause, Mutation,
    QueryBuilder, QueryHash, QueryRequest, Record, RecordId, Schema, ServerFrame, Timestamp,
    WhereClause, WriteMutation,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of an acknowledged mutation.
#[derive(Debug)]
pub struct MutateOutcome {
    /// Whether any field actually changed server state
    pub accepted: bool,
    /// Post-merge record (or custom handler result)
    pub data: Option<Value>,
    /// Fields the server accepted; `None` means the mutation was stale
    pub accepted_values: Option<BTreeMap<String, FieldValue>>,
}

struct ClientInner {
    schema: Schema,
    connection: Connection,
    watch: WatchEngine,
    clock: Mutex<Clock>,
    request_timeout: Duration,
    /// correlation id -> request, for routing re-sent query results
    subscriptions: Mutex<HashMap<u64, QueryRequest>>,
}

/// A connected Tether client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Hydrates relation fetches by running a one-shot subscribe against the
/// server.
struct RemoteSource {
    connection: Connection,
    timeout: Duration,
}

#[async_trait]
impl RelationSource for RemoteSource {
    async fn fetch(
        &self,
        resource: &str,
        id: &str,
        include: &IncludeClause,
    ) -> Result<Option<Record>> {
        let correlation = self.connection.next_correlation_id();
        let query = QueryRequest {
            resource: resource.to_string(),
            filter: Some(WhereClause::eq("id", Value::String(id.to_string()))),
            include: Some(include.clone()),
            limit: Some(1),
        };
        let reply = self
            .connection
            .request(
                correlation,
                ClientFrame::Subscribe {
                    id: correlation,
                    query,
                },
                self.timeout,
            )
            .await?;
        self.connection
            .send(ClientFrame::Unsubscribe { id: correlation });
        match reply {
            ServerFrame::QueryResult { data, .. } => Ok(data.into_values().next()),
            ServerFrame::Error { code, message, .. } => Err(ClientError::Server { code, message }),
            other => Err(ClientError::UnexpectedFrame(format!("{other:?}"))),
        }
    }
}

impl Client {
    /// Connect to a Tether server.
    ///
    /// `node` seeds the timestamp clock and should be unique per process
    /// (a UUID is a good choice).
    pub async fn connect(
        url: impl Into<String>,
        schema: Schema,
        node: impl Into<String>,
    ) -> Result<Client> {
        schema.validate_relations()?;
        let (connection, mut events) = Connection::new(url);
        connection.open().await?;

        let source = RemoteSource {
            connection: connection.clone(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        let watch = WatchEngine::new(schema.clone(), Arc::new(source));

        let inner = Arc::new(ClientInner {
            schema,
            connection,
            watch,
            clock: Mutex::new(Clock::new(node)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            subscriptions: Mutex::new(HashMap::new()),
        });

        let loop_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(frame) = events.recv().await {
                let Some(inner) = loop_inner.upgrade() else {
                    break;
                };
                match frame {
                    frame @ ServerFrame::Broadcast { .. } => {
                        match broadcast_to_mutation(frame) {
                            Some(mutation) => inner.watch.handle_mutation(&mutation),
                            None => tracing::debug!("ignoring non-write broadcast"),
                        }
                    }
                    ServerFrame::QueryResult { id, data } => {
                        let request = lock(&inner.subscriptions).get(&id).cloned();
                        if let Some(request) = request {
                            if let Err(error) = inner.watch.load_query_results(&request, data) {
                                tracing::warn!(%error, "failed to load query results");
                            }
                        }
                    }
                    ServerFrame::Error { code, message, .. } => {
                        tracing::warn!(?code, message, "uncorrelated server error");
                    }
                    _ => {}
                }
            }
        });

        Ok(Client { inner })
    }

    /// Connection lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Re-dial after a drop; queued frames flush in order first.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.connection.open().await
    }

    /// Register a live query. The callback fires with the current
    /// matching record set whenever it changes.
    ///
    /// While offline, the registration is queued; initial results arrive
    /// after the next successful reconnect.
    pub async fn subscribe(
        &self,
        builder: &QueryBuilder,
        callback: WatchCallback,
    ) -> Result<LiveQuery> {
        let request = builder.build();
        let subscription = self.inner.watch.register_query(request.clone(), callback);
        let correlation = self.inner.connection.next_correlation_id();
        lock(&self.inner.subscriptions).insert(correlation, request.clone());

        let reply = self
            .inner
            .connection
            .request(
                correlation,
                ClientFrame::Subscribe {
                    id: correlation,
                    query: request.clone(),
                },
                self.inner.request_timeout,
            )
            .await;

        match reply {
            Ok(ServerFrame::QueryResult { data, .. }) => {
                self.inner.watch.load_query_results(&request, data)?;
            }
            Ok(ServerFrame::Error { code, message, .. }) => {
                lock(&self.inner.subscriptions).remove(&correlation);
                subscription.unsubscribe();
                return Err(ClientError::Server { code, message });
            }
            Ok(other) => {
                lock(&self.inner.subscriptions).remove(&correlation);
                subscription.unsubscribe();
                return Err(ClientError::UnexpectedFrame(format!("{other:?}")));
            }
            // offline or slow: the queued SUBSCRIBE flushes on reconnect
            // and results land through the event loop
            Err(ClientError::Timeout) | Err(ClientError::Closed) => {}
            Err(error) => {
                lock(&self.inner.subscriptions).remove(&correlation);
                subscription.unsubscribe();
                return Err(error);
            }
        }

        Ok(LiveQuery {
            client: Arc::clone(&self.inner),
            subscription,
            correlation,
        })
    }

    /// Insert a record, optimistically mirrored before the server
    /// acknowledges.
    pub async fn insert(&self, resource: &str, id: &str, values: Value) -> Result<MutateOutcome> {
        let (mut payload, timestamp) = self.encode_values(resource, &values)?;
        payload
            .entry("id".to_string())
            .or_insert_with(|| EncodedField::new(Value::String(id.to_string()), timestamp.clone()));
        let mutation = Mutation::Insert(WriteMutation::new(resource, id, payload, timestamp));
        self.run_mutation(mutation).await
    }

    /// Update fields of a record, optimistically mirrored before the
    /// server acknowledges.
    pub async fn update(&self, resource: &str, id: &str, values: Value) -> Result<MutateOutcome> {
        let (payload, timestamp) = self.encode_values(resource, &values)?;
        let mutation = Mutation::Update(WriteMutation::new(resource, id, payload, timestamp));
        self.run_mutation(mutation).await
    }

    /// Call a custom mutation declared on the server's route.
    pub async fn call(
        &self,
        resource: &str,
        procedure: &str,
        resource_id: Option<&str>,
        input: Value,
    ) -> Result<MutateOutcome> {
        let mutation = Mutation::Custom(CustomCall {
            resource: resource.to_string(),
            resource_id: resource_id.map(str::to_string),
            procedure: procedure.to_string(),
            input,
        });
        // custom calls are not applied optimistically: their effect is
        // decided by the server-side handler
        self.send_and_ack(mutation).await
    }

    /// Read one mirrored record.
    pub fn get(&self, resource: &str, id: &str) -> Option<Record> {
        self.inner.watch.get_record(resource, id)
    }

    /// Export the mirror for persistence.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        self.inner.watch.export_snapshot()
    }

    /// Restore the mirror from a persisted snapshot.
    pub fn import_snapshot(&self, snapshot: StoreSnapshot) -> Result<()> {
        self.inner.watch.import_snapshot(snapshot)
    }

    async fn run_mutation(&self, mutation: Mutation) -> Result<MutateOutcome> {
        // optimistic: the mirror (and every live query) sees the write
        // before the server answers
        self.inner.watch.handle_mutation(&mutation);
        self.send_and_ack(mutation).await
    }

    async fn send_and_ack(&self, mutation: Mutation) -> Result<MutateOutcome> {
        let correlation = self.inner.connection.next_correlation_id();
        let reply = self
            .inner
            .connection
            .request(
                correlation,
                ClientFrame::Mutate {
                    id: correlation,
                    mutation,
                },
                self.inner.request_timeout,
            )
            .await?;
        match reply {
            ServerFrame::MutateAck {
                accepted,
                data,
                accepted_values,
                ..
            } => Ok(MutateOutcome {
                accepted,
                data,
                accepted_values,
            }),
            // a rejection is not rolled back locally; the server's
            // correction broadcast converges the mirror
            ServerFrame::Error { code, message, .. } => Err(ClientError::Server { code, message }),
            other => Err(ClientError::UnexpectedFrame(format!("{other:?}"))),
        }
    }

    fn encode_values(
        &self,
        resource: &str,
        values: &Value,
    ) -> Result<(BTreeMap<String, EncodedField>, Timestamp)> {
        let timestamp = lock(&self.inner.clock).tick(chrono::Utc::now().timestamp_millis());
        let payload = encode_values(&self.inner.schema, resource, values, &timestamp)?;
        Ok((payload, timestamp))
    }
}

/// A registered live query.
pub struct LiveQuery {
    client: Arc<ClientInner>,
    subscription: WatchSubscription,
    correlation: u64,
}

impl LiveQuery {
    /// Stable identifier of the underlying query.
    pub fn hash(&self) -> QueryHash {
        self.subscription.hash()
    }

    /// An immutable snapshot of the current matching record set.
    pub fn get(&self) -> BTreeMap<RecordId, Record> {
        self.subscription.get()
    }

    /// Detach locally (synchronous) and tell the server to stop
    /// streaming this query.
    pub fn unsubscribe(self) {
        lock(&self.client.subscriptions).remove(&self.correlation);
        self.client.connection.send(ClientFrame::Unsubscribe {
            id: self.correlation,
        });
        self.subscription.unsubscribe();
    }
}

/// Encode a plain JSON object into a mutation payload, stamping every
/// field with the same timestamp.
fn encode_values(
    schema: &Schema,
    resource: &str,
    values: &Value,
    timestamp: &Timestamp,
) -> Result<BTreeMap<String, EncodedField>> {
    let collection = schema.collection(resource)?;
    let object = values.as_object().ok_or_else(|| {
        ClientError::Engine(tether_engine::Error::InvalidPayload(
            "mutation values must be an object".to_string(),
        ))
    })?;
    let mut payload = BTreeMap::new();
    for (name, value) in object {
        let ty = collection
            .live_type(name)
            .ok_or_else(|| tether_engine::Error::UnknownField {
                collection: resource.to_string(),
                field: name.clone(),
            })?;
        payload.insert(name.clone(), ty.encode(value.clone(), timestamp.clone())?);
    }
    Ok(payload)
}

/// Turn a broadcast frame back into the mutation it carries. Custom
/// broadcasts have no mirror semantics and yield `None`.
fn broadcast_to_mutation(frame: ServerFrame) -> Option<Mutation> {
    let ServerFrame::Broadcast {
        resource,
        resource_id,
        procedure,
        payload,
        meta,
        ..
    } = frame
    else {
        return None;
    };
    let resource_id = resource_id?;
    let write = WriteMutation {
        resource,
        resource_id,
        payload,
        meta,
    };
    match procedure.as_str() {
        "INSERT" => Some(Mutation::Insert(write)),
        "UPDATE" => Some(Mutation::Update(write)),
        _ => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
