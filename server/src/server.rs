//! The server core.
//!
//! Holds the schema, storage, per-collection routes, and the context
//! provider. Transport-agnostic: the WebSocket and HTTP layers both
//! enter through `handle_query` / `handle_mutation`, and fan out the
//! returned broadcast event after commit.

use crate::context::{Context, ContextProvider, RawRequest};
use crate::error::{AppError, Result};
use crate::route::{ResponseData, Route, RouteRequest, RouteResponse};
use crate::storage::Storage;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tether_engine::{
    Clock, EncodedField, Mutation, MutationMeta, QueryRequest, Record, RecordId, Schema,
    ServerFrame, Timestamp,
};

/// A committed mutation to push to affected subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub resource: String,
    pub resource_id: Option<RecordId>,
    pub procedure: String,
    /// Accepted fields, re-encoded with their winning timestamps
    pub payload: BTreeMap<String, EncodedField>,
    /// Input of a broadcast-enabled custom mutation
    pub input: Option<Value>,
    pub meta: MutationMeta,
}

impl BroadcastEvent {
    /// Render as the wire frame.
    pub fn frame(&self) -> ServerFrame {
        ServerFrame::Broadcast {
            resource: self.resource.clone(),
            resource_id: self.resource_id.clone(),
            procedure: self.procedure.clone(),
            payload: self.payload.clone(),
            input: self.input.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// The authoritative server: routes, storage, schema, context provider.
pub struct Server {
    schema: Schema,
    storage: Arc<dyn Storage>,
    routes: HashMap<String, Arc<Route>>,
    context_provider: Option<ContextProvider>,
    /// Stamps broadcast metadata for custom mutations
    clock: Mutex<Clock>,
}

impl Server {
    /// Create a server over a schema and storage. Relation targets are
    /// validated here, once.
    pub fn new(schema: Schema, storage: Arc<dyn Storage>) -> Result<Self> {
        schema.validate_relations()?;
        let node = format!("server-{}", uuid::Uuid::new_v4());
        Ok(Self {
            schema,
            storage,
            routes: HashMap::new(),
            context_provider: None,
            clock: Mutex::new(Clock::new(node)),
        })
    }

    /// Mount a route for its collection.
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes
            .insert(route.resource().to_string(), Arc::new(route));
        self
    }

    /// Install an async context provider.
    pub fn with_context_provider(mut self, provider: ContextProvider) -> Self {
        self.context_provider = Some(provider);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    fn route(&self, resource: &str) -> Result<&Arc<Route>> {
        self.routes
            .get(resource)
            .ok_or_else(|| AppError::InvalidResource(resource.to_string()))
    }

    async fn context(&self, raw: RawRequest) -> Result<Context> {
        match &self.context_provider {
            Some(provider) => provider(raw).await,
            None => Ok(Value::Null),
        }
    }

    /// Resolve the route for a query and run it.
    pub async fn handle_query(
        &self,
        request: QueryRequest,
        raw: RawRequest,
    ) -> Result<BTreeMap<RecordId, Record>> {
        let route = self.route(&request.resource)?;
        let ctx = self.context(raw).await?;
        let response = Arc::clone(route)
            .handle(
                RouteRequest::Query { request, ctx },
                Arc::clone(&self.storage),
                self.schema.clone(),
            )
            .await?;
        match response.data {
            ResponseData::Records(records) => Ok(records),
            _ => Err(AppError::Internal(
                "query produced a non-record response".to_string(),
            )),
        }
    }

    /// Resolve the route for a mutation, run it, and derive the
    /// broadcast event the transport should fan out after commit.
    pub async fn handle_mutation(
        &self,
        mutation: Mutation,
        raw: RawRequest,
    ) -> Result<(RouteResponse, Option<BroadcastEvent>)> {
        let route = self.route(mutation.resource())?;
        let ctx = self.context(raw).await?;

        let resource = mutation.resource().to_string();
        let resource_id = mutation.resource_id().map(str::to_string);
        let procedure = mutation.procedure().to_string();
        let timestamp = mutation.timestamp().cloned();
        let custom_input = match &mutation {
            Mutation::Custom(call) => Some(call.input.clone()),
            _ => None,
        };

        let response = Arc::clone(route)
            .handle(
                RouteRequest::Mutate { mutation, ctx },
                Arc::clone(&self.storage),
                self.schema.clone(),
            )
            .await?;

        let event = self.broadcast_event(
            route,
            resource,
            resource_id,
            procedure,
            timestamp,
            custom_input,
            &response,
        );
        Ok((response, event))
    }

    #[allow(clippy::too_many_arguments)]
    fn broadcast_event(
        &self,
        route: &Route,
        resource: String,
        resource_id: Option<RecordId>,
        procedure: String,
        timestamp: Option<Timestamp>,
        custom_input: Option<Value>,
        response: &RouteResponse,
    ) -> Option<BroadcastEvent> {
        match procedure.as_str() {
            "INSERT" | "UPDATE" => {
                // stale no-ops emit no broadcast
                let accepted = response.accepted_values.as_ref()?;
                let timestamp = timestamp?;
                let payload = accepted
                    .iter()
                    .map(|(name, value)| (name.clone(), EncodedField::from(value)))
                    .collect();
                Some(BroadcastEvent {
                    resource,
                    resource_id,
                    procedure,
                    payload,
                    input: None,
                    meta: MutationMeta { timestamp },
                })
            }
            _ => {
                if !route.broadcasts_custom(&procedure) {
                    return None;
                }
                let timestamp = self
                    .clock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .tick(chrono::Utc::now().timestamp_millis());
                Some(BroadcastEvent {
                    resource,
                    resource_id,
                    procedure,
                    payload: BTreeMap::new(),
                    input: custom_input,
                    meta: MutationMeta { timestamp },
                })
            }
        }
    }
}
