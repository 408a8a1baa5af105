//! Per-collection request handling.
//!
//! A route binds one collection: an ordered middleware chain, a map of
//! custom mutations, and an authorization policy with `read`, `insert`,
//! and `update` (pre/post) slots. Policies are pure functions over
//! `(ctx, value)` - all IO they need must be resolved by the context
//! provider beforehand.

use crate::context::Context;
use crate::error::{AppError, Result};
use crate::storage::Storage;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tether_engine::{
    CustomCall, EncodedField, FieldValue, LiveType, Mutation, MutationKind, QueryRequest, Record,
    RecordId, Schema, WhereClause, WriteMutation,
};

/// A request entering a route's pipeline.
pub enum RouteRequest {
    Query { request: QueryRequest, ctx: Context },
    Mutate { mutation: Mutation, ctx: Context },
}

/// The payload of a route response.
#[derive(Debug, Clone)]
pub enum ResponseData {
    /// Query result set
    Records(BTreeMap<RecordId, Record>),
    /// Post-merge record of a write mutation
    Record(Box<Record>),
    /// Custom mutation handler result
    Value(Value),
}

impl ResponseData {
    /// Flatten to plain JSON for the HTTP surface.
    pub fn to_value(&self) -> Value {
        match self {
            ResponseData::Records(records) => Value::Object(
                records
                    .iter()
                    .map(|(id, record)| {
                        (id.clone(), serde_json::to_value(record).unwrap_or_default())
                    })
                    .collect(),
            ),
            ResponseData::Record(record) => serde_json::to_value(record).unwrap_or_default(),
            ResponseData::Value(value) => value.clone(),
        }
    }
}

/// Route pipeline result: the data plus the fields actually written.
/// `accepted_values = None` marks a stale no-op mutation.
#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub data: ResponseData,
    pub accepted_values: Option<BTreeMap<String, FieldValue>>,
}

/// Outcome of an authorization policy slot.
pub enum PolicyDecision {
    Allow,
    Deny,
    /// A clause ANDed into the query (read) or required to hold on the
    /// record (insert/update)
    Where(WhereClause),
}

/// Pre-query policy over the request context.
pub type ReadPolicy = Arc<dyn Fn(&Context) -> PolicyDecision + Send + Sync>;

/// Record-level policy over `(ctx, inferred record)`.
pub type RecordPolicy = Arc<dyn Fn(&Context, &Value) -> PolicyDecision + Send + Sync>;

/// Pre- and post-image policies for updates.
#[derive(Clone, Default)]
pub struct UpdatePolicy {
    pub pre_mutation: Option<RecordPolicy>,
    pub post_mutation: Option<RecordPolicy>,
}

/// The three authorization slots of a route.
#[derive(Clone, Default)]
pub struct AuthPolicy {
    pub read: Option<ReadPolicy>,
    pub insert: Option<RecordPolicy>,
    pub update: UpdatePolicy,
}

/// Everything a custom mutation handler gets to work with. Owned, so
/// handlers are plain `'static` closures.
#[derive(Clone)]
pub struct CustomContext {
    pub storage: Arc<dyn Storage>,
    pub schema: Schema,
    pub ctx: Context,
    pub resource: String,
    pub resource_id: Option<String>,
    pub input: Value,
}

/// Handler of a route-declared custom mutation.
pub type CustomHandler =
    Arc<dyn Fn(CustomContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A custom mutation: input schema, handler, and its broadcast contract.
#[derive(Clone)]
pub struct CustomMutation {
    /// Declared input fields, validated before dispatch
    pub input: BTreeMap<String, LiveType>,
    pub handler: CustomHandler,
    /// Whether acceptance is pushed to subscribers of the resource
    pub broadcast: bool,
}

/// Continuation handed to a middleware.
pub type Next = Box<dyn FnOnce(RouteRequest) -> BoxFuture<'static, Result<RouteResponse>> + Send>;

/// A middleware decides whether and how to call `next`.
pub type Middleware =
    Arc<dyn Fn(RouteRequest, Next) -> BoxFuture<'static, Result<RouteResponse>> + Send + Sync>;

/// Request handling for one collection.
pub struct Route {
    resource: String,
    middlewares: Vec<Middleware>,
    customs: HashMap<String, CustomMutation>,
    policy: AuthPolicy,
}

impl Route {
    /// Create a route for a collection.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            middlewares: Vec::new(),
            customs: HashMap::new(),
            policy: AuthPolicy::default(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Append a middleware; the first added runs outermost.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Declare a custom mutation.
    pub fn with_mutation(mut self, name: impl Into<String>, mutation: CustomMutation) -> Self {
        self.customs.insert(name.into(), mutation);
        self
    }

    /// Install the authorization policy.
    pub fn with_policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether an accepted custom mutation is broadcast to subscribers.
    pub fn broadcasts_custom(&self, procedure: &str) -> bool {
        self.customs
            .get(procedure)
            .map(|custom| custom.broadcast)
            .unwrap_or(false)
    }

    /// Run a request through the middleware chain into the base handler.
    pub async fn handle(
        self: Arc<Self>,
        request: RouteRequest,
        storage: Arc<dyn Storage>,
        schema: Schema,
    ) -> Result<RouteResponse> {
        dispatch(self, 0, request, storage, schema).await
    }

    async fn base_handler(
        &self,
        request: RouteRequest,
        storage: &Arc<dyn Storage>,
        schema: &Schema,
    ) -> Result<RouteResponse> {
        match request {
            RouteRequest::Query { request, ctx } => {
                self.handle_query(request, &ctx, storage.as_ref()).await
            }
            RouteRequest::Mutate { mutation, ctx } => match mutation {
                Mutation::Custom(call) => self.handle_custom(call, ctx, storage, schema).await,
                Mutation::Insert(write) => {
                    self.handle_insert(write, &ctx, storage.as_ref(), schema).await
                }
                Mutation::Update(write) => {
                    self.handle_update(write, &ctx, storage.as_ref(), schema).await
                }
            },
        }
    }

    async fn handle_query(
        &self,
        request: QueryRequest,
        ctx: &Context,
        storage: &dyn Storage,
    ) -> Result<RouteResponse> {
        let effective = match self.policy.read.as_ref().map(|policy| policy(ctx)) {
            // denial fails before storage is touched
            Some(PolicyDecision::Deny) => return Err(AppError::Unauthorized),
            Some(PolicyDecision::Where(clause)) => Some(match request.filter.clone() {
                Some(user) => user.and(clause),
                None => clause,
            }),
            Some(PolicyDecision::Allow) | None => request.filter.clone(),
        };
        let data = storage
            .raw_find(
                &request.resource,
                effective.as_ref(),
                request.include.as_ref(),
                request.limit,
            )
            .await?;
        Ok(RouteResponse {
            data: ResponseData::Records(data),
            accepted_values: None,
        })
    }

    async fn handle_insert(
        &self,
        write: WriteMutation,
        ctx: &Context,
        storage: &dyn Storage,
        schema: &Schema,
    ) -> Result<RouteResponse> {
        let mut tx = storage.begin().await?;
        if tx
            .raw_find_by_id(&write.resource, &write.resource_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(write.resource_id));
        }

        let mut input = write.payload;
        input.entry("id".to_string()).or_insert_with(|| {
            EncodedField::new(
                Value::String(write.resource_id.clone()),
                write.meta.timestamp.clone(),
            )
        });
        let (record, accepted) =
            schema.merge_mutation(&write.resource, MutationKind::Insert, &input, None)?;

        let record = tx
            .raw_insert(&write.resource, &write.resource_id, &record)
            .await?;
        if let Some(policy) = &self.policy.insert {
            // evaluated against the inferred record, id backfilled;
            // failure aborts the transaction
            check_record_policy(policy, ctx, &record.infer())?;
        }
        tx.commit().await?;

        Ok(RouteResponse {
            data: ResponseData::Record(Box::new(record)),
            accepted_values: accepted,
        })
    }

    async fn handle_update(
        &self,
        write: WriteMutation,
        ctx: &Context,
        storage: &dyn Storage,
        schema: &Schema,
    ) -> Result<RouteResponse> {
        let mut tx = storage.begin().await?;
        let target = tx
            .raw_find_by_id(&write.resource, &write.resource_id)
            .await?
            .ok_or_else(|| AppError::NotFound(write.resource_id.clone()))?;

        if let Some(policy) = &self.policy.update.pre_mutation {
            check_record_policy(policy, ctx, &target.infer())?;
        }

        let (merged, accepted) = schema.merge_mutation(
            &write.resource,
            MutationKind::Update,
            &write.payload,
            Some(&target),
        )?;
        let Some(accepted_fields) = accepted else {
            // entirely stale: nothing written, nothing broadcast
            tx.rollback().await?;
            return Ok(RouteResponse {
                data: ResponseData::Record(Box::new(target)),
                accepted_values: None,
            });
        };

        let updated = tx
            .raw_update(&write.resource, &write.resource_id, &accepted_fields)
            .await?;
        if let Some(policy) = &self.policy.update.post_mutation {
            check_record_policy(policy, ctx, &merged.infer())?;
        }
        tx.commit().await?;

        Ok(RouteResponse {
            data: ResponseData::Record(Box::new(updated)),
            accepted_values: Some(accepted_fields),
        })
    }

    async fn handle_custom(
        &self,
        call: CustomCall,
        ctx: Context,
        storage: &Arc<dyn Storage>,
        schema: &Schema,
    ) -> Result<RouteResponse> {
        let custom = self
            .customs
            .get(&call.procedure)
            .ok_or_else(|| AppError::NotFound(format!("unknown mutation {}", call.procedure)))?;
        tether_engine::validate_input(&custom.input, &call.input)?;

        let value = (custom.handler)(CustomContext {
            storage: Arc::clone(storage),
            schema: schema.clone(),
            ctx,
            resource: call.resource,
            resource_id: call.resource_id,
            input: call.input,
        })
        .await?;

        Ok(RouteResponse {
            data: ResponseData::Value(value),
            accepted_values: None,
        })
    }
}

/// Run the chain from `index`; owns everything so middlewares are plain
/// `'static` closures.
fn dispatch(
    route: Arc<Route>,
    index: usize,
    request: RouteRequest,
    storage: Arc<dyn Storage>,
    schema: Schema,
) -> BoxFuture<'static, Result<RouteResponse>> {
    Box::pin(async move {
        if let Some(middleware) = route.middlewares.get(index).cloned() {
            let next_route = Arc::clone(&route);
            let next_storage = Arc::clone(&storage);
            let next_schema = schema.clone();
            let next: Next = Box::new(move |request| {
                dispatch(next_route, index + 1, request, next_storage, next_schema)
            });
            middleware(request, next).await
        } else {
            route.base_handler(request, &storage, &schema).await
        }
    })
}

fn check_record_policy(policy: &RecordPolicy, ctx: &Context, record: &Value) -> Result<()> {
    match policy(ctx, record) {
        PolicyDecision::Allow => Ok(()),
        PolicyDecision::Deny => Err(AppError::Unauthorized),
        PolicyDecision::Where(clause) if clause.matches(record) => Ok(()),
        PolicyDecision::Where(_) => Err(AppError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_engine::{Collection, MutationMeta, Timestamp};

    fn test_schema() -> Schema {
        Schema::new()
            .with_collection(
                Collection::new("tickets")
                    .field("id", LiveType::Text)
                    .field("status", LiveType::Text)
                    .field("ownerId", LiveType::Text),
            )
            .unwrap()
    }

    struct Rig {
        route: Arc<Route>,
        storage: Arc<dyn Storage>,
        schema: Schema,
    }

    impl Rig {
        fn new(route: Route) -> Self {
            let schema = test_schema();
            Self {
                route: Arc::new(route),
                storage: Arc::new(MemoryStorage::new(schema.clone())),
                schema,
            }
        }

        async fn run(&self, request: RouteRequest) -> Result<RouteResponse> {
            Arc::clone(&self.route)
                .handle(request, Arc::clone(&self.storage), self.schema.clone())
                .await
        }

        async fn seed(&self) {
            for (id, status, owner) in [("t1", "open", "u1"), ("t2", "open", "u2")] {
                self.run(RouteRequest::Mutate {
                    mutation: Mutation::Insert(write(
                        id,
                        &[("status", json!(status)), ("ownerId", json!(owner))],
                        "T1",
                    )),
                    ctx: Value::Null,
                })
                .await
                .unwrap();
            }
        }
    }

    fn write(id: &str, fields: &[(&str, Value)], stamp: &str) -> WriteMutation {
        WriteMutation {
            resource: "tickets".to_string(),
            resource_id: id.to_string(),
            payload: fields
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        EncodedField::new(value.clone(), Timestamp::new(stamp)),
                    )
                })
                .collect(),
            meta: MutationMeta {
                timestamp: Timestamp::new(stamp),
            },
        }
    }

    fn ctx(user: &str) -> Context {
        json!({ "userId": user })
    }

    #[tokio::test]
    async fn read_policy_ands_its_clause() {
        let rig = Rig::new(Route::new("tickets").with_policy(AuthPolicy {
            read: Some(Arc::new(|ctx| {
                PolicyDecision::Where(WhereClause::eq("ownerId", ctx["userId"].clone()))
            })),
            ..Default::default()
        }));
        rig.seed().await;

        let response = rig
            .run(RouteRequest::Query {
                request: QueryRequest {
                    resource: "tickets".to_string(),
                    filter: Some(WhereClause::eq("status", json!("open"))),
                    include: None,
                    limit: None,
                },
                ctx: ctx("u1"),
            })
            .await
            .unwrap();

        let ResponseData::Records(records) = response.data else {
            panic!("expected records");
        };
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["t1"]);
    }

    #[tokio::test]
    async fn read_policy_deny_fails_before_storage() {
        let rig = Rig::new(Route::new("tickets").with_policy(AuthPolicy {
            read: Some(Arc::new(|_| PolicyDecision::Deny)),
            ..Default::default()
        }));

        let result = rig
            .run(RouteRequest::Query {
                request: QueryRequest::resource("tickets"),
                ctx: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn insert_policy_aborts_the_transaction() {
        let rig = Rig::new(Route::new("tickets").with_policy(AuthPolicy {
            insert: Some(Arc::new(|ctx, _record| {
                PolicyDecision::Where(WhereClause::eq("ownerId", ctx["userId"].clone()))
            })),
            ..Default::default()
        }));

        // owned by someone else: rejected, nothing persisted
        let result = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Insert(write(
                    "t9",
                    &[("status", json!("open")), ("ownerId", json!("u2"))],
                    "T1",
                )),
                ctx: ctx("u1"),
            })
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
        assert!(rig
            .storage
            .raw_find_by_id("tickets", "t9", None)
            .await
            .unwrap()
            .is_none());

        // owned by the caller: accepted
        let response = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Insert(write(
                    "t9",
                    &[("status", json!("open")), ("ownerId", json!("u1"))],
                    "T2",
                )),
                ctx: ctx("u1"),
            })
            .await
            .unwrap();
        assert!(response.accepted_values.is_some());
    }

    #[tokio::test]
    async fn insert_of_existing_id_conflicts() {
        let rig = Rig::new(Route::new("tickets"));
        rig.seed().await;

        let result = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Insert(write("t1", &[("status", json!("open"))], "T9")),
                ctx: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn update_runs_pre_and_post_policies() {
        let rig = Rig::new(Route::new("tickets").with_policy(AuthPolicy {
            update: UpdatePolicy {
                pre_mutation: Some(Arc::new(|ctx, record| {
                    if record["ownerId"] == ctx["userId"] {
                        PolicyDecision::Allow
                    } else {
                        PolicyDecision::Deny
                    }
                })),
                // post-image must stay within the allowed states
                post_mutation: Some(Arc::new(|_, _record| {
                    PolicyDecision::Where(
                        WhereClause::parse(&json!({"status": {"$in": ["open", "closed"]}}))
                            .expect("static clause"),
                    )
                })),
            },
            ..Default::default()
        }));
        rig.seed().await;

        // not the owner
        let result = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Update(write("t2", &[("status", json!("closed"))], "T2")),
                ctx: ctx("u1"),
            })
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));

        // the owner, valid post-image
        let response = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Update(write("t1", &[("status", json!("closed"))], "T2")),
                ctx: ctx("u1"),
            })
            .await
            .unwrap();
        assert!(response.accepted_values.is_some());

        // invalid post-image aborts, leaving the committed state intact
        let result = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Update(write("t1", &[("status", json!("weird"))], "T3")),
                ctx: ctx("u1"),
            })
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
        let current = rig
            .storage
            .raw_find_by_id("tickets", "t1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.infer()["status"], json!("closed"));
    }

    #[tokio::test]
    async fn stale_update_is_a_reported_no_op() {
        let rig = Rig::new(Route::new("tickets"));
        rig.seed().await;

        let response = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Update(write("t1", &[("status", json!("old"))], "T0")),
                ctx: Value::Null,
            })
            .await
            .unwrap();
        assert!(response.accepted_values.is_none());

        let current = rig
            .storage
            .raw_find_by_id("tickets", "t1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.infer()["status"], json!("open"));
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let rig = Rig::new(Route::new("tickets"));

        let result = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Update(write("ghost", &[("status", json!("x"))], "T1")),
                ctx: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn middleware_chain_runs_outermost_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let make = |label: &'static str, order: Arc<std::sync::Mutex<Vec<&'static str>>>| {
            let middleware: Middleware = Arc::new(move |request, next| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    next(request).await
                })
            });
            middleware
        };

        let rig = Rig::new(
            Route::new("tickets")
                .with_middleware(make("outer", Arc::clone(&order)))
                .with_middleware(make("inner", Arc::clone(&order))),
        );

        rig.run(RouteRequest::Query {
            request: QueryRequest::resource("tickets"),
            ctx: Value::Null,
        })
        .await
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = Arc::clone(&hits);

        let blocker: Middleware = Arc::new(move |_request, _next| {
            hits_inner.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(AppError::Unauthorized) })
        });
        let rig = Rig::new(Route::new("tickets").with_middleware(blocker));

        let result = rig
            .run(RouteRequest::Query {
                request: QueryRequest::resource("tickets"),
                ctx: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_mutation_validates_and_dispatches() {
        let handler: CustomHandler = Arc::new(|call| {
            Box::pin(async move {
                Ok(json!({
                    "echo": call.input["reason"],
                    "target": call.resource_id,
                }))
            })
        });
        let rig = Rig::new(Route::new("tickets").with_mutation(
            "archive",
            CustomMutation {
                input: [("reason".to_string(), LiveType::Text)]
                    .into_iter()
                    .collect(),
                handler,
                broadcast: false,
            },
        ));

        let call = |input: Value| RouteRequest::Mutate {
            mutation: Mutation::Custom(CustomCall {
                resource: "tickets".to_string(),
                resource_id: Some("t1".to_string()),
                procedure: "archive".to_string(),
                input,
            }),
            ctx: Value::Null,
        };

        let response = rig.run(call(json!({"reason": "done"}))).await.unwrap();
        let ResponseData::Value(value) = response.data else {
            panic!("expected value");
        };
        assert_eq!(value["echo"], json!("done"));

        // invalid input never reaches the handler
        let result = rig.run(call(json!({}))).await;
        assert!(matches!(
            result,
            Err(AppError::Engine(tether_engine::Error::MissingField(_)))
        ));

        // unknown procedure
        let result = rig
            .run(RouteRequest::Mutate {
                mutation: Mutation::Custom(CustomCall {
                    resource: "tickets".to_string(),
                    resource_id: None,
                    procedure: "vanish".to_string(),
                    input: json!({}),
                }),
                ctx: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
