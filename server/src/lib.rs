//! # Tether Server
//!
//! The authoritative side of the Tether live synchronization engine:
//! per-collection routes with middleware and authorization, transactional
//! storage adapters, a subscription registry with broadcast fan-out, and
//! WebSocket + HTTP transports.

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod route;
pub mod server;
pub mod storage;
pub mod subscriptions;
pub mod ws;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;

pub use config::Config;
pub use context::{bearer_context_provider, Context, ContextProvider, RawRequest};
pub use error::{AppError, Result};
pub use route::{
    AuthPolicy, CustomContext, CustomMutation, Middleware, Next, PolicyDecision, ResponseData,
    Route, RouteRequest, RouteResponse, UpdatePolicy,
};
pub use server::{BroadcastEvent, Server};
pub use storage::{MemoryStorage, PostgresStorage, Storage, StorageTransaction};
pub use subscriptions::SubscriptionRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
    pub registry: Arc<SubscriptionRegistry>,
}

impl AppState {
    pub fn new(server: Arc<Server>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { server, registry }
    }

    /// Run a mutation and fan out its broadcast under the commit lock, so
    /// every connection observes broadcasts in commit order.
    pub async fn execute_mutation(
        &self,
        mutation: tether_engine::Mutation,
        raw: RawRequest,
        exclude: Option<&str>,
    ) -> Result<RouteResponse> {
        let _ordering = self.registry.commit_lock().await;
        let (response, event) = self.server.handle_mutation(mutation, raw).await?;
        if let Some(event) = event {
            self.registry
                .fan_out(
                    &event,
                    self.server.storage(),
                    self.server.schema(),
                    exclude,
                )
                .await;
        }
        Ok(response)
    }
}

/// Assemble the full router: WebSocket endpoint plus the HTTP surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::websocket_handler))
        .merge(http::routes())
        .with_state(state)
}
