//! Tether Server - live synchronization over an authoritative store.
//!
//! Serves the WebSocket sync protocol and the HTTP query/mutation
//! surface for the collections declared in the schema.

use std::sync::Arc;
use tether_engine::{Collection, LiveType, Relation, Schema};
use tether_server::{
    bearer_context_provider, router, AppState, Config, PostgresStorage, Route, Server,
    SubscriptionRegistry,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tether Server on {}:{}", config.host, config.port);

    let schema = board_schema()?;

    // Connect storage and derive the collection tables
    let storage = PostgresStorage::connect(&config.database_url, schema.clone()).await?;
    tracing::info!("Ensuring collection tables...");
    storage.ensure_tables().await?;

    let server = Server::new(schema, Arc::new(storage))?
        .with_context_provider(bearer_context_provider())
        .with_route(Route::new("groups"))
        .with_route(Route::new("cards"));

    let registry = SubscriptionRegistry::new_shared(config.auth_failure_limit);
    let state = AppState::new(Arc::new(server), registry);

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// The board demo schema: groups of cards, related both ways.
fn board_schema() -> Result<Schema, tether_engine::Error> {
    Schema::new()
        .with_collection(
            Collection::new("groups")
                .field("id", LiveType::Text)
                .field("name", LiveType::Text)
                .with_relation(Relation::many("cards", "cards", "groupId")),
        )?
        .with_collection(
            Collection::new("cards")
                .field("id", LiveType::Text)
                .field("title", LiveType::Text)
                .field("done", LiveType::Boolean)
                .field("groupId", LiveType::optional(LiveType::Reference))
                .with_relation(Relation::one("group", "groups").with_column("groupId")),
        )
}
