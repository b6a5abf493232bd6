use std::net::SocketAddr;
use std::sync::Arc;

use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use allocation_engine::{AllocationEngine, EngineBackgroundTasks, TracingEventSink};
use engine_config::EngineConfig;
use engine_store::InMemoryStore;
use slot_lifecycle::SlotLifecycle;

mod error;
mod handlers;
mod models;
mod router;
mod state;

use state::AppState;

#[tokio::main]
async fn main() {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting OPD token allocation API");

    // Load configuration and wire the engine's collaborators
    let config = EngineConfig::from_env();
    let store: Arc<dyn engine_store::Store> = Arc::new(InMemoryStore::new());
    let lifecycle = Arc::new(SlotLifecycle::new(store.clone()));
    let engine = Arc::new(AllocationEngine::new(
        store.clone(),
        Arc::new(config.clone()),
        config,
        Arc::new(TracingEventSink),
    ));

    // Start the midnight slot generator and the pending-reallocation sweeper
    let background = Arc::new(EngineBackgroundTasks::new(lifecycle, engine.clone()));
    background.clone().start();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create shared state
    let state = Arc::new(AppState { engine, background });

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
