use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "OPD token allocation engine is running" }))
        .nest("/tokens", token_routes())
        .route("/health", get(handlers::health))
        .with_state(state)
}

fn token_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/targeted", post(handlers::allocate_targeted))
        .route("/department", post(handlers::allocate_department))
        .route("/emergency", post(handlers::allocate_emergency))
        .route("/{token_id}/confirm", patch(handlers::confirm_token))
        .route("/{token_id}/complete", patch(handlers::complete_token))
        .route("/{token_id}/cancel", patch(handlers::cancel_token))
        .route("/{token_id}/noshow", patch(handlers::noshow_token))
}
