//! Route definitions for the sync engine service.

use axum::{
    Router,
    routing::{get, post}
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Creates the Axum router with all routes configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/sync-connection", post(handlers::sync_connection))
        .route("/index-repo", post(handlers::index_repo))
        .route("/rebuild-permissions", post(handlers::rebuild_permissions));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
