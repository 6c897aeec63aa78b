//! Route modules for Stitch Server

pub mod frame;
pub mod health;
pub mod upload;
pub mod ws;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .merge(upload::router(state.config().storage.max_chunk_bytes))
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
