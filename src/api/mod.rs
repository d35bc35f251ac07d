//! HTTP API server

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod state;

pub use state::AppState;

/// Build the API router using the provided application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .nest(
            "/v1",
            Router::new()
                .route(
                    "/media/*name",
                    get(handlers::read_media)
                        .put(handlers::save_media)
                        .post(handlers::stream_media)
                        .delete(handlers::delete_media),
                )
                .route("/exists/*name", get(handlers::exists))
                .route("/size/*name", get(handlers::size))
                .route("/url/*name", get(handlers::url))
                .route("/list", get(handlers::list_root))
                .route("/list/*prefix", get(handlers::list)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
