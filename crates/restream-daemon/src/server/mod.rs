//! HTTP API for uploading videos and managing their relays.

pub mod error;
pub mod routes;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::relay::StreamRegistry;
use crate::upload::UploadStore;

pub use error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: StreamRegistry,
    pub uploads: UploadStore,
    /// Body limit applied to `POST /upload`.
    pub max_upload_bytes: usize,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/upload", post(routes::upload).layer(upload_limit))
        .route("/streams", get(routes::list_streams))
        .route("/streams/stop-all", post(routes::stop_all_streams))
        .route("/streams/{id}", get(routes::get_stream))
        .route("/streams/{id}/stop", post(routes::stop_stream))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
