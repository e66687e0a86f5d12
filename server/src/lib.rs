use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use iqdb::DB;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

pub mod response;
pub mod routes;
pub mod utils;

pub use response::ApiError;

/// Build the service around one shared index. Every handler goes through
/// the same readers-writer lock: queries and status take shared access,
/// add/remove take it exclusively.
pub fn router(db: Arc<RwLock<DB>>) -> Router {
    Router::new()
        .route("/images", post(routes::images::post_auto))
        .route(
            "/images/:selector",
            post(routes::images::post).delete(routes::images::delete),
        )
        .route("/query/:selector", post(routes::query::post))
        .route("/status", get(routes::status::get))
        .layer(Extension(db))
        .layer(TraceLayer::new_for_http())
}
