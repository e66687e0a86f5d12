use std::sync::Arc;

use axum::{Extension, Json};
use iqdb::{PostId, DB};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Serialize)]
pub struct StatusResponse {
    pub image_count: usize,
    pub last_post_id: PostId,
}

/// `GET /status`
pub async fn get(Extension(db): Extension<Arc<RwLock<DB>>>) -> Json<StatusResponse> {
    let db = db.read().await;
    Json(StatusResponse {
        image_count: db.image_count(),
        last_post_id: db.last_post_id(),
    })
}
