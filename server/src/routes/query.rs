use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query},
    Extension, Json,
};
use iqdb::{PostId, Signature, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::response::{ApiError, SignatureResponse};
use crate::utils;

const fn default_limit() -> usize {
    10
}

#[derive(Deserialize)]
pub struct QueryParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Serialize)]
pub struct QueryMatch {
    pub post_id: PostId,
    pub md5: String,
    pub score: f32,
    pub hash: String,
    pub signature: SignatureResponse,
}

/// `POST /query/{selector}`: find the most similar images. The selector
/// is `file` (multipart upload), a 32-digit md5 of an indexed image, or a
/// 533-digit `iqdb_` signature hash.
pub async fn post(
    Extension(db): Extension<Arc<RwLock<DB>>>,
    Path(selector): Path<String>,
    Query(QueryParams { limit }): Query<QueryParams>,
    form: Option<Multipart>,
) -> Result<Json<Vec<QueryMatch>>, ApiError> {
    // The upload comes off the wire before the index lock is taken.
    let file = if selector == "file" {
        let mut form = form.ok_or(ApiError::MissingFile)?;
        Some(utils::read_file_field(&mut form).await?)
    } else {
        None
    };

    let db = db.read().await;
    let signature = match file {
        Some(bytes) => Signature::from_blob(&bytes)?,
        None if selector.starts_with("iqdb_") => selector.parse()?,
        None if utils::is_md5(&selector) => {
            db.get_image_by_md5(&selector.to_ascii_lowercase())?
                .ok_or(ApiError::NoSuchImage)?
                .signature
        }
        None => return Err(ApiError::InvalidQuerySelector),
    };

    let matches = db.query(&signature, limit);
    let mut posts = Vec::with_capacity(matches.len());
    for found in matches {
        // The catalog supplies the md5 and stored signature for each hit.
        let Some(record) = db.get_image(found.post_id)? else {
            continue;
        };
        posts.push(QueryMatch {
            post_id: found.post_id,
            md5: record.md5,
            score: found.score,
            hash: record.signature.to_string(),
            signature: SignatureResponse::from(&record.signature),
        });
    }
    Ok(Json(posts))
}
