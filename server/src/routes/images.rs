use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query},
    Extension, Json,
};
use iqdb::{PostId, Signature, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::response::{ApiError, SignatureResponse};
use crate::utils::{self, Selector};

#[derive(Deserialize)]
pub struct AddParams {
    pub md5: Option<String>,
}

#[derive(Serialize)]
pub struct AddResponse {
    pub post_id: PostId,
    pub md5: String,
    pub hash: String,
    pub signature: SignatureResponse,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub post_id: PostId,
    pub md5: String,
}

/// `POST /images/{post_id}`: add or replace the image under `post_id`.
pub async fn post(
    Extension(db): Extension<Arc<RwLock<DB>>>,
    Path(post_id): Path<String>,
    Query(AddParams { md5 }): Query<AddParams>,
    mut form: Multipart,
) -> Result<Json<AddResponse>, ApiError> {
    let post_id: PostId = post_id
        .parse()
        .ok()
        .filter(|&id| id > 0)
        .ok_or(ApiError::InvalidPostId)?;
    let (md5, signature) = ingest(md5, &mut form).await?;

    let mut db = db.write().await;
    db.add(post_id, &md5, &signature, true)?;
    Ok(Json(respond(post_id, md5, signature)))
}

/// `POST /images`: add under the next free post id, never replacing.
pub async fn post_auto(
    Extension(db): Extension<Arc<RwLock<DB>>>,
    Query(AddParams { md5 }): Query<AddParams>,
    mut form: Multipart,
) -> Result<Json<AddResponse>, ApiError> {
    let (md5, signature) = ingest(md5, &mut form).await?;

    // The id is picked under the write lock so concurrent adds cannot race
    // to the same one.
    let mut db = db.write().await;
    let post_id = db.last_post_id() + 1;
    db.add(post_id, &md5, &signature, false)?;
    Ok(Json(respond(post_id, md5, signature)))
}

/// `DELETE /images/{selector}`: remove by post id or md5.
pub async fn delete(
    Extension(db): Extension<Arc<RwLock<DB>>>,
    Path(selector): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let selector = utils::parse_selector(&selector).ok_or(ApiError::InvalidSelector)?;

    let mut db = db.write().await;
    let record = match &selector {
        Selector::Post(post_id) => db.get_image(*post_id)?,
        Selector::Md5(md5) => db.get_image_by_md5(md5)?,
    };
    let record = record.ok_or_else(|| match selector {
        Selector::Post(post_id) => ApiError::NotFound(format!("post_id: {post_id}")),
        Selector::Md5(md5) => ApiError::NotFound(format!("md5: {md5}")),
    })?;
    db.remove_by_post(record.post_id)?;

    Ok(Json(DeleteResponse {
        post_id: record.post_id,
        md5: record.md5,
    }))
}

/// Read the upload, settle the md5 (client-supplied or computed) and
/// fingerprint the bytes. No lock is held during any of this.
async fn ingest(
    md5: Option<String>,
    form: &mut Multipart,
) -> Result<(String, Signature), ApiError> {
    let bytes = utils::read_file_field(form).await?;
    let md5 = match md5 {
        Some(md5) => {
            let md5 = md5.to_ascii_lowercase();
            if !utils::is_md5(&md5) {
                return Err(ApiError::InvalidMd5);
            }
            md5
        }
        None => utils::md5_hex(&bytes),
    };
    let signature = Signature::from_blob(&bytes)?;
    Ok((md5, signature))
}

fn respond(post_id: PostId, md5: String, signature: Signature) -> AddResponse {
    AddResponse {
        post_id,
        md5,
        hash: signature.to_string(),
        signature: SignatureResponse::from(&signature),
    }
}
