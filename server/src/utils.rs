use axum::extract::Multipart;
use iqdb::PostId;
use md5::{Digest, Md5};

use crate::response::ApiError;

/// Lowercase hex md5 of a byte string.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

pub fn is_md5(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// How `/images/{selector}` addresses an image: 1-9 decimal digits are a
/// post id, exactly 32 hex digits are an md5.
pub enum Selector {
    Post(PostId),
    Md5(String),
}

pub fn parse_selector(value: &str) -> Option<Selector> {
    if !value.is_empty() && value.len() <= 9 && value.bytes().all(|b| b.is_ascii_digit()) {
        value.parse().ok().map(Selector::Post)
    } else if is_md5(value) {
        Some(Selector::Md5(value.to_ascii_lowercase()))
    } else {
        None
    }
}

/// Pull the `file` field out of a multipart body, wherever it appears.
pub async fn read_file_field(form: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|error| ApiError::InvalidForm(error.to_string()))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|error| ApiError::InvalidForm(error.to_string()))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::MissingFile)
}
