use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use iqdb::Signature;
use serde::Serialize;

/// Every failed request serializes as `{"error": "..."}` with a status
/// matching the error kind.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request requires a `file` multipart param")]
    MissingFile,
    #[error("failed to read multipart body: {0}")]
    InvalidForm(String),
    #[error("post_id must be greater than 0")]
    InvalidPostId,
    #[error("md5 must be a 32-digit hex string")]
    InvalidMd5,
    #[error("invalid selector; supply an integer post_id or a 32-digit md5 hash")]
    InvalidSelector,
    #[error(
        "invalid selector; supply `file` with an image file, a 32-digit md5 hash, \
         or a 533-digit hash starting with `iqdb_`"
    )]
    InvalidQuerySelector,
    #[error("image does not exist in database ({0})")]
    NotFound(String),
    #[error("couldn't find image from supplied hash")]
    NoSuchImage,
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Core(#[from] iqdb::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) | ApiError::NoSuchImage => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Core(error) => match error {
                iqdb::Error::Storage { .. }
                | iqdb::Error::Internal(_)
                | iqdb::Error::BadRow
                | iqdb::Error::BadSignatureBlob(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// The JSON form of a signature: `{"avglf": [..3], "sig": [[..40]; 3]}`.
#[derive(Serialize)]
pub struct SignatureResponse {
    pub avglf: [f64; 3],
    pub sig: Vec<Vec<i16>>,
}

impl From<&Signature> for SignatureResponse {
    fn from(signature: &Signature) -> Self {
        Self {
            avglf: signature.avglf,
            sig: signature.sig.iter().map(|row| row.to_vec()).collect(),
        }
    }
}
