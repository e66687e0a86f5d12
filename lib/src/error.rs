use crate::PostId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the index and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The blob's magic bytes matched none of the supported image formats.
    #[error("unsupported image format")]
    UnsupportedFormat,
    /// The blob was recognized but could not be decoded.
    #[error("failed to decode image: {0}")]
    DecodeFailure(String),
    /// `post_id` is already present in the catalog.
    #[error("post #{0} already exists")]
    PostIdConflict(PostId),
    /// `md5` is already present in the catalog.
    #[error("md5 {0} already exists")]
    Md5Conflict(String),
    /// Malformed `iqdb_...` hash string.
    #[error("invalid signature hash")]
    InvalidHash,
    /// A signature blob that is not 240 bytes.
    #[error("invalid signature blob: {0} bytes")]
    BadSignatureBlob(usize),
    /// A catalog row whose columns do not match the `images` schema.
    #[error("malformed image record")]
    BadRow,
    /// Any other failure from the embedded store.
    #[error("sqlite error (code {code:?}): {}", .message.as_deref().unwrap_or("unknown"))]
    Storage {
        code: Option<isize>,
        message: Option<String>,
    },
    /// Catch-all for conditions the index has no better classification
    /// for.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlite::Error> for Error {
    fn from(error: sqlite::Error) -> Self {
        Error::Storage {
            code: error.code,
            message: error.message,
        }
    }
}
