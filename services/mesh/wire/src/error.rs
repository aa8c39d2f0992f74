//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Frame with a zero length prefix (no type byte)
    #[error("empty frame")]
    Empty,

    /// Payload is not valid UTF-8
    #[error("payload is not utf-8")]
    Utf8,

    /// JSON payload could not be encoded or decoded
    #[error("json payload invalid: {0}")]
    Json(#[from] serde_json::Error),
}
