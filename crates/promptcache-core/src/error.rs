//! Codec error types.
//!
//! All codec operations return `Result<T>` aliased to
//! `Result<T, CodecError>` so callers can propagate with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid base64 in block name: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Block name decodes to {0} bytes, expected a multiple of 4")]
    TruncatedBlockName(usize),

    #[error("Malformed version list: {0}")]
    MalformedVersionList(String),
}
