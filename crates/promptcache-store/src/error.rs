//! Storage Error Types
//!
//! This module defines the error taxonomy for storage operations.
//!
//! ## Error Categories
//!
//! ### Expected protocol outcomes
//! - `NotFound`: blob absent - the common case during lookup probes
//! - `Conflict`: conditional create lost the race - expected on write
//! - `PreconditionFailed`: etag went stale - expected on metadata merge
//!
//! ### Failures
//! - `Transient`: I/O failure that survived the adapter's retries
//! - `InvalidChunk`: write rejected at the boundary (size mismatch)
//! - `Codec`: malformed stored metadata
//! - `Fatal`: everything else, surfaced verbatim
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, StoreError>`. This allows clean error propagation with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob already exists: {0}")]
    Conflict(String),

    #[error("Metadata precondition failed for blob: {0}")]
    PreconditionFailed(String),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Codec error: {0}")]
    Codec(#[from] promptcache_core::CodecError),

    #[error("Storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether this outcome is part of the write protocol rather than a
    /// failure (conditional create losing, etag going stale).
    pub fn is_expected_race(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::PreconditionFailed(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
