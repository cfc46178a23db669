//! Object-storage contract consumed by the cache engine.
//!
//! The engine depends on five operations and nothing else. Implementations
//! own their transport concerns (retries, pooling, credentials); callers
//! see only typed outcomes from [`crate::error::StoreError`].
//!
//! Blob metadata is a lowercased-key string map. Real object stores treat
//! metadata keys case-insensitively; normalizing on insert keeps every
//! lookup a plain `HashMap` hit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Case-normalized blob metadata.
///
/// Keys are lowercased on insert so `get("Hash")` and `get("hash")` agree,
/// matching how blob services fold metadata header names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMetadata {
    entries: HashMap<String, String>,
}

impl BlobMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Parse a metadata value as a decimal u64, defaulting to 0 when the
    /// key is absent or malformed. Stored hashes are written by this
    /// service, so malformed values indicate external tampering and are
    /// treated as missing.
    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for BlobMetadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Self::new();
        for (k, v) in iter {
            metadata.insert(k.as_ref(), v);
        }
        metadata
    }
}

/// Result of a properties fetch: metadata plus the etag guarding it.
#[derive(Debug, Clone)]
pub struct BlobProperties {
    pub metadata: BlobMetadata,
    pub etag: String,
}

/// Result of a download: body plus metadata.
#[derive(Debug, Clone)]
pub struct DownloadedBlob {
    pub body: Bytes,
    pub metadata: BlobMetadata,
}

/// Minimal object-storage interface.
///
/// One instance is bound to a single (account, container) pair. All
/// methods are safe to call concurrently.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch metadata and etag without the body.
    async fn get_properties(&self, name: &str) -> Result<BlobProperties>;

    /// Upload body + metadata. With `if_none_match_any` the upload only
    /// succeeds when no blob exists at `name`; losing that race returns
    /// `StoreError::Conflict`. Returns the new etag.
    async fn upload(
        &self,
        name: &str,
        body: Bytes,
        metadata: &BlobMetadata,
        if_none_match_any: bool,
    ) -> Result<String>;

    /// Download body and metadata.
    async fn download(&self, name: &str) -> Result<DownloadedBlob>;

    /// Replace the blob's metadata, conditional on `if_match_etag` still
    /// being current. A stale etag returns `StoreError::PreconditionFailed`.
    /// Returns the new etag.
    async fn set_metadata(
        &self,
        name: &str,
        metadata: &BlobMetadata,
        if_match_etag: &str,
    ) -> Result<String>;

    /// Delete the blob. Absence is reported as `StoreError::NotFound`,
    /// which callers on the eviction path swallow.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Factory for blob stores, the seam between account resolution and
/// storage. The resolver maps a resource name to an account URL and asks
/// an opener for a store bound to it; production uses the Azure opener,
/// tests substitute memory-backed stores.
pub trait BlobStoreOpener: Send + Sync {
    fn open(&self, account_url: &str, container_name: &str) -> Result<Arc<dyn BlobStore>>;
}
