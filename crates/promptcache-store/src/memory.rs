//! In-memory blob store.
//!
//! Implements the full `BlobStore` contract - including conditional
//! creates and etag-guarded metadata updates - against a `HashMap`. Used
//! by the test suites and by local development mode, where no real blob
//! account is reachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::blob::{BlobMetadata, BlobProperties, BlobStore, BlobStoreOpener, DownloadedBlob};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
struct StoredBlob {
    body: Bytes,
    metadata: BlobMetadata,
    etag: String,
}

/// A `BlobStore` over process memory with real precondition semantics.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, StoredBlob>>,
    etag_counter: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        format!("\"etag-{}\"", self.etag_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of blobs currently stored (test helper).
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_properties(&self, name: &str) -> Result<BlobProperties> {
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(BlobProperties {
            metadata: blob.metadata.clone(),
            etag: blob.etag.clone(),
        })
    }

    async fn upload(
        &self,
        name: &str,
        body: Bytes,
        metadata: &BlobMetadata,
        if_none_match_any: bool,
    ) -> Result<String> {
        let mut blobs = self.blobs.write().await;
        if if_none_match_any && blobs.contains_key(name) {
            return Err(StoreError::Conflict(name.to_string()));
        }
        let etag = self.next_etag();
        blobs.insert(
            name.to_string(),
            StoredBlob {
                body,
                metadata: metadata.clone(),
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn download(&self, name: &str) -> Result<DownloadedBlob> {
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(DownloadedBlob {
            body: blob.body.clone(),
            metadata: blob.metadata.clone(),
        })
    }

    async fn set_metadata(
        &self,
        name: &str,
        metadata: &BlobMetadata,
        if_match_etag: &str,
    ) -> Result<String> {
        let mut blobs = self.blobs.write().await;
        let blob = blobs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if blob.etag != if_match_etag {
            return Err(StoreError::PreconditionFailed(name.to_string()));
        }
        blob.metadata = metadata.clone();
        blob.etag = self.next_etag();
        Ok(blob.etag.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        blobs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

/// Opener that hands out memory stores, one per (account URL, container),
/// shared across calls so resolver caching tests observe stable identity.
#[derive(Default)]
pub struct MemoryStoreOpener {
    stores: Mutex<HashMap<String, Arc<MemoryBlobStore>>>,
}

impl MemoryStoreOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStoreOpener for MemoryStoreOpener {
    fn open(&self, account_url: &str, container_name: &str) -> Result<Arc<dyn BlobStore>> {
        let key = format!("{account_url}|{container_name}");
        let mut stores = self.stores.lock().expect("opener lock");
        let store = stores
            .entry(key)
            .or_insert_with(|| Arc::new(MemoryBlobStore::new()))
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> BlobMetadata {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let store = MemoryBlobStore::new();
        let body = Bytes::from_static(b"kv-state");
        store
            .upload("blob-a", body.clone(), &metadata(&[("hash", "7")]), true)
            .await
            .unwrap();

        let downloaded = store.download("blob-a").await.unwrap();
        assert_eq!(downloaded.body, body);
        assert_eq!(downloaded.metadata.get("hash"), Some("7"));
    }

    #[tokio::test]
    async fn test_conditional_create_conflicts_on_existing() {
        let store = MemoryBlobStore::new();
        store
            .upload("blob-a", Bytes::new(), &BlobMetadata::new(), true)
            .await
            .unwrap();

        let err = store
            .upload("blob-a", Bytes::new(), &BlobMetadata::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Unconditional upload overwrites
        store
            .upload("blob-a", Bytes::from_static(b"v2"), &BlobMetadata::new(), false)
            .await
            .unwrap();
        assert_eq!(store.download("blob-a").await.unwrap().body, &b"v2"[..]);
    }

    #[tokio::test]
    async fn test_set_metadata_requires_current_etag() {
        let store = MemoryBlobStore::new();
        let etag = store
            .upload("blob-a", Bytes::new(), &BlobMetadata::new(), true)
            .await
            .unwrap();

        // Stale etag fails
        let err = store
            .set_metadata("blob-a", &metadata(&[("k", "v")]), "\"etag-999\"")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        // Current etag succeeds and rotates the etag
        let new_etag = store
            .set_metadata("blob-a", &metadata(&[("k", "v")]), &etag)
            .await
            .unwrap();
        assert_ne!(new_etag, etag);

        let err = store
            .set_metadata("blob-a", &metadata(&[("k", "v2")]), &etag)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryBlobStore::new();
        assert!(store.delete("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_opener_shares_store_per_account() {
        let opener = MemoryStoreOpener::new();
        let a1 = opener.open("https://acct", "prompts").unwrap();
        let a2 = opener.open("https://acct", "prompts").unwrap();
        let b = opener.open("https://acct", "other").unwrap();

        a1.upload("blob", Bytes::new(), &BlobMetadata::new(), true)
            .await
            .unwrap();
        assert!(a2.get_properties("blob").await.is_ok());
        assert!(b.get_properties("blob").await.unwrap_err().is_not_found());
    }
}
