//! PromptCache Protocol Buffer definitions.
//!
//! Generated gRPC types for the `kvstore.KVStoreService` service.
//!
//! ## Client-side
//!
//! ```ignore
//! use promptcache_proto::kvstore::{
//!     kv_store_service_client::KvStoreServiceClient, LookupRequest,
//! };
//!
//! let mut client = KvStoreServiceClient::connect("http://localhost:50051").await?;
//! let response = client
//!     .lookup(LookupRequest {
//!         resource_name: "tenant-a".into(),
//!         container_name: "prompts".into(),
//!         tokens: prompt_tokens,
//!         precomputed_hashes: block_hashes,
//!         ..Default::default()
//!     })
//!     .await?;
//! ```
//!
//! ## Server-side
//!
//! ```ignore
//! use promptcache_proto::kvstore::kv_store_service_server::{
//!     KvStoreService, KvStoreServiceServer,
//! };
//! ```

pub mod kvstore {
    tonic::include_proto!("kvstore");
}

/// File descriptor set for gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("kvstore_descriptor");
