//! PromptCache Storage Layer
//!
//! This crate implements the storage side of PromptCache - the component
//! that keeps 128-token blocks of KV activation state in an object store
//! and answers hash-chain queries over them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐
//! │ gRPC service │
//! └──────┬───────┘
//!        │ Lookup / Read / Write
//!        ▼
//! ┌─────────────────┐
//! │   CacheEngine   │  one per (account URL, container)
//! │ - chain probe   │
//! │ - version merge │
//! │ - FIFO eviction │
//! └────────┬────────┘
//!          │ get / put / set-metadata / delete
//!          ▼
//! ┌─────────────────┐
//! │ dyn BlobStore   │  AzureBlobStore (REST) or MemoryBlobStore (tests)
//! └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### BlobStore
//! The minimal object-storage contract the engine consumes: properties
//! with metadata + etag, conditional upload, download, conditional
//! metadata update, delete. The engine never sees HTTP, credentials, or
//! retries - those live behind the trait.
//!
//! ### CacheEngine
//! The cache protocol itself:
//! - **Lookup**: probe every block name in parallel, then walk the parent
//!   chain sequentially and truncate at the first gap.
//! - **Read**: fetch one blob by exact location.
//! - **Write**: first-writer-wins upload, then sibling versioning with
//!   etag-guarded metadata merges for everyone else.
//!
//! ## Concurrency
//!
//! The engine holds no locks. Concurrent writers to the same canonical
//! name are serialized only at the metadata PATCH step by the store's etag
//! precondition; everything else is free-running I/O.

pub mod azure;
pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;

pub use azure::{AzureBlobStore, AzureCredentials, AzureStoreOpener};
pub use blob::{BlobMetadata, BlobProperties, BlobStore, BlobStoreOpener, DownloadedBlob};
pub use config::TransportConfig;
pub use engine::CacheEngine;
pub use error::{Result, StoreError};
pub use memory::{MemoryBlobStore, MemoryStoreOpener};
