//! PromptCache gRPC Server
//!
//! Provides the gRPC API for:
//! - Lookup (hash-chain prefix matching)
//! - Read (single-block fetch by location)
//! - Write (versioned block store)
//! - StreamingRead (pipelined reads with preserved ordering)

pub mod metrics;
pub mod service;

pub use service::PromptCacheService;
