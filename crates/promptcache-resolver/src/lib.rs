//! PromptCache Account Resolution
//!
//! Maps a tenant-facing resource name plus container name to a ready
//! [`promptcache_store::CacheEngine`], creating engines lazily and caching
//! them for the life of the process.
//!
//! Two strategies share the [`AccountResolver`] trait:
//!
//! - **StaticResolver** - the account URL is derived textually:
//!   `scheme://{resourceName}{domainSuffix}`. Used in tests and local
//!   development.
//! - **DatabaseResolver** - the resource name identifies a tenant prompt
//!   account whose configuration document lives in a meta storage
//!   container (`{resourceName}.json`). The document maps regions to
//!   storage accounts; the resolver picks the first account for the
//!   service's current region. Used at server startup.
//!
//! Engine caches are keyed by `resourceName|containerName` and use
//! read-mostly locks with double-checked creation, so steady-state
//! resolution is one read-lock acquisition.

pub mod account;
pub mod config;
pub mod error;
pub mod resolver;

pub use account::PromptAccountConfig;
pub use config::ServiceConfig;
pub use error::{ResolveError, Result};
pub use resolver::{AccountResolver, DatabaseResolver, StaticResolver};
