use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Resource name cannot be empty")]
    EmptyResourceName,

    #[error("Container name cannot be empty")]
    EmptyContainerName,

    #[error("Failed to load configuration: {0}")]
    Config(String),

    #[error("Failed to fetch account config for '{resource_name}': {message}")]
    AccountFetch {
        resource_name: String,
        message: String,
    },

    #[error("Account config for '{resource_name}' is malformed: {message}")]
    AccountParse {
        resource_name: String,
        message: String,
    },

    #[error("No storage account found for region '{region}' in account '{resource_name}'")]
    RegionNotMapped {
        resource_name: String,
        region: String,
    },

    #[error("Failed to open blob store: {0}")]
    Store(#[from] promptcache_store::StoreError),
}
