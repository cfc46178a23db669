//! Account resolvers.
//!
//! Both resolvers cache engines by `resourceName|containerName` behind a
//! read-mostly lock: resolution takes a read lock, and only a miss takes
//! the write lock with a double-check before creating the engine. Engines
//! live until process teardown.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use promptcache_store::{BlobStore, BlobStoreOpener, CacheEngine};

use crate::account::PromptAccountConfig;
use crate::config::ServiceConfig;
use crate::error::{ResolveError, Result};

/// Resolve `(resourceName, containerName)` to a shared cache engine.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve(
        &self,
        resource_name: &str,
        container_name: &str,
    ) -> Result<Arc<CacheEngine>>;
}

fn validate_names(resource_name: &str, container_name: &str) -> Result<()> {
    if resource_name.is_empty() {
        return Err(ResolveError::EmptyResourceName);
    }
    if container_name.is_empty() {
        return Err(ResolveError::EmptyContainerName);
    }
    Ok(())
}

fn cache_key(resource_name: &str, container_name: &str) -> String {
    format!("{resource_name}|{container_name}")
}

/// Resolver that builds account URLs textually from the resource name.
pub struct StaticResolver {
    url_scheme: String,
    domain_suffix: String,
    opener: Arc<dyn BlobStoreOpener>,
    engines: RwLock<HashMap<String, Arc<CacheEngine>>>,
}

impl StaticResolver {
    pub fn new(domain_suffix: &str, opener: Arc<dyn BlobStoreOpener>) -> Self {
        Self {
            url_scheme: "https".to_string(),
            domain_suffix: domain_suffix.to_string(),
            opener,
            engines: RwLock::new(HashMap::new()),
        }
    }

    fn account_url(&self, resource_name: &str) -> String {
        format!("{}://{}{}", self.url_scheme, resource_name, self.domain_suffix)
    }
}

#[async_trait]
impl AccountResolver for StaticResolver {
    async fn resolve(
        &self,
        resource_name: &str,
        container_name: &str,
    ) -> Result<Arc<CacheEngine>> {
        validate_names(resource_name, container_name)?;
        let key = cache_key(resource_name, container_name);

        {
            let engines = self.engines.read().await;
            if let Some(engine) = engines.get(&key) {
                return Ok(engine.clone());
            }
        }

        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(&key) {
            return Ok(engine.clone());
        }

        let account_url = self.account_url(resource_name);
        let store = self.opener.open(&account_url, container_name)?;
        let engine = Arc::new(CacheEngine::new(store, &account_url, container_name));
        engines.insert(key, engine.clone());

        info!(
            resource_name,
            container_name,
            account_url = %engine.account_url(),
            "Created cache engine"
        );
        Ok(engine)
    }
}

/// Resolver backed by per-tenant configuration documents in a meta
/// container.
///
/// Resolution fetches `{resourceName}.json` from the configuration store
/// (once per tenant, cached), selects the storage account mapped to this
/// instance's region, and binds an engine to it. The engine cache is
/// still keyed by the user-facing resource name, not the resolved
/// account.
pub struct DatabaseResolver {
    service_config: ServiceConfig,
    config_store: Arc<dyn BlobStore>,
    opener: Arc<dyn BlobStoreOpener>,
    account_configs: RwLock<HashMap<String, Arc<PromptAccountConfig>>>,
    engines: RwLock<HashMap<String, Arc<CacheEngine>>>,
}

impl DatabaseResolver {
    /// Connect to the configuration store named by `service_config`.
    pub fn new(service_config: ServiceConfig, opener: Arc<dyn BlobStoreOpener>) -> Result<Self> {
        let config_store = opener.open(
            &service_config.configuration_store_url(),
            &service_config.configuration_container,
        )?;

        info!(
            store = %service_config.configuration_store,
            container = %service_config.configuration_container,
            region = %service_config.current_location,
            "Database resolver initialized"
        );

        Ok(Self {
            service_config,
            config_store,
            opener,
            account_configs: RwLock::new(HashMap::new()),
            engines: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch_account_config(&self, resource_name: &str) -> Result<Arc<PromptAccountConfig>> {
        {
            let configs = self.account_configs.read().await;
            if let Some(config) = configs.get(resource_name) {
                debug!(resource_name, "Using cached account config");
                return Ok(config.clone());
            }
        }

        let blob_name = format!("{resource_name}.json");
        let blob = self
            .config_store
            .download(&blob_name)
            .await
            .map_err(|e| ResolveError::AccountFetch {
                resource_name: resource_name.to_string(),
                message: e.to_string(),
            })?;

        let content = std::str::from_utf8(&blob.body).map_err(|e| ResolveError::AccountParse {
            resource_name: resource_name.to_string(),
            message: e.to_string(),
        })?;
        let config = Arc::new(PromptAccountConfig::parse(resource_name, content)?);

        info!(
            resource_name,
            account = %config.prompt_account_name,
            regions = config.region_storage_map.len(),
            "Fetched account config"
        );

        let mut configs = self.account_configs.write().await;
        Ok(configs
            .entry(resource_name.to_string())
            .or_insert(config)
            .clone())
    }

    fn account_url(&self, storage_account: &str) -> String {
        format!(
            "https://{}{}",
            storage_account, self.service_config.domain_suffix
        )
    }
}

#[async_trait]
impl AccountResolver for DatabaseResolver {
    async fn resolve(
        &self,
        resource_name: &str,
        container_name: &str,
    ) -> Result<Arc<CacheEngine>> {
        validate_names(resource_name, container_name)?;
        let key = cache_key(resource_name, container_name);

        {
            let engines = self.engines.read().await;
            if let Some(engine) = engines.get(&key) {
                return Ok(engine.clone());
            }
        }

        // The config fetch may block on the network; do it before taking
        // the write lock so other tenants keep resolving.
        let account_config = self.fetch_account_config(resource_name).await?;
        let storage_account = account_config
            .storage_account_for(resource_name, &self.service_config.current_location)?;
        let account_url = self.account_url(storage_account);

        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(&key) {
            return Ok(engine.clone());
        }

        let store = self.opener.open(&account_url, container_name)?;
        let engine = Arc::new(CacheEngine::new(store, &account_url, container_name));
        engines.insert(key, engine.clone());

        info!(
            resource_name,
            storage_account,
            account_url = %engine.account_url(),
            container_name,
            "Created cache engine for tenant"
        );
        Ok(engine)
    }
}
