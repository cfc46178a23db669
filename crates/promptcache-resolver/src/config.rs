//! Service configuration.
//!
//! Loaded once from a JSON file at startup and immutable afterwards.
//! The file names the region this instance runs in and where tenant
//! account documents live:
//!
//! ```json
//! {
//!   "currentLocation": "westus2",
//!   "configurationStore": "promptmetastore",
//!   "configurationContainer": "accounts",
//!   "domainSuffix": ".blob.core.windows.net"
//! }
//! ```
//!
//! Missing required fields abort startup with the field named in the
//! error message.

use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, Result};

pub const DEFAULT_DOMAIN_SUFFIX: &str = ".blob.core.windows.net";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Region this service instance runs in, e.g. "eastus", "westus2".
    pub current_location: String,

    /// Storage account holding tenant configuration documents.
    pub configuration_store: String,

    /// Container within the configuration store.
    pub configuration_container: String,

    /// Suffix appended to account names when building URLs.
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,
}

fn default_domain_suffix() -> String {
    DEFAULT_DOMAIN_SUFFIX.to_string()
}

impl ServiceConfig {
    /// Load and validate a configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ResolveError::Config(format!("cannot read {path}: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ServiceConfig = serde_json::from_str(content)
            .map_err(|e| ResolveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (value, field) in [
            (&self.current_location, "currentLocation"),
            (&self.configuration_store, "configurationStore"),
            (&self.configuration_container, "configurationContainer"),
            (&self.domain_suffix, "domainSuffix"),
        ] {
            if value.is_empty() {
                return Err(ResolveError::Config(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Full URL of the configuration store account.
    pub fn configuration_store_url(&self) -> String {
        format!("https://{}{}", self.configuration_store, self.domain_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = ServiceConfig::parse(
            r#"{
                "currentLocation": "westus2",
                "configurationStore": "metastore",
                "configurationContainer": "accounts",
                "domainSuffix": ".blob.example.net"
            }"#,
        )
        .unwrap();

        assert_eq!(config.current_location, "westus2");
        assert_eq!(
            config.configuration_store_url(),
            "https://metastore.blob.example.net"
        );
    }

    #[test]
    fn test_domain_suffix_defaults() {
        let config = ServiceConfig::parse(
            r#"{
                "currentLocation": "eastus",
                "configurationStore": "metastore",
                "configurationContainer": "accounts"
            }"#,
        )
        .unwrap();
        assert_eq!(config.domain_suffix, DEFAULT_DOMAIN_SUFFIX);
    }

    #[test]
    fn test_missing_required_field_is_named() {
        let err = ServiceConfig::parse(
            r#"{
                "currentLocation": "",
                "configurationStore": "metastore",
                "configurationContainer": "accounts"
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("currentLocation is required"));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(ServiceConfig::parse("{not json").is_err());
    }
}
