//! Tenant account configuration documents.
//!
//! One JSON document per tenant, stored at
//! `{configurationStore}/{configurationContainer}/{resourceName}.json`:
//!
//! ```json
//! {
//!   "promptAccountId": "5f1c...",
//!   "promptAccountName": "tenant-a",
//!   "location": "westus2",
//!   "kind": "prompt",
//!   "regionStorageMap": {
//!     "westus2": ["tenantawest1", "tenantawest2"],
//!     "eastus":  ["tenantaeast1"]
//!   }
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAccountConfig {
    #[serde(default)]
    pub prompt_account_id: String,
    #[serde(default)]
    pub prompt_account_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub kind: String,
    pub region_storage_map: HashMap<String, Vec<String>>,
}

impl PromptAccountConfig {
    pub fn parse(resource_name: &str, content: &str) -> Result<Self> {
        let config: PromptAccountConfig =
            serde_json::from_str(content).map_err(|e| ResolveError::AccountParse {
                resource_name: resource_name.to_string(),
                message: e.to_string(),
            })?;

        if config.region_storage_map.is_empty() {
            return Err(ResolveError::AccountParse {
                resource_name: resource_name.to_string(),
                message: "regionStorageMap is empty".to_string(),
            });
        }
        Ok(config)
    }

    /// First storage account mapped to `region`.
    pub fn storage_account_for(&self, resource_name: &str, region: &str) -> Result<&str> {
        self.region_storage_map
            .get(region)
            .and_then(|accounts| accounts.first())
            .map(String::as_str)
            .ok_or_else(|| ResolveError::RegionNotMapped {
                resource_name: resource_name.to_string(),
                region: region.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "promptAccountId": "id-1",
        "promptAccountName": "tenant-a",
        "location": "westus2",
        "kind": "prompt",
        "regionStorageMap": {
            "westus2": ["tenantawest1", "tenantawest2"],
            "eastus": []
        }
    }"#;

    #[test]
    fn test_parse_and_select_region() {
        let config = PromptAccountConfig::parse("tenant-a", DOC).unwrap();
        assert_eq!(config.prompt_account_name, "tenant-a");
        assert_eq!(
            config.storage_account_for("tenant-a", "westus2").unwrap(),
            "tenantawest1"
        );
    }

    #[test]
    fn test_unmapped_region_errors() {
        let config = PromptAccountConfig::parse("tenant-a", DOC).unwrap();
        let err = config
            .storage_account_for("tenant-a", "northeurope")
            .unwrap_err();
        assert!(err.to_string().contains("northeurope"));
    }

    #[test]
    fn test_empty_account_list_errors() {
        let config = PromptAccountConfig::parse("tenant-a", DOC).unwrap();
        assert!(config.storage_account_for("tenant-a", "eastus").is_err());
    }

    #[test]
    fn test_empty_region_map_rejected() {
        let err =
            PromptAccountConfig::parse("tenant-a", r#"{"regionStorageMap": {}}"#).unwrap_err();
        assert!(err.to_string().contains("regionStorageMap"));
    }
}
