//! Storage transport configuration.
//!
//! Controls how the Azure adapter talks to the blob service. Everything
//! here is invisible to the cache engine.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// TCP connect timeout (default: 3s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Retries after the first attempt for transient failures (default: 2).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff (default: 50ms).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (default: 1s).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// TCP keepalive probe interval (default: 10s).
    #[serde(default = "default_keepalive_secs")]
    pub tcp_keepalive_secs: u64,

    /// Source addresses to round-robin outbound requests across when the
    /// host has multiple NICs. Empty means bind nothing and let the OS
    /// route everything.
    #[serde(default)]
    pub source_addresses: Vec<IpAddr>,

    /// Master switch for source-interface round-robin.
    #[serde(default)]
    pub multi_nic: bool,

    /// Log every HTTP request/response at debug level.
    #[serde(default)]
    pub http_logging: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            tcp_keepalive_secs: default_keepalive_secs(),
            source_addresses: Vec::new(),
            multi_nic: false,
            http_logging: false,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn tcp_keepalive(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_secs)
    }
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_keepalive_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_backoff(), Duration::from_millis(50));
        assert_eq!(config.max_backoff(), Duration::from_secs(1));
        assert!(!config.multi_nic);
    }

    #[test]
    fn test_deserializes_with_partial_fields() {
        let config: TransportConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.connect_timeout_ms, 3000);
    }
}
