//! On-disk node configuration.
//!
//! The daemon understands far more fields than the harness cares about; only
//! the endpoints and block-production settings are typed here. Everything
//! else rides along in `extra` so a config written by the daemon survives a
//! load/store round-trip untouched and in order.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TestnetResult;

/// File name the daemon expects inside its working directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listener for peer connections, `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p2p_bind_address: Option<String>,

    /// Listener for the HTTP JSON-RPC server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_bind_address: Option<String>,

    /// Listener for the WebSocket event endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_bind_address: Option<String>,

    /// Initial peer-discovery contacts, `host:port` each.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed_nodes: Vec<String>,

    /// Let the node produce blocks even when the previous one is stale.
    /// Required for a single-producer devnet to make progress from genesis.
    #[serde(default)]
    pub allow_stale_production: bool,

    /// Minimum producer participation percentage before production starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_participation: Option<u32>,

    /// Names of the block producers this node runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub producers: Vec<String>,

    /// Signing keys for the producers above.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private_keys: Vec<String>,

    /// Fields the harness never inspects, preserved verbatim.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl NodeConfig {
    pub fn write_to_file(&self, path: &Path) -> TestnetResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> TestnetResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Set a pass-through field by name.
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    /// Read a pass-through field by name.
    pub fn get_extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Whether this node is configured to produce blocks.
    pub fn produces(&self) -> bool {
        !self.producers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_round_trip_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = NodeConfig {
            p2p_bind_address: Some("127.0.0.1:2001".to_string()),
            rpc_bind_address: Some("127.0.0.1:2002".to_string()),
            allow_stale_production: true,
            producers: vec!["alice".to_string()],
            private_keys: vec!["aa".repeat(32)],
            ..Default::default()
        };
        config.set_extra("shared_file_size", json!("64M"));

        config.write_to_file(&path).unwrap();
        let loaded = NodeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        // A second round-trip must be byte-stable: nothing rewrites itself.
        let first = std::fs::read_to_string(&path).unwrap();
        loaded.write_to_file(&path).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_fields_pass_through() {
        let raw = r#"{
            "rpc_bind_address": "127.0.0.1:2002",
            "plugin": "market_history",
            "bucket_sizes": [15, 60, 300]
        }"#;
        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.get_extra("plugin"), Some(&json!("market_history")));
        assert_eq!(config.get_extra("bucket_sizes"), Some(&json!([15, 60, 300])));

        let rendered = serde_json::to_value(&config).unwrap();
        assert_eq!(rendered["plugin"], json!("market_history"));
    }

    #[test]
    fn produces_reflects_the_producer_list() {
        let mut config = NodeConfig::default();
        assert!(!config.produces());
        config.producers.push("alice".to_string());
        assert!(config.produces());
    }
}
