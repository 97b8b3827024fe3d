//!
//! Indexer configuration, loadable from a JSON file.
//!
use crate::parser::errors::{OpError, OpResult};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_HISTORY_MEMORY_LIMIT: u64 = 1 << 30;
pub const DEFAULT_FEE_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// selects the magic number and the address text format
    #[serde(with = "network_name")]
    pub network: Network,
    /// index unrecognised output scripts without an address instead of failing
    pub tolerate_unknown_scripts: bool,
    /// bytes `get_history` may emit before giving up
    pub history_memory_limit: u64,
    /// number of recent blocks averaged by `get_fees`
    pub fee_window: usize,
    /// workers used by bulk ingestion
    pub ingest_threads: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            network: Network::Bitcoin,
            tolerate_unknown_scripts: false,
            history_memory_limit: DEFAULT_HISTORY_MEMORY_LIMIT,
            fee_window: DEFAULT_FEE_WINDOW,
            ingest_threads: num_cpus::get(),
        }
    }
}

impl IndexerConfig {
    pub fn load(path: &Path) -> OpResult<IndexerConfig> {
        let text = fs::read_to_string(path)
            .map_err(|e| OpError::from(e).join_msg(&path.display().to_string()))?;
        IndexerConfig::from_json(&text)
    }

    pub fn from_json(text: &str) -> OpResult<IndexerConfig> {
        let config: IndexerConfig = serde_json::from_str(text)?;
        if config.fee_window == 0 || config.ingest_threads == 0 {
            return Err(OpError::from("fee_window and ingest_threads must be positive"));
        }
        Ok(config)
    }
}

/// Networks by their lowercase name: bitcoin, testnet, signet, regtest.
mod network_name {
    use bitcoin::Network;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(network: &Network, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&network.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Network, D::Error> {
        let name = String::deserialize(d)?;
        Network::from_str(&name).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config = IndexerConfig::from_json(r#"{"network": "testnet"}"#).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.history_memory_limit, DEFAULT_HISTORY_MEMORY_LIMIT);
        assert_eq!(config.fee_window, DEFAULT_FEE_WINDOW);
        assert!(!config.tolerate_unknown_scripts);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(IndexerConfig::from_json(r#"{"fee_window": 0}"#).is_err());
        assert!(IndexerConfig::from_json("not json").is_err());
    }
}
