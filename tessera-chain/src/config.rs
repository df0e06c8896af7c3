//! Chain configuration loading

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::genesis::GenesisConfig;

/// Configuration of one block producer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Path of the durable KV store.
    pub data_file: String,
    /// Path of the node signing key.
    pub key_file: String,
    /// This node's id on the network.
    pub node_id: String,
    /// Slot duration in milliseconds.
    pub period_ms: u64,
    /// Main-cycle poll interval in milliseconds.
    pub tick_ms: u64,
    /// Number of block producers.
    pub bp_num: u64,
    /// This node's producer slot in `[0, bp_num)`.
    pub index: u64,
    /// Block producer peers, in ring order (including this node).
    pub peers: Vec<String>,
    /// Max allocation attempts for the DB control plane.
    pub allocation_rounds: usize,
    /// Fee multiplier for billing transactions.
    pub gas_price: u64,
    /// Genesis block payload.
    pub genesis: GenesisConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            data_file: "./tessera-data/chain".to_string(),
            key_file: "./tessera-data/node.key".to_string(),
            node_id: "bp00".to_string(),
            period_ms: 10_000,
            tick_ms: 1_000,
            bp_num: 1,
            index: 0,
            peers: vec!["bp00".to_string()],
            allocation_rounds: 3,
            gas_price: 1,
            genesis: GenesisConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> ChainResult<()> {
        if self.period_ms == 0 {
            return Err(ChainError::Config("period_ms must be positive".into()));
        }
        if self.bp_num == 0 {
            return Err(ChainError::Config("bp_num must be positive".into()));
        }
        if self.index >= self.bp_num {
            return Err(ChainError::Config(format!(
                "index {} out of range for bp_num {}",
                self.index, self.bp_num
            )));
        }
        Ok(())
    }
}

/// Load the configuration at `path`, writing the defaults on first run.
pub fn load_or_create(path: &Path) -> ChainResult<ChainConfig> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let config: ChainConfig = toml::from_str(&raw)
            .map_err(|err| ChainError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    } else {
        let config = ChainConfig::default();
        save(path, &config)?;
        Ok(config)
    }
}

/// Persist a configuration.
pub fn save(path: &Path, config: &ChainConfig) -> ChainResult<()> {
    let raw = toml::to_string_pretty(config)
        .map_err(|err| ChainError::Config(format!("serializing config: {err}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tessera.toml");
        let created = load_or_create(&path).expect("create");
        let loaded = load_or_create(&path).expect("load");
        assert_eq!(created.node_id, loaded.node_id);
        assert_eq!(created.period_ms, loaded.period_ms);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let config = ChainConfig {
            bp_num: 2,
            index: 2,
            ..ChainConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
