//! Genesis block construction

use serde::{Deserialize, Serialize};

use crate::merkle::merkle_root;
use crate::types::{Block, BlockHeader, BLOCK_VERSION};

/// Genesis parameters. The timestamp is also the origin of the slot
/// schedule, so `height_from_time(genesis.timestamp) == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Genesis timestamp (ms since epoch).
    pub timestamp: u64,
    /// Block format version of the genesis block.
    pub version: u32,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: 1_704_067_200_000, // 2024-01-01 00:00:00 UTC
            version: BLOCK_VERSION,
        }
    }
}

/// Build the genesis block. It carries no producer and no signature; the
/// replay path links it without verification.
pub fn genesis_block(config: &GenesisConfig) -> Block {
    let mut block = Block::new(
        BlockHeader {
            version: config.version,
            producer: [0u8; 32],
            parent_hash: [0u8; 32],
            merkle_root: merkle_root(&[]),
            timestamp: config.timestamp,
        },
        vec![],
    );
    block.signed_header.block_hash = block
        .signed_header
        .header
        .compute_hash()
        .unwrap_or([0u8; 32]);
    block
}
