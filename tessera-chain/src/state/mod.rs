//! Chain state: accounts and the persisted head snapshot

mod meta;
mod storage;

pub use meta::MetaState;
pub use storage::{ChainStore, WriteOp};

use serde::{Deserialize, Serialize};

use crate::types::{Address, Hash, Height, Nonce};

/// Account record. Created lazily on first reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    /// Next unused nonce; assigned values are gap-free starting from 0.
    pub next_nonce: Nonce,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            next_nonce: 0,
        }
    }

    pub fn credit(&mut self, amount: u64) {
        self.balance = self.balance.saturating_add(amount);
    }
}

/// The persisted head snapshot; exactly one current value, rewritten on
/// every push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub head_hash: Hash,
    pub height: Height,
}
