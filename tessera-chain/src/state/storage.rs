//! Durable bucket layout over the embedded KV store
//!
//! Everything lives in one sled tree named `meta`; the logical sub-buckets
//! of the on-disk contract are key prefixes inside it, so that all
//! mutations of a single block push commit in one tree transaction:
//!
//! - `state` - serialized [`ChainState`] snapshot
//! - `block_index/<height_be><block_hash>` - serialized blocks, in order
//! - `tx_index/<kind>/<tx_hash>` - per-kind transaction records
//! - `account_index/<address>` - serialized accounts
//! - `sqlchain_index/<database_id>` - provisioned database instances

use std::path::Path;

use sled::transaction::{ConflictableTransactionResult, TransactionError};
use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::state::{Account, ChainState};
use crate::types::{Address, Block, DatabaseId, DbInstanceMeta, Hash, Height, TxKind};

const META_TREE: &str = "meta";
const STATE_KEY: &[u8] = b"state";
const BLOCK_PREFIX: &[u8] = b"block_index/";
const TX_PREFIX: &[u8] = b"tx_index/";
const ACCOUNT_PREFIX: &[u8] = b"account_index/";
const SQLCHAIN_PREFIX: &[u8] = b"sqlchain_index/";

/// One staged mutation, applied by [`ChainStore::write_batch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

/// Handle over the embedded store.
pub struct ChainStore {
    _db: sled::Db,
    meta: sled::Tree,
}

impl ChainStore {
    /// Open (or create) the store at `path`. The schema is created
    /// idempotently on open.
    pub fn open<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let db = sled::open(path)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self { _db: db, meta })
    }

    /// An ephemeral store for tests.
    pub fn temporary() -> ChainResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self { _db: db, meta })
    }

    /// Apply a batch of mutations in one write transaction.
    pub fn write_batch(&self, ops: &[WriteOp]) -> ChainResult<()> {
        let result = self
            .meta
            .transaction(|tx| -> ConflictableTransactionResult<(), sled::Error> {
                for op in ops {
                    match op {
                        WriteOp::Put(key, value) => {
                            tx.insert(key.as_slice(), value.as_slice())?;
                        }
                        WriteOp::Del(key) => {
                            tx.remove(key.as_slice())?;
                        }
                    }
                }
                Ok(())
            });
        result.map_err(|err| match err {
            TransactionError::Abort(e) | TransactionError::Storage(e) => ChainError::Store(e),
        })
    }

    pub fn flush(&self) -> ChainResult<()> {
        self.meta.flush()?;
        Ok(())
    }

    // ========================================================================
    // Keys
    // ========================================================================

    pub fn state_key() -> Vec<u8> {
        STATE_KEY.to_vec()
    }

    /// Block index key: big-endian height then hash, so bucket order is
    /// chain order.
    pub fn block_key(height: Height, hash: &Hash) -> Vec<u8> {
        let mut key = BLOCK_PREFIX.to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        key.extend_from_slice(hash);
        key
    }

    pub fn tx_key(kind: TxKind, hash: &Hash) -> Vec<u8> {
        let mut key = TX_PREFIX.to_vec();
        key.extend_from_slice(kind.bucket().as_bytes());
        key.push(b'/');
        key.extend_from_slice(hash);
        key
    }

    pub fn account_key(address: &Address) -> Vec<u8> {
        let mut key = ACCOUNT_PREFIX.to_vec();
        key.extend_from_slice(address);
        key
    }

    pub fn sqlchain_key(id: &DatabaseId) -> Vec<u8> {
        let mut key = SQLCHAIN_PREFIX.to_vec();
        key.extend_from_slice(id.as_str().as_bytes());
        key
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn state(&self) -> ChainResult<Option<ChainState>> {
        match self.meta.get(STATE_KEY)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn block(&self, height: Height, hash: &Hash) -> ChainResult<Option<Block>> {
        match self.meta.get(Self::block_key(height, hash))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// All persisted blocks with their heights, in bucket (chain) order.
    pub fn blocks(&self) -> ChainResult<Vec<(Height, Block)>> {
        let mut blocks = Vec::new();
        for entry in self.meta.scan_prefix(BLOCK_PREFIX) {
            let (key, value) = entry?;
            let height_bytes: [u8; 8] = key[BLOCK_PREFIX.len()..BLOCK_PREFIX.len() + 8]
                .try_into()
                .map_err(|_| ChainError::Config("malformed block index key".into()))?;
            blocks.push((u64::from_be_bytes(height_bytes), bincode::deserialize(&value)?));
        }
        debug!(count = blocks.len(), "loaded block index");
        Ok(blocks)
    }

    pub fn contains_tx(&self, kind: TxKind, hash: &Hash) -> ChainResult<bool> {
        Ok(self.meta.contains_key(Self::tx_key(kind, hash))?)
    }

    pub fn accounts(&self) -> ChainResult<Vec<Account>> {
        let mut accounts = Vec::new();
        for entry in self.meta.scan_prefix(ACCOUNT_PREFIX) {
            let (_, value) = entry?;
            accounts.push(bincode::deserialize(&value)?);
        }
        Ok(accounts)
    }

    pub fn sqlchains(&self) -> ChainResult<Vec<DbInstanceMeta>> {
        let mut instances = Vec::new();
        for entry in self.meta.scan_prefix(SQLCHAIN_PREFIX) {
            let (_, value) = entry?;
            instances.push(bincode::deserialize(&value)?);
        }
        Ok(instances)
    }

    pub fn sqlchain(&self, id: &DatabaseId) -> ChainResult<Option<DbInstanceMeta>> {
        match self.meta.get(Self::sqlchain_key(id))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }
}
