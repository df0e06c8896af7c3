//! Meta-state: accounts, sqlchain registry and the pending-tx pool
//!
//! Accounts live in two pools: `readonly` mirrors what the store has
//! committed, `dirty` collects the mutations of the operation in flight.
//! Operations stage their durable writes as [`WriteOp`]s; the caller
//! commits them in one store transaction and then either merges the dirty
//! pool (`commit_dirty`) or discards it (`clear_dirty`).

use std::collections::HashMap;

use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::state::{Account, ChainStore, WriteOp};
use crate::types::{Address, DatabaseId, DbInstanceMeta, Nonce, Transaction};

#[derive(Default)]
pub struct MetaState {
    readonly: HashMap<Address, Account>,
    dirty: HashMap<Address, Account>,
    sqlchains: HashMap<DatabaseId, DbInstanceMeta>,
    pool: Vec<Transaction>,
}

impl MetaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view of an account, dirty-over-readonly, allocating a fresh
    /// record when the address has never been seen.
    fn account_view(&self, address: &Address) -> Account {
        self.dirty
            .get(address)
            .or_else(|| self.readonly.get(address))
            .cloned()
            .unwrap_or_else(|| Account::new(*address))
    }

    /// Balance lookup used by tests and the read-side API.
    pub fn balance(&self, address: &Address) -> u64 {
        self.account_view(address).balance
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Merge the in-flight mutations after the enclosing store transaction
    /// committed.
    pub fn commit_dirty(&mut self) {
        for (address, account) in self.dirty.drain() {
            self.readonly.insert(address, account);
        }
    }

    /// Validate and apply one transaction, staging its durable writes.
    ///
    /// A transaction already present under its kind bucket is skipped; this
    /// makes block replay of self-produced blocks (whose txs the tx worker
    /// already applied) a no-op instead of a nonce violation.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        store: &ChainStore,
    ) -> ChainResult<Vec<WriteOp>> {
        let hash = tx.hash();
        if store.contains_tx(tx.kind(), &hash)? {
            debug!(tx = %hex::encode(&hash[..8]), "transaction already applied");
            return Ok(vec![]);
        }

        tx.verify_signature()?;

        let sender_address = tx.account();
        let mut sender = self.account_view(&sender_address);
        if tx.nonce() != sender.next_nonce {
            return Err(ChainError::TxNonceMismatch {
                expected: sender.next_nonce,
                got: tx.nonce(),
            });
        }
        sender.next_nonce += 1;

        let mut touched: HashMap<Address, Account> = HashMap::new();
        touched.insert(sender_address, sender);

        match tx {
            Transaction::Billing(billing) => {
                for (receiver, (fee, reward)) in billing
                    .receivers
                    .iter()
                    .zip(billing.fees.iter().zip(billing.rewards.iter()))
                {
                    let mut account = touched
                        .remove(receiver)
                        .unwrap_or_else(|| self.account_view(receiver));
                    account.credit(fee + reward);
                    touched.insert(*receiver, account);
                }
            }
        }

        let mut writes = vec![WriteOp::Put(
            ChainStore::tx_key(tx.kind(), &hash),
            bincode::serialize(tx)?,
        )];
        for (address, account) in touched {
            writes.push(WriteOp::Put(
                ChainStore::account_key(&address),
                bincode::serialize(&account)?,
            ));
            self.dirty.insert(address, account);
        }
        Ok(writes)
    }

    /// Mark the given transactions accepted: drop them from the pool.
    pub fn partial_commit(&mut self, txs: &[Transaction]) {
        if txs.is_empty() {
            return;
        }
        let accepted: Vec<_> = txs.iter().map(Transaction::hash).collect();
        self.pool.retain(|tx| !accepted.contains(&tx.hash()));
    }

    /// Next unused nonce for an account, counting pooled transactions that
    /// have not been applied yet. Allocates the account record if missing.
    pub fn next_nonce(&mut self, address: Address) -> Nonce {
        let base = self
            .readonly
            .entry(address)
            .or_insert_with(|| Account::new(address))
            .next_nonce;
        let pooled = self
            .pool
            .iter()
            .filter(|tx| tx.account() == address)
            .map(|tx| tx.nonce() + 1)
            .max()
            .unwrap_or(0);
        base.max(pooled)
    }

    /// Add an applied transaction to the pending pool for block inclusion.
    pub fn pool_push(&mut self, tx: Transaction) {
        self.pool.push(tx);
    }

    /// Drain the pending pool, in arrival order.
    pub fn pull_txs(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.pool)
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Rebuild the in-memory maps from the persisted sub-buckets.
    pub fn reload(&mut self, store: &ChainStore) -> ChainResult<()> {
        self.readonly.clear();
        self.dirty.clear();
        self.sqlchains.clear();
        self.pool.clear();
        for account in store.accounts()? {
            self.readonly.insert(account.address, account);
        }
        for instance in store.sqlchains()? {
            self.sqlchains.insert(instance.database_id.clone(), instance);
        }
        debug!(
            accounts = self.readonly.len(),
            sqlchains = self.sqlchains.len(),
            "meta state reloaded"
        );
        Ok(())
    }

    pub fn sqlchain(&self, id: &DatabaseId) -> Option<&DbInstanceMeta> {
        self.sqlchains.get(id)
    }
}
