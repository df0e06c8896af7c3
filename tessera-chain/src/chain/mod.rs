//! Block producer chain engine
//!
//! The engine runs three long-lived tasks over unbuffered queues:
//! - the main cycle: sync the head, sleep until the next slot deadline,
//!   produce when it is this node's turn
//! - the block worker: apply own and peer-advised blocks, stashing blocks
//!   that arrive ahead of the expected turn
//! - the tx worker: apply pending transactions one at a time
//!
//! Stop propagation: `stop()` flips the chain-wide stop channel; the main
//! cycle exits and closes the downstream workers channel so both workers
//! drain promptly.

pub mod index;
pub mod runtime;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::errors::{ChainError, ChainResult};
use crate::genesis::genesis_block;
use crate::keys;
use crate::rpc::{AdviseNewBlockReq, FetchBlockReq, NodeCaller};
use crate::state::{ChainState, ChainStore, MetaState, WriteOp};
use crate::types::{
    Address, BillingRequest, Block, BlockHeader, Height, Timestamp, Transaction, TxBilling,
    BLOCK_VERSION,
};

use index::{BlockIndex, BlockNode};
use runtime::{Head, Runtime};

/// Receiver ends of the worker queues, taken once by `start`.
struct WorkerChannels {
    from_self: mpsc::Receiver<Block>,
    from_rpc: mpsc::Receiver<Block>,
    pending: mpsc::Receiver<Transaction>,
    stop: watch::Receiver<bool>,
}

/// The main chain.
pub struct Chain {
    store: Arc<ChainStore>,
    pub runtime: Arc<Runtime>,
    index: RwLock<BlockIndex>,
    meta: Mutex<MetaState>,
    caller: Arc<dyn NodeCaller>,
    signing_key: SigningKey,
    /// Serializes pushes: at most one block applies at any instant.
    push_lock: Mutex<()>,
    blocks_from_self: mpsc::Sender<Block>,
    blocks_from_rpc: mpsc::Sender<Block>,
    pending_txs: mpsc::Sender<Transaction>,
    receivers: Mutex<Option<WorkerChannels>>,
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Chain {
    /// Open the chain at the configured data file: push the genesis block
    /// on a fresh store, replay otherwise.
    pub fn bootstrap(config: &ChainConfig, caller: Arc<dyn NodeCaller>) -> ChainResult<Arc<Self>> {
        config.validate()?;
        let signing_key = keys::load_or_generate_keypair(Path::new(&config.key_file))?;
        let store = Arc::new(ChainStore::open(&config.data_file)?);
        Self::with_store(config, caller, signing_key, store)
    }

    /// Build the chain over an already-open store.
    pub fn with_store(
        config: &ChainConfig,
        caller: Arc<dyn NodeCaller>,
        signing_key: SigningKey,
        store: Arc<ChainStore>,
    ) -> ChainResult<Arc<Self>> {
        config.validate()?;
        let account_address = keys::address_from_privkey(&signing_key);
        let runtime = Arc::new(Runtime::new(config, account_address));

        let (self_tx, self_rx) = mpsc::channel(1);
        let (rpc_tx, rpc_rx) = mpsc::channel(1);
        let (pending_tx, pending_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let chain = Arc::new(Self {
            store,
            runtime,
            index: RwLock::new(BlockIndex::new()),
            meta: Mutex::new(MetaState::new()),
            caller,
            signing_key,
            push_lock: Mutex::new(()),
            blocks_from_self: self_tx,
            blocks_from_rpc: rpc_tx,
            pending_txs: pending_tx,
            receivers: Mutex::new(Some(WorkerChannels {
                from_self: self_rx,
                from_rpc: rpc_rx,
                pending: pending_rx,
                stop: stop_rx,
            })),
            stop: stop_tx,
            handles: Mutex::new(Vec::new()),
        });

        if chain.store.state()?.is_none() {
            let genesis = genesis_block(&config.genesis);
            debug!(hash = %hex::encode(&genesis.hash()[..8]), "pushing genesis block");
            chain.push_block_without_check(&genesis)?;
        } else {
            chain.replay()?;
        }

        let head = chain.runtime.head();
        debug!(
            index = chain.runtime.index,
            bp_num = chain.runtime.bp_num,
            height = head.state.height,
            head = %hex::encode(&head.state.head_hash[..8]),
            "current chain state"
        );
        Ok(chain)
    }

    /// Rebuild the block index and meta-state from the persisted buckets.
    fn replay(&self) -> ChainResult<()> {
        let state = self.store.state()?.ok_or(ChainError::NoSuchBlock)?;
        {
            let mut index = self.lock_index_mut();
            let mut last: Option<usize> = None;
            for (height, block) in self.store.blocks()? {
                let parent = match last {
                    None => None,
                    Some(last_idx) => {
                        let parent_idx = if index.node(last_idx).hash == block.parent_hash() {
                            last_idx
                        } else {
                            index
                                .lookup(&block.parent_hash())
                                .ok_or(ChainError::ParentNotFound)?
                        };
                        block.signed_header.verify()?;
                        Some(parent_idx)
                    }
                };
                let count = parent.map(|p| index.node(p).count + 1).unwrap_or(0);
                let idx = index.add(BlockNode {
                    hash: block.hash(),
                    height,
                    count,
                    parent,
                });
                last = Some(idx);
            }
            let head_node = index
                .lookup(&state.head_hash)
                .ok_or(ChainError::ParentNotFound)?;
            self.runtime.set_head(Head {
                state,
                node: head_node,
            });
        }
        self.runtime.reset_next_turn(state.height + 1);
        self.lock_meta().reload(&self.store)?;
        info!(
            height = state.height,
            head = %hex::encode(&state.head_hash[..8]),
            "chain reloaded"
        );
        Ok(())
    }

    fn lock_meta(&self) -> std::sync::MutexGuard<'_, MetaState> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_index_mut(&self) -> std::sync::RwLockWriteGuard<'_, BlockIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// A clone of the node signing key, for collaborating services.
    pub fn node_key(&self) -> SigningKey {
        self.signing_key.clone()
    }

    /// Balance of an account in the current meta-state.
    pub fn account_balance(&self, address: &Address) -> u64 {
        self.lock_meta().balance(address)
    }

    // ========================================================================
    // Block validation and push
    // ========================================================================

    /// Validate an advised block against the current head: parent link,
    /// merkle root, hash integrity and producer signature.
    pub fn check_block(&self, block: &Block) -> ChainResult<()> {
        let head = self.runtime.head();
        if block.parent_hash() != head.state.head_hash {
            debug!(
                head = %hex::encode(&head.state.head_hash[..8]),
                received_parent = %hex::encode(&block.parent_hash()[..8]),
                "invalid parent"
            );
            return Err(ChainError::ParentNotMatch);
        }
        block.verify()
    }

    pub fn push_block(&self, block: &Block) -> ChainResult<()> {
        self.check_block(block)?;
        self.push_block_without_check(block)
    }

    /// Apply a block: one store transaction covers the state snapshot, the
    /// block record, its transactions and the touched accounts. The head
    /// and the in-memory index advance only after the commit.
    pub fn push_block_without_check(&self, block: &Block) -> ChainResult<()> {
        let _push_guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let height = self.runtime.height_from_time(block.timestamp());
        let hash = block.hash();
        let parent = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            if index.is_empty() {
                None
            } else {
                Some(self.runtime.head().node)
            }
        };
        let count = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            parent.map(|p| index.node(p).count + 1).unwrap_or(0)
        };
        let state = ChainState {
            head_hash: hash,
            height,
        };

        let mut ops = vec![
            WriteOp::Put(ChainStore::state_key(), bincode::serialize(&state)?),
            WriteOp::Put(ChainStore::block_key(height, &hash), bincode::serialize(block)?),
        ];

        {
            let mut meta = self.lock_meta();
            meta.clear_dirty();
            for tx in &block.transactions {
                match meta.apply_transaction(tx, &self.store) {
                    Ok(writes) => ops.extend(writes),
                    Err(err) => {
                        meta.clear_dirty();
                        return Err(err);
                    }
                }
            }
            if let Err(err) = self.store.write_batch(&ops) {
                meta.clear_dirty();
                return Err(err);
            }
            meta.commit_dirty();
            meta.partial_commit(&block.transactions);
        }

        let node = self.lock_index_mut().add(BlockNode {
            hash,
            height,
            count,
            parent,
        });
        self.runtime.set_head(Head { state, node });
        Ok(())
    }

    // ========================================================================
    // Production
    // ========================================================================

    /// Produce this turn's block: drain the pending pool, sign, push
    /// locally, then advise every peer in parallel. Gossip failures are
    /// logged, never fatal.
    pub async fn produce_block(&self, now: Timestamp) -> ChainResult<()> {
        let transactions = self.lock_meta().pull_txs();
        let head = self.runtime.head();
        let mut block = Block::new(
            BlockHeader {
                version: BLOCK_VERSION,
                producer: self.runtime.account_address,
                parent_hash: head.state.head_hash,
                merkle_root: [0u8; 32],
                timestamp: now,
            },
            transactions,
        );
        block.pack_and_sign(&self.signing_key)?;
        self.push_block_without_check(&block)?;
        info!(
            height = self.runtime.head().state.height,
            hash = %hex::encode(&block.hash()[..8]),
            txs = block.transactions.len(),
            "produced block"
        );

        for peer in &self.runtime.peers {
            if *peer == self.runtime.node_id {
                continue;
            }
            let caller = Arc::clone(&self.caller);
            let req =
                AdviseNewBlockReq::new(self.runtime.node_id.clone(), &self.signing_key, block.clone());
            let peer = peer.clone();
            let curr_turn = self.runtime.next_turn();
            tokio::spawn(async move {
                match caller.advise_new_block(&peer, req).await {
                    Ok(_) => debug!(%peer, "advised new block"),
                    Err(err) => {
                        error!(%peer, curr_turn, error = %err, "failed to advise new block")
                    }
                }
            });
        }
        Ok(())
    }

    /// Settle a billing request: verify its signatures, price the gas,
    /// build and enqueue the billing transaction, countersign the request.
    pub async fn produce_tx_billing(
        &self,
        mut request: BillingRequest,
    ) -> ChainResult<BillingRequest> {
        // Period and miner-list membership of the sqlchain are not checked
        // yet; only the attached signatures are verified.
        request.verify_signatures()?;

        let receivers: Vec<Address> = request
            .header
            .gas_amounts
            .iter()
            .map(|g| g.address)
            .collect();
        let fees: Vec<u64> = request
            .header
            .gas_amounts
            .iter()
            .map(|g| g.gas * self.runtime.gas_price)
            .collect();
        let rewards = vec![0u64; receivers.len()];

        let nonce = self.lock_meta().next_nonce(self.runtime.account_address);
        let mut tx = TxBilling {
            nonce,
            request_hash: request.request_hash,
            producer: self.runtime.account_address,
            receivers,
            fees,
            rewards,
            signee: [0u8; 32],
            signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
        };
        tx.sign(&self.signing_key);
        request.sign(&self.signing_key);

        self.pending_txs
            .send(Transaction::Billing(tx))
            .await
            .map_err(|_| ChainError::Rpc("pending tx queue closed".into()))?;
        Ok(request)
    }

    /// Apply one pending transaction under its own store transaction, then
    /// pool it for inclusion in the next produced block.
    fn process_tx(&self, tx: &Transaction) -> ChainResult<()> {
        let mut meta = self.lock_meta();
        meta.clear_dirty();
        let writes = match meta.apply_transaction(tx, &self.store) {
            Ok(writes) => writes,
            Err(err) => {
                meta.clear_dirty();
                return Err(err);
            }
        };
        if writes.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.store.write_batch(&writes) {
            meta.clear_dirty();
            return Err(err);
        }
        meta.commit_dirty();
        meta.pool_push(tx.clone());
        Ok(())
    }

    /// Fetch a block on the head's ancestor path by height.
    pub fn fetch_block_by_height(&self, height: Height) -> ChainResult<Block> {
        let head = self.runtime.head();
        let hash = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index
                .ancestor(head.node, height)
                .map(|node| node.hash)
                .ok_or(ChainError::NoSuchBlock)?
        };
        self.store
            .block(height, &hash)?
            .ok_or(ChainError::NoSuchBlock)
    }

    /// Enqueue a peer-advised block for the block worker.
    pub async fn enqueue_rpc_block(&self, block: Block) -> ChainResult<()> {
        self.blocks_from_rpc
            .send(block)
            .await
            .map_err(|_| ChainError::Rpc("block queue closed".into()))
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Startup synchronization. Catch-up fetching is not implemented yet:
    /// the schedule and the in-memory height only advance to the present.
    fn sync(&self) {
        debug!(node = %self.runtime.node_id, "synchronizing chain state");
        loop {
            let now = self.runtime.now_ms();
            let height = self.runtime.height_from_time(now);
            if self.runtime.next_turn() >= height {
                break;
            }
            while self.runtime.next_turn() <= height {
                self.runtime.set_next_turn();
                self.runtime.increase_height_by_one();
            }
        }
    }

    /// Fetch the block of the previous turn when it was never advised.
    /// Peers are tried in list order; the first non-null response wins.
    /// No retries within a single tick.
    pub async fn sync_head(&self) {
        let head = self.runtime.head();
        let target = self.runtime.next_turn().saturating_sub(1);
        if head.state.height >= target {
            return;
        }
        for peer in &self.runtime.peers {
            if *peer == self.runtime.node_id {
                continue;
            }
            let req = FetchBlockReq::new(self.runtime.node_id.clone(), &self.signing_key, target);
            match self.caller.fetch_block(peer, req).await {
                Ok(resp) => match resp.block {
                    Some(block) => {
                        debug!(%peer, height = target, "fetched block from peer");
                        if self.blocks_from_rpc.send(block).await.is_err() {
                            warn!("block queue closed during sync");
                        }
                        return;
                    }
                    None => debug!(%peer, height = target, "peer has no block"),
                },
                Err(err) => {
                    debug!(%peer, height = target, error = %err, "failed to fetch block from peer")
                }
            }
        }
        debug!(height = target, "cannot get block from any peer");
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Run one slot: produce when scheduled, then advance the turn.
    async fn run_current_turn(&self, now: Timestamp) {
        debug!(
            next_turn = self.runtime.next_turn(),
            bp_num = self.runtime.bp_num,
            node_index = self.runtime.index,
            "checking turn"
        );
        if self.runtime.is_my_turn() {
            info!(height = self.runtime.next_turn(), "producing block for this turn");
            if let Err(err) = self.produce_block(now).await {
                error!(now, error = %err, "failed to produce block");
            }
        }
        self.runtime.set_next_turn();
    }

    pub(crate) fn handle_self_block(&self, block: Block) {
        let height = self.runtime.height_from_time(block.timestamp());
        if height + 1 == self.runtime.next_turn() {
            if let Err(err) = self.push_block_without_check(&block) {
                error!(height, error = %err, "failed to push own block");
            }
        } else {
            debug!(
                height,
                next_turn = self.runtime.next_turn(),
                "dropping own block outside its turn"
            );
        }
    }

    /// Handle one peer-advised block. Returns the stash to re-enqueue when
    /// a successful push makes its blocks worth re-checking.
    pub(crate) fn handle_rpc_block(&self, block: Block, stash: &mut Vec<Block>) -> Vec<Block> {
        let height = self.runtime.height_from_time(block.timestamp());
        let expected = self.runtime.next_turn().saturating_sub(1);
        if height > expected {
            debug!(height, expected, "stashing future block");
            stash.push(block);
            return Vec::new();
        }
        if height < expected {
            // Fork candidates are dropped until a reorg module exists.
            warn!(height, expected, "dropping stale block");
            return Vec::new();
        }
        match self.push_block(&block) {
            Ok(()) => {
                info!(
                    height,
                    hash = %hex::encode(&block.hash()[..8]),
                    "pushed advised block"
                );
                std::mem::take(stash)
            }
            Err(err) => {
                error!(height, error = %err, "failed to push advised block");
                Vec::new()
            }
        }
    }

    async fn process_blocks(
        self: Arc<Self>,
        mut from_self: mpsc::Receiver<Block>,
        mut from_rpc: mpsc::Receiver<Block>,
        mut workers_stop: watch::Receiver<bool>,
    ) {
        let (stash_cancel, _) = watch::channel(false);
        let mut stash_tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut stash: Vec<Block> = Vec::new();
        loop {
            tokio::select! {
                Some(block) = from_self.recv() => self.handle_self_block(block),
                Some(block) = from_rpc.recv() => {
                    let drained = self.handle_rpc_block(block, &mut stash);
                    if !drained.is_empty() {
                        let sender = self.blocks_from_rpc.clone();
                        let mut cancel = stash_cancel.subscribe();
                        stash_tasks.push(tokio::spawn(async move {
                            for block in drained {
                                tokio::select! {
                                    _ = cancel.changed() => return,
                                    sent = sender.send(block) => {
                                        if sent.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }));
                    }
                }
                _ = workers_stop.changed() => break,
            }
        }
        // Cancel in-flight stash returns, then join them so shutdown is clean.
        drop(stash_cancel);
        for task in stash_tasks {
            let _ = task.await;
        }
    }

    async fn process_txs(
        self: Arc<Self>,
        mut pending: mpsc::Receiver<Transaction>,
        mut workers_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(tx) = pending.recv() => {
                    if let Err(err) = self.process_tx(&tx) {
                        debug!(
                            tx = %hex::encode(&tx.hash()[..8]),
                            next_turn = self.runtime.next_turn(),
                            error = %err,
                            "failed to apply pending transaction"
                        );
                    }
                }
                _ = workers_stop.changed() => break,
            }
        }
    }

    async fn main_cycle(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        workers_stop: watch::Sender<bool>,
    ) {
        loop {
            if *stop.borrow() {
                break;
            }
            self.sync_head().await;
            let (now, wait) = self.runtime.next_tick();
            if wait > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stop.changed() => break,
                }
            } else {
                self.run_current_turn(now).await;
            }
        }
        // Closing this channel drains the block and tx workers.
        drop(workers_stop);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the engine: initial sync, then the three worker tasks.
    pub fn start(self: &Arc<Self>) -> ChainResult<()> {
        self.sync();
        let channels = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ChainError::Config("chain already started".into()))?;
        let (workers_stop_tx, workers_stop_rx) = watch::channel(false);
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.push(tokio::spawn(Arc::clone(self).process_blocks(
            channels.from_self,
            channels.from_rpc,
            workers_stop_rx.clone(),
        )));
        handles.push(tokio::spawn(
            Arc::clone(self).process_txs(channels.pending, workers_stop_rx),
        ));
        handles.push(tokio::spawn(
            Arc::clone(self).main_cycle(channels.stop, workers_stop_tx),
        ));
        info!(node = %self.runtime.node_id, "chain started");
        Ok(())
    }

    /// Stop the engine and join every worker.
    pub async fn stop(&self) -> ChainResult<()> {
        debug!(node = %self.runtime.node_id, "stopping chain");
        let _ = self.stop.send(true);
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.store.flush()?;
        debug!(node = %self.runtime.node_id, "chain stopped");
        Ok(())
    }

    /// Receiver ends for tests that drive the workers by hand.
    #[cfg(test)]
    pub(crate) fn take_receivers(
        &self,
    ) -> Option<(
        mpsc::Receiver<Block>,
        mpsc::Receiver<Block>,
        mpsc::Receiver<Transaction>,
    )> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|ch| (ch.from_self, ch.from_rpc, ch.pending))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{lone_chain, make_block};
    use super::*;
    use crate::keys::{address_from_privkey, test_signing_key};
    use crate::rpc::LoopbackCaller;
    use crate::types::{BillingRequestHeader, DatabaseId, GasAmount};

    #[tokio::test]
    async fn genesis_push_sets_head() {
        let chain = lone_chain("bp00", 1);
        let head = chain.runtime.head();
        assert_eq!(head.state.height, 0);
        assert_ne!(head.state.head_hash, [0u8; 32]);
    }

    #[tokio::test]
    async fn produced_blocks_extend_the_chain() {
        let chain = lone_chain("bp00", 2);
        for height in 1..=3u64 {
            chain.produce_block(height * 10_000).await.expect("produce");
        }
        let head = chain.runtime.head();
        assert_eq!(head.state.height, 3);
        for height in 0..=3u64 {
            let block = chain.fetch_block_by_height(height).expect("fetch");
            assert_eq!(chain.runtime.height_from_time(block.timestamp()), height);
        }
        assert!(matches!(
            chain.fetch_block_by_height(4),
            Err(ChainError::NoSuchBlock)
        ));
    }

    #[tokio::test]
    async fn check_block_rejects_bad_parent_and_merkle() {
        let chain = lone_chain("bp00", 3);
        let stranger = make_block([9u8; 32], 1, 3);
        assert!(matches!(
            chain.check_block(&stranger),
            Err(ChainError::ParentNotMatch)
        ));

        let head = chain.runtime.head();
        let mut bad_merkle = make_block(head.state.head_hash, 1, 3);
        bad_merkle.signed_header.header.merkle_root = [5u8; 32];
        bad_merkle.signed_header.block_hash = bad_merkle
            .signed_header
            .header
            .compute_hash()
            .expect("hash");
        assert!(matches!(
            chain.check_block(&bad_merkle),
            Err(ChainError::InvalidMerkleRoot)
        ));
    }

    #[tokio::test]
    async fn stash_holds_future_blocks_and_drains_after_push() {
        let chain = lone_chain("bp00", 4);
        // Advance the local chain to height 3.
        for height in 1..=3u64 {
            chain.produce_block(height * 10_000).await.expect("produce");
        }
        chain.runtime.reset_next_turn(5);
        let head_hash = chain.runtime.head().state.head_hash;

        let block4 = make_block(head_hash, 4, 4);
        let block6 = make_block(block4.hash(), 6, 4);
        let block7 = make_block(block6.hash(), 7, 4);

        let mut stash = Vec::new();
        assert!(chain
            .handle_rpc_block(block6.clone(), &mut stash)
            .is_empty());
        assert!(chain
            .handle_rpc_block(block7.clone(), &mut stash)
            .is_empty());
        assert_eq!(stash.len(), 2);

        // Height 4 matches the expected turn: applied, stash drained in order.
        let drained = chain.handle_rpc_block(block4, &mut stash);
        assert_eq!(chain.runtime.head().state.height, 4);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].hash(), block6.hash());
        assert_eq!(drained[1].hash(), block7.hash());
        assert!(stash.is_empty());

        // The ticks advance the schedule; the re-enqueued blocks now apply.
        chain.runtime.reset_next_turn(7);
        let mut stash = Vec::new();
        assert!(chain.handle_rpc_block(block6, &mut stash).is_empty());
        assert_eq!(chain.runtime.head().state.height, 6);
        chain.runtime.reset_next_turn(8);
        assert!(chain.handle_rpc_block(block7, &mut stash).is_empty());
        assert_eq!(chain.runtime.head().state.height, 7);
    }

    #[tokio::test]
    async fn stale_blocks_are_dropped() {
        let chain = lone_chain("bp00", 5);
        for height in 1..=3u64 {
            chain.produce_block(height * 10_000).await.expect("produce");
        }
        chain.runtime.reset_next_turn(6);
        let stale = make_block([1u8; 32], 2, 5);
        let mut stash = Vec::new();
        assert!(chain.handle_rpc_block(stale, &mut stash).is_empty());
        assert!(stash.is_empty());
        assert_eq!(chain.runtime.head().state.height, 3);
    }

    #[tokio::test]
    async fn billing_request_becomes_pending_tx() {
        let chain = lone_chain("bp00", 6);
        let miner = test_signing_key(60);
        let mut request = BillingRequest::new(BillingRequestHeader {
            database_id: DatabaseId("db0".to_string()),
            gas_amounts: vec![GasAmount {
                address: [8u8; 32],
                gas: 7,
            }],
        })
        .expect("request");
        request.sign(&miner);

        let countersigned = chain
            .produce_tx_billing(request)
            .await
            .expect("billing accepted");
        assert_eq!(countersigned.signatures.len(), 2);

        let (_, _, mut pending) = chain.take_receivers().expect("receivers");
        let tx = pending.recv().await.expect("queued tx");
        let Transaction::Billing(billing) = &tx;
        assert_eq!(billing.nonce, 0);
        assert_eq!(billing.fees, vec![7]); // gas * gas_price(1)
        assert_eq!(billing.rewards, vec![0]);
        tx.verify_signature().expect("signed by the producer");
    }

    #[tokio::test]
    async fn unsigned_billing_request_is_rejected() {
        let chain = lone_chain("bp00", 7);
        let mut request = BillingRequest::new(BillingRequestHeader {
            database_id: DatabaseId("db0".to_string()),
            gas_amounts: vec![],
        })
        .expect("request");
        request.request_hash = [0u8; 32];
        assert!(chain.produce_tx_billing(request).await.is_err());
    }

    #[tokio::test]
    async fn replay_restores_head_index_and_balances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_path = dir.path().join("chain");
        let mut config = ChainConfig::default();
        config.node_id = "bp00".to_string();
        config.peers = vec!["bp00".to_string()];
        config.genesis.timestamp = 0;
        config.period_ms = 10_000;

        let key = test_signing_key(8);
        let producer = address_from_privkey(&key);
        let receiver = [3u8; 32];

        let (head_before, balance_before) = {
            let store = Arc::new(ChainStore::open(&data_path).expect("store"));
            let chain = Chain::with_store(
                &config,
                Arc::new(LoopbackCaller::new()),
                key.clone(),
                store,
            )
            .expect("chain");

            let mut tx = TxBilling {
                nonce: 0,
                request_hash: [1u8; 32],
                producer,
                receivers: vec![receiver],
                fees: vec![40],
                rewards: vec![0],
                signee: [0u8; 32],
                signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
            };
            tx.sign(&key);
            chain
                .process_tx(&Transaction::Billing(tx))
                .expect("apply pending tx");

            chain.produce_block(10_000).await.expect("produce 1");
            chain.produce_block(20_000).await.expect("produce 2");
            chain.store().flush().expect("flush");
            (chain.runtime.head().state, chain.account_balance(&receiver))
        };

        let store = Arc::new(ChainStore::open(&data_path).expect("reopen"));
        let chain =
            Chain::with_store(&config, Arc::new(LoopbackCaller::new()), key, store).expect("replay");
        let head_after = chain.runtime.head().state;
        assert_eq!(head_after, head_before);
        assert_eq!(chain.account_balance(&receiver), balance_before);
        assert_eq!(balance_before, 40);
        assert_eq!(chain.runtime.next_turn(), head_after.height + 1);
    }

    #[tokio::test]
    async fn worker_drains_on_stop() {
        let mut config = ChainConfig::default();
        config.node_id = "bp00".to_string();
        config.peers = vec!["bp00".to_string()];
        config.bp_num = 2; // never this node's turn during the test window
        config.index = 1;
        config.period_ms = 60_000;
        config.tick_ms = 10;
        let store = Arc::new(ChainStore::temporary().expect("store"));
        let probe = Runtime::new(&config, [0u8; 32]);
        config.genesis.timestamp = probe.now_ms();
        let chain = Chain::with_store(
            &config,
            Arc::new(LoopbackCaller::new()),
            test_signing_key(9),
            store,
        )
        .expect("chain");
        chain.start().expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        chain.stop().await.expect("stop");
    }
}
