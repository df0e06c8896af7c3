//! Runtime clock and slot scheduler
//!
//! Maps wall time to chain height and decides whose turn it is to produce.
//! `next_turn` is a monotone counter advanced once per slot by the main
//! cycle regardless of whether a block was produced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::config::ChainConfig;
use crate::state::ChainState;
use crate::types::{Address, Height, NodeId, Timestamp};

/// The current head: persisted snapshot plus its index-arena node.
#[derive(Debug, Clone, Copy)]
pub struct Head {
    pub state: ChainState,
    pub node: usize,
}

pub struct Runtime {
    period_ms: u64,
    tick_ms: u64,
    genesis_time: Timestamp,
    pub bp_num: u64,
    pub index: u64,
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,
    /// This producer's account address; fixed at construction.
    pub account_address: Address,
    /// Fee multiplier for billing; fixed at construction.
    pub gas_price: u64,
    next_turn: AtomicU64,
    head: RwLock<Head>,
}

impl Runtime {
    pub fn new(config: &ChainConfig, account_address: Address) -> Self {
        Self {
            period_ms: config.period_ms,
            tick_ms: config.tick_ms,
            genesis_time: config.genesis.timestamp,
            bp_num: config.bp_num,
            index: config.index,
            node_id: NodeId(config.node_id.clone()),
            peers: config.peers.iter().cloned().map(NodeId).collect(),
            account_address,
            gas_price: config.gas_price,
            next_turn: AtomicU64::new(1),
            head: RwLock::new(Head {
                state: ChainState {
                    head_hash: [0u8; 32],
                    height: 0,
                },
                node: 0,
            }),
        }
    }

    /// Wall clock, milliseconds since epoch.
    pub fn now_ms(&self) -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_millis() as u64,
            Err(err) => {
                warn!("system time is before UNIX_EPOCH: {err}");
                0
            }
        }
    }

    /// Height the slot schedule assigns to a timestamp.
    pub fn height_from_time(&self, t: Timestamp) -> Height {
        t.saturating_sub(self.genesis_time) / self.period_ms
    }

    /// `(now, wait)`: how long to sleep before the next turn's deadline,
    /// clamped to the tick interval.
    pub fn next_tick(&self) -> (Timestamp, Duration) {
        let now = self.now_ms();
        let deadline = self.genesis_time + self.next_turn() * self.period_ms;
        let wait = deadline.saturating_sub(now).min(self.tick_ms);
        (now, Duration::from_millis(wait))
    }

    pub fn is_my_turn(&self) -> bool {
        self.next_turn() % self.bp_num == self.index
    }

    pub fn next_turn(&self) -> u64 {
        self.next_turn.load(Ordering::SeqCst)
    }

    pub fn set_next_turn(&self) {
        self.next_turn.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn reset_next_turn(&self, value: u64) {
        self.next_turn.store(value, Ordering::SeqCst);
    }

    pub fn head(&self) -> Head {
        *self.head.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_head(&self, head: Head) {
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = head;
    }

    /// Startup-sync stub: bump only the in-memory height.
    pub(crate) fn increase_height_by_one(&self) {
        self.head
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .height += 1;
    }
}
