//! DB allocation service
//!
//! The control plane that provisions sharded databases on miner nodes:
//! derive a database id by proof-of-work, pick candidate nodes off the
//! consistent-hash ring filtered by free memory, then commit-or-rollback
//! the deployment across the allocated set.
//!
//! The ring and the metric source are external collaborators behind
//! [`Placement`] and [`NodeMetricMap`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, SigningKey};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::genesis::{genesis_block, GenesisConfig};
use crate::rpc::{
    NodeCaller, ServiceInstance, ServiceOp, SignedUpdateServiceHeader, UpdateServiceHeader,
    UpdateServiceReq,
};
use crate::state::{ChainStore, WriteOp};
use crate::types::{
    DatabaseId, DbInstanceMeta, DbResourceMeta, NodeId, PeerRole, PeerServer, Peers, BLOCK_VERSION,
};

/// Metric name for free memory on a miner node.
pub const METRIC_FREE_MEMORY_BYTES: &str = "node_memory_free_bytes_total";

/// Leading zero bits required of a database id digest.
pub const ID_POW_DIFFICULTY: u32 = 8;

/// A candidate node returned by the placement ring.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub public_key: [u8; 32],
}

/// Consistent-hash node placement; supplied by the routing layer.
pub trait Placement: Send + Sync {
    /// The `range` nodes nearest to `key` on the ring.
    fn neighbors(&self, key: &str, range: usize) -> Vec<NodeInfo>;
}

/// Last-reported gauges per node; fed by the metric collection service.
#[derive(Default)]
pub struct NodeMetricMap {
    gauges: RwLock<HashMap<NodeId, HashMap<String, u64>>>,
}

impl NodeMetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gauge(&self, node: NodeId, key: &str, value: u64) {
        self.gauges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn gauge(&self, node: &NodeId, key: &str) -> ChainResult<u64> {
        self.gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .and_then(|m| m.get(key))
            .copied()
            .ok_or(ChainError::MetricNotCollected)
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateDatabaseRequest {
    /// Requesting node; seeds the database id proof-of-work.
    pub node_id: NodeId,
    pub resource: DbResourceMeta,
}

#[derive(Debug, Clone)]
pub struct CreateDatabaseResponse {
    pub instance: DbInstanceMeta,
}

#[derive(Debug, Clone)]
pub struct DropDatabaseRequest {
    pub database_id: DatabaseId,
}

// ============================================================================
// Service map
// ============================================================================

/// `database_id -> instance` with a `node -> [database_id]` secondary
/// index. Mutations go through `set`/`delete` and persist to the
/// `sqlchain_index` bucket.
pub struct ServiceMap {
    store: Arc<ChainStore>,
    instances: HashMap<DatabaseId, DbInstanceMeta>,
    by_node: HashMap<NodeId, Vec<DatabaseId>>,
}

impl ServiceMap {
    pub fn load(store: Arc<ChainStore>) -> ChainResult<Self> {
        let mut map = Self {
            store,
            instances: HashMap::new(),
            by_node: HashMap::new(),
        };
        for instance in map.store.sqlchains()? {
            map.index_instance(&instance);
            map.instances
                .insert(instance.database_id.clone(), instance);
        }
        Ok(map)
    }

    fn index_instance(&mut self, instance: &DbInstanceMeta) {
        for node in instance.peers.node_ids() {
            self.by_node
                .entry(node)
                .or_default()
                .push(instance.database_id.clone());
        }
    }

    pub fn contains(&self, id: &DatabaseId) -> bool {
        self.instances.contains_key(id)
    }

    pub fn get(&self, id: &DatabaseId) -> ChainResult<DbInstanceMeta> {
        self.instances
            .get(id)
            .cloned()
            .ok_or(ChainError::NoSuchDatabase)
    }

    pub fn get_databases(&self, node: &NodeId) -> Vec<DbInstanceMeta> {
        self.by_node
            .get(node)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.instances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set(&mut self, instance: DbInstanceMeta) -> ChainResult<()> {
        self.store.write_batch(&[WriteOp::Put(
            ChainStore::sqlchain_key(&instance.database_id),
            bincode::serialize(&instance)?,
        )])?;
        self.index_instance(&instance);
        self.instances
            .insert(instance.database_id.clone(), instance);
        Ok(())
    }

    pub fn delete(&mut self, id: &DatabaseId) -> ChainResult<()> {
        let instance = self.instances.remove(id).ok_or(ChainError::NoSuchDatabase)?;
        self.store
            .write_batch(&[WriteOp::Del(ChainStore::sqlchain_key(id))])?;
        for node in instance.peers.node_ids() {
            if let Some(ids) = self.by_node.get_mut(&node) {
                ids.retain(|known| known != id);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct DbService {
    allocation_rounds: usize,
    signing_key: SigningKey,
    caller: Arc<dyn NodeCaller>,
    placement: Arc<dyn Placement>,
    metrics: Arc<NodeMetricMap>,
    service_map: Mutex<ServiceMap>,
}

impl DbService {
    pub fn new(
        allocation_rounds: usize,
        signing_key: SigningKey,
        caller: Arc<dyn NodeCaller>,
        placement: Arc<dyn Placement>,
        metrics: Arc<NodeMetricMap>,
        store: Arc<ChainStore>,
    ) -> ChainResult<Self> {
        Ok(Self {
            allocation_rounds,
            signing_key,
            caller,
            placement,
            metrics,
            service_map: Mutex::new(ServiceMap::load(store)?),
        })
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, ServiceMap> {
        self.service_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Provision a new sharded database: mine an id, allocate miners, fan
    /// out the create directive, compensate with a drop on failure.
    pub async fn create_database(
        &self,
        req: CreateDatabaseRequest,
    ) -> ChainResult<CreateDatabaseResponse> {
        let database_id = self.generate_database_id(&req.node_id);
        debug!(%database_id, "generated database id");

        let peers = self.allocate_nodes(&database_id, &req.resource)?;
        let nodes = peers.node_ids();

        let genesis = self.generate_genesis_block()?;
        let create = SignedUpdateServiceHeader::sign(
            UpdateServiceHeader {
                op: ServiceOp::CreateDb,
                instance: ServiceInstance {
                    database_id: database_id.clone(),
                    peers: Some(peers.clone()),
                    genesis_block: genesis,
                },
            },
            &self.signing_key,
        )?;
        let rollback = SignedUpdateServiceHeader::sign(
            UpdateServiceHeader {
                op: ServiceOp::DropDb,
                instance: ServiceInstance {
                    database_id: database_id.clone(),
                    peers: None,
                    genesis_block: Vec::new(),
                },
            },
            &self.signing_key,
        )?;

        if let Err(err) = self.batch_send_svc_req(&create, &nodes).await {
            warn!(%database_id, error = %err, "create fan-out failed, dropping provisioned subset");
            if let Err(rollback_err) = self.batch_send_svc_req(&rollback, &nodes).await {
                warn!(%database_id, error = %rollback_err, "compensating drop failed");
            }
            return Err(err);
        }

        let instance = DbInstanceMeta {
            database_id: database_id.clone(),
            peers,
            resource: req.resource,
        };
        if let Err(err) = self.lock_map().set(instance.clone()) {
            // The miners accepted the deployment but the map write failed;
            // flag for operator recovery, no automatic reconciliation.
            error!(%database_id, error = %err, "critical: service map write diverged from deployment");
            return Err(err);
        }

        info!(%database_id, nodes = instance.peers.servers.len(), "database created");
        Ok(CreateDatabaseResponse { instance })
    }

    /// Tear down a database across its peer set, then forget it.
    pub async fn drop_database(&self, req: DropDatabaseRequest) -> ChainResult<()> {
        let instance = self.lock_map().get(&req.database_id)?;
        let drop_req = SignedUpdateServiceHeader::sign(
            UpdateServiceHeader {
                op: ServiceOp::DropDb,
                instance: ServiceInstance {
                    database_id: req.database_id.clone(),
                    peers: None,
                    genesis_block: Vec::new(),
                },
            },
            &self.signing_key,
        )?;
        self.batch_send_svc_req(&drop_req, &instance.peers.node_ids())
            .await?;
        self.lock_map().delete(&req.database_id)?;
        info!(database_id = %req.database_id, "database dropped");
        Ok(())
    }

    pub fn get_database(&self, id: &DatabaseId) -> ChainResult<DbInstanceMeta> {
        self.lock_map().get(id)
    }

    pub fn get_node_databases(&self, node: &NodeId) -> Vec<DbInstanceMeta> {
        self.lock_map().get_databases(node)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Single-threaded id miner over the requesting node id, re-mined while
    /// the digest collides with a known database.
    fn generate_database_id(&self, seed: &NodeId) -> DatabaseId {
        let mut nonce: u64 = 0;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(seed.0.as_bytes());
            hasher.update(nonce.to_le_bytes());
            let digest = hasher.finalize();
            if leading_zero_bits(&digest) >= ID_POW_DIFFICULTY {
                let id = DatabaseId(hex::encode(digest));
                if !self.lock_map().contains(&id) {
                    return id;
                }
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Widening-range allocation: attempt `k` asks the ring for
    /// `(k + 1) * node_count` neighbors, drops excluded and under-resourced
    /// nodes, and succeeds once `node_count` candidates remain.
    fn allocate_nodes(&self, db_id: &DatabaseId, resource: &DbResourceMeta) -> ChainResult<Peers> {
        if resource.node_count == 0 {
            return Err(ChainError::DbAllocation);
        }
        let mut exclude: HashSet<NodeId> = HashSet::new();
        let mut range = resource.node_count;

        for round in 0..self.allocation_rounds {
            let neighbors = self.placement.neighbors(db_id.as_str(), range);
            let mut candidates = Vec::new();
            for node in neighbors {
                if exclude.contains(&node.id) {
                    continue;
                }
                match self.metrics.gauge(&node.id, METRIC_FREE_MEMORY_BYTES) {
                    Ok(free) if free > resource.memory => candidates.push(node),
                    Ok(_) => {
                        exclude.insert(node.id);
                    }
                    Err(_) => {
                        // Nodes without the metric cannot be assessed.
                        exclude.insert(node.id);
                    }
                }
            }
            debug!(
                round,
                range,
                candidates = candidates.len(),
                wanted = resource.node_count,
                "allocation attempt"
            );
            if candidates.len() >= resource.node_count {
                candidates.truncate(resource.node_count);
                return self.build_peers(1, candidates);
            }
            range += resource.node_count;
        }
        Err(ChainError::DbAllocation)
    }

    /// Build and sign the peer set, picking a random leader.
    fn build_peers(&self, term: u64, nodes: Vec<NodeInfo>) -> ChainResult<Peers> {
        let leader_idx = rand::thread_rng().gen_range(0..nodes.len());
        let servers: Vec<PeerServer> = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| PeerServer {
                role: if idx == leader_idx {
                    PeerRole::Leader
                } else {
                    PeerRole::Follower
                },
                id: node.id.clone(),
                public_key: node.public_key,
            })
            .collect();
        let mut peers = Peers {
            term,
            leader: nodes[leader_idx].id.clone(),
            servers,
            signee: [0u8; 32],
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        peers.sign(&self.signing_key)?;
        Ok(peers)
    }

    /// Opaque genesis payload for the new sqlchain.
    fn generate_genesis_block(&self) -> ChainResult<Vec<u8>> {
        let timestamp = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_millis() as u64,
            Err(_) => 0,
        };
        let block = genesis_block(&GenesisConfig {
            timestamp,
            version: BLOCK_VERSION,
        });
        Ok(bincode::serialize(&block)?)
    }

    /// Fan a signed directive out to every node in parallel; wait for all,
    /// return the first error observed.
    async fn batch_send_svc_req(
        &self,
        header: &SignedUpdateServiceHeader,
        nodes: &[NodeId],
    ) -> ChainResult<()> {
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let caller = Arc::clone(&self.caller);
            let node = node.clone();
            let req = UpdateServiceReq {
                header: header.clone(),
            };
            handles.push(tokio::spawn(async move {
                caller.update_service(&node, req).await
            }));
        }
        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(ChainError::Rpc(format!("fan-out task failed: {join_err}")));
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Count leading zero bits of a digest.
fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0u32;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_signing_key;
    use crate::rpc::UpdateServiceResp;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Ring stub: first `range` entries of a fixed node list.
    struct FixedRing {
        nodes: Vec<NodeInfo>,
    }

    impl Placement for FixedRing {
        fn neighbors(&self, _key: &str, range: usize) -> Vec<NodeInfo> {
            self.nodes.iter().take(range).cloned().collect()
        }
    }

    /// Caller stub recording directives, optionally failing per node.
    #[derive(Default)]
    struct RecordingCaller {
        log: StdMutex<Vec<(NodeId, ServiceOp)>>,
        fail_on: Option<NodeId>,
    }

    #[async_trait]
    impl NodeCaller for RecordingCaller {
        async fn advise_new_block(
            &self,
            _node: &NodeId,
            _req: crate::rpc::AdviseNewBlockReq,
        ) -> ChainResult<crate::rpc::AdviseNewBlockResp> {
            Err(ChainError::Rpc("not a chain caller".into()))
        }

        async fn fetch_block(
            &self,
            _node: &NodeId,
            _req: crate::rpc::FetchBlockReq,
        ) -> ChainResult<crate::rpc::FetchBlockResp> {
            Err(ChainError::Rpc("not a chain caller".into()))
        }

        async fn update_service(
            &self,
            node: &NodeId,
            req: UpdateServiceReq,
        ) -> ChainResult<UpdateServiceResp> {
            req.header.verify()?;
            self.log
                .lock()
                .expect("log lock")
                .push((node.clone(), req.header.header.op));
            if self.fail_on.as_ref() == Some(node) && req.header.header.op == ServiceOp::CreateDb {
                return Err(ChainError::Rpc(format!("node {node} refused")));
            }
            Ok(UpdateServiceResp { ok: true })
        }
    }

    fn node(n: usize) -> NodeInfo {
        NodeInfo {
            id: NodeId(format!("miner{n:02}")),
            public_key: [n as u8; 32],
        }
    }

    fn service_with(
        rounds: usize,
        ring: Vec<NodeInfo>,
        caller: Arc<RecordingCaller>,
    ) -> (DbService, Arc<NodeMetricMap>) {
        let metrics = Arc::new(NodeMetricMap::new());
        let store = Arc::new(ChainStore::temporary().expect("store"));
        let service = DbService::new(
            rounds,
            test_signing_key(40),
            caller,
            Arc::new(FixedRing { nodes: ring }),
            metrics.clone(),
            store,
        )
        .expect("service");
        (service, metrics)
    }

    #[test]
    fn database_id_satisfies_the_pow_target() {
        let caller = Arc::new(RecordingCaller::default());
        let (service, _) = service_with(2, vec![], caller);
        let id = service.generate_database_id(&NodeId("client00".to_string()));
        let digest = hex::decode(id.as_str()).expect("hex id");
        assert!(leading_zero_bits(&digest) >= ID_POW_DIFFICULTY);
    }

    #[tokio::test]
    async fn allocation_widens_the_range_after_a_thin_round() {
        let ring: Vec<NodeInfo> = (0..6).map(node).collect();
        let caller = Arc::new(RecordingCaller::default());
        let (service, metrics) = service_with(2, ring, caller);

        // First round sees miner00..02: only miner00 has enough memory.
        metrics.set_gauge(NodeId("miner00".to_string()), METRIC_FREE_MEMORY_BYTES, 4 << 30);
        metrics.set_gauge(NodeId("miner01".to_string()), METRIC_FREE_MEMORY_BYTES, 1 << 20);
        metrics.set_gauge(NodeId("miner02".to_string()), METRIC_FREE_MEMORY_BYTES, 1 << 20);
        // Second round widens to six; the rest qualify.
        for n in 3..6 {
            metrics.set_gauge(NodeId(format!("miner{n:02}")), METRIC_FREE_MEMORY_BYTES, 4 << 30);
        }

        let resource = DbResourceMeta {
            node_count: 3,
            memory: 1 << 30,
        };
        let peers = service
            .allocate_nodes(&DatabaseId("db-alloc".to_string()), &resource)
            .expect("allocation succeeds on the widened round");
        assert_eq!(peers.servers.len(), 3);
        peers.verify().expect("signed peer set");
        assert_eq!(
            peers
                .servers
                .iter()
                .filter(|s| s.role == PeerRole::Leader)
                .count(),
            1
        );
        assert!(peers.servers.iter().any(|s| s.id == peers.leader));
    }

    #[tokio::test]
    async fn allocation_fails_after_exhausting_rounds() {
        let ring: Vec<NodeInfo> = (0..6).map(node).collect();
        let caller = Arc::new(RecordingCaller::default());
        let (service, metrics) = service_with(2, ring, caller);
        // Only one node ever has enough memory; no metric for the rest.
        metrics.set_gauge(NodeId("miner00".to_string()), METRIC_FREE_MEMORY_BYTES, 4 << 30);

        let resource = DbResourceMeta {
            node_count: 3,
            memory: 1 << 30,
        };
        let err = service
            .allocate_nodes(&DatabaseId("db-alloc".to_string()), &resource)
            .expect_err("both rounds fall short");
        assert!(matches!(err, ChainError::DbAllocation));
    }

    #[tokio::test]
    async fn create_database_deploys_and_persists() {
        let ring: Vec<NodeInfo> = (0..3).map(node).collect();
        let caller = Arc::new(RecordingCaller::default());
        let (service, metrics) = service_with(2, ring, caller.clone());
        for n in 0..3 {
            metrics.set_gauge(NodeId(format!("miner{n:02}")), METRIC_FREE_MEMORY_BYTES, 4 << 30);
        }

        let resp = service
            .create_database(CreateDatabaseRequest {
                node_id: NodeId("client00".to_string()),
                resource: DbResourceMeta {
                    node_count: 3,
                    memory: 1 << 30,
                },
            })
            .await
            .expect("created");

        let log = caller.log.lock().expect("log");
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|(_, op)| *op == ServiceOp::CreateDb));
        drop(log);

        let id = resp.instance.database_id.clone();
        assert_eq!(service.get_database(&id).expect("lookup").database_id, id);
        let by_node = service.get_node_databases(&NodeId("miner00".to_string()));
        assert_eq!(by_node.len(), 1);
    }

    #[tokio::test]
    async fn failed_deploy_compensates_with_drop() {
        let ring: Vec<NodeInfo> = (0..3).map(node).collect();
        let caller = Arc::new(RecordingCaller {
            log: StdMutex::new(Vec::new()),
            fail_on: Some(NodeId("miner01".to_string())),
        });
        let (service, metrics) = service_with(2, ring, caller.clone());
        for n in 0..3 {
            metrics.set_gauge(NodeId(format!("miner{n:02}")), METRIC_FREE_MEMORY_BYTES, 4 << 30);
        }

        let err = service
            .create_database(CreateDatabaseRequest {
                node_id: NodeId("client00".to_string()),
                resource: DbResourceMeta {
                    node_count: 3,
                    memory: 1 << 30,
                },
            })
            .await
            .expect_err("deploy fails");
        assert!(matches!(err, ChainError::Rpc(_)));

        let log = caller.log.lock().expect("log");
        let drops = log
            .iter()
            .filter(|(_, op)| *op == ServiceOp::DropDb)
            .count();
        assert_eq!(drops, 3, "every allocated node gets the compensating drop");
        drop(log);

        // No instance was recorded.
        assert!(service
            .get_node_databases(&NodeId("miner00".to_string()))
            .is_empty());
    }

    #[tokio::test]
    async fn drop_database_removes_the_instance() {
        let ring: Vec<NodeInfo> = (0..3).map(node).collect();
        let caller = Arc::new(RecordingCaller::default());
        let (service, metrics) = service_with(2, ring, caller.clone());
        for n in 0..3 {
            metrics.set_gauge(NodeId(format!("miner{n:02}")), METRIC_FREE_MEMORY_BYTES, 4 << 30);
        }

        let resp = service
            .create_database(CreateDatabaseRequest {
                node_id: NodeId("client00".to_string()),
                resource: DbResourceMeta {
                    node_count: 2,
                    memory: 1 << 30,
                },
            })
            .await
            .expect("created");
        let id = resp.instance.database_id.clone();

        service
            .drop_database(DropDatabaseRequest {
                database_id: id.clone(),
            })
            .await
            .expect("dropped");
        assert!(matches!(
            service.get_database(&id),
            Err(ChainError::NoSuchDatabase)
        ));
    }

    #[test]
    fn leading_zero_bits_counts_prefix() {
        assert_eq!(leading_zero_bits(&[0x00, 0xff]), 8);
        assert_eq!(leading_zero_bits(&[0x0f]), 4);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
    }
}
