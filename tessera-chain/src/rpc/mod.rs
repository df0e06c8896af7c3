//! RPC surface of the block producer
//!
//! Method names are part of the wire contract. The transport itself is an
//! external collaborator: outbound calls go through the [`NodeCaller`]
//! trait, the receiver side is [`ChainRpcServer`]. [`LoopbackCaller`] wires
//! engines living in the same process together, for tests and single-node
//! deployments.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::errors::{ChainError, ChainResult};
use crate::types::{signature_serde, Block, DatabaseId, Height, NodeId, Peers};

/// Wire name of the advise call.
pub const METHOD_ADVISE_NEW_BLOCK: &str = "MCC.AdviseNewBlock";
/// Wire name of the fetch call.
pub const METHOD_FETCH_BLOCK: &str = "MCC.FetchBlock";
/// Wire name of the service-update call.
pub const METHOD_UPDATE_SERVICE: &str = "DBS.Update";

// ============================================================================
// Envelope
// ============================================================================

/// Routing and authentication metadata carried by every request. The
/// signature covers the request-specific payload; receivers verify before
/// acting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub node_id: NodeId,
    pub signee: [u8; 32],
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

impl Envelope {
    pub fn sign(node_id: NodeId, key: &SigningKey, payload: &[u8]) -> Self {
        Self {
            node_id,
            signee: key.verifying_key().to_bytes(),
            signature: key.sign(payload),
        }
    }

    pub fn verify(&self, payload: &[u8]) -> ChainResult<()> {
        let verifier = VerifyingKey::from_bytes(&self.signee)
            .map_err(|_| ChainError::RequestSignatureInvalid)?;
        verifier
            .verify_strict(payload, &self.signature)
            .map_err(|_| ChainError::RequestSignatureInvalid)
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviseNewBlockReq {
    pub envelope: Envelope,
    pub block: Block,
}

impl AdviseNewBlockReq {
    pub fn new(node_id: NodeId, key: &SigningKey, block: Block) -> Self {
        let envelope = Envelope::sign(node_id, key, &block.hash());
        Self { envelope, block }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviseNewBlockResp {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBlockReq {
    pub envelope: Envelope,
    pub height: Height,
}

impl FetchBlockReq {
    pub fn new(node_id: NodeId, key: &SigningKey, height: Height) -> Self {
        let envelope = Envelope::sign(node_id, key, &height.to_be_bytes());
        Self { envelope, height }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBlockResp {
    pub block: Option<Block>,
}

/// Operation of a service directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceOp {
    CreateDb,
    DropDb,
}

/// Payload of a service directive sent to miner nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub database_id: DatabaseId,
    pub peers: Option<Peers>,
    pub genesis_block: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateServiceHeader {
    pub op: ServiceOp,
    pub instance: ServiceInstance,
}

/// Service directive signed by the block producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedUpdateServiceHeader {
    pub header: UpdateServiceHeader,
    pub signee: [u8; 32],
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

impl SignedUpdateServiceHeader {
    pub fn sign(header: UpdateServiceHeader, key: &SigningKey) -> ChainResult<Self> {
        let payload = bincode::serialize(&header)?;
        Ok(Self {
            header,
            signee: key.verifying_key().to_bytes(),
            signature: key.sign(&payload),
        })
    }

    pub fn verify(&self) -> ChainResult<()> {
        let payload = bincode::serialize(&self.header)?;
        let verifier = VerifyingKey::from_bytes(&self.signee)
            .map_err(|_| ChainError::RequestSignatureInvalid)?;
        verifier
            .verify_strict(&payload, &self.signature)
            .map_err(|_| ChainError::RequestSignatureInvalid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateServiceReq {
    pub header: SignedUpdateServiceHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateServiceResp {
    pub ok: bool,
}

// ============================================================================
// Caller and server
// ============================================================================

/// Outbound calls to a named node. Implementations own transport concerns
/// and propagate the caller's deadline; no internal timeout is imposed.
#[async_trait]
pub trait NodeCaller: Send + Sync {
    async fn advise_new_block(
        &self,
        node: &NodeId,
        req: AdviseNewBlockReq,
    ) -> ChainResult<AdviseNewBlockResp>;

    async fn fetch_block(&self, node: &NodeId, req: FetchBlockReq) -> ChainResult<FetchBlockResp>;

    async fn update_service(
        &self,
        node: &NodeId,
        req: UpdateServiceReq,
    ) -> ChainResult<UpdateServiceResp>;
}

/// Miner-side handler of service directives.
#[async_trait]
pub trait UpdateServiceHandler: Send + Sync {
    async fn update_service(&self, req: UpdateServiceReq) -> ChainResult<UpdateServiceResp>;
}

/// Receiver side of the chain endpoints.
pub struct ChainRpcServer {
    chain: Arc<Chain>,
}

impl ChainRpcServer {
    pub fn new(chain: Arc<Chain>) -> Self {
        Self { chain }
    }

    /// `MCC.AdviseNewBlock`: verify the envelope, enqueue for the block
    /// worker.
    pub async fn advise_new_block(&self, req: AdviseNewBlockReq) -> ChainResult<AdviseNewBlockResp> {
        req.envelope.verify(&req.block.hash())?;
        self.chain.enqueue_rpc_block(req.block).await?;
        Ok(AdviseNewBlockResp {})
    }

    /// `MCC.FetchBlock`: verify the envelope, look the block up on the
    /// head's ancestor path.
    pub async fn fetch_block(&self, req: FetchBlockReq) -> ChainResult<FetchBlockResp> {
        req.envelope.verify(&req.height.to_be_bytes())?;
        match self.chain.fetch_block_by_height(req.height) {
            Ok(block) => Ok(FetchBlockResp { block: Some(block) }),
            Err(ChainError::NoSuchBlock) => Ok(FetchBlockResp { block: None }),
            Err(err) => Err(err),
        }
    }
}

/// In-process transport connecting chains and miners by node id.
#[derive(Default)]
pub struct LoopbackCaller {
    chains: RwLock<HashMap<NodeId, Arc<ChainRpcServer>>>,
    miners: RwLock<HashMap<NodeId, Arc<dyn UpdateServiceHandler>>>,
}

impl LoopbackCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_chain(&self, node: NodeId, server: Arc<ChainRpcServer>) {
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, server);
    }

    pub fn register_miner(&self, node: NodeId, handler: Arc<dyn UpdateServiceHandler>) {
        self.miners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, handler);
    }

    fn chain(&self, node: &NodeId) -> ChainResult<Arc<ChainRpcServer>> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("unknown chain node {node}")))
    }

    fn miner(&self, node: &NodeId) -> ChainResult<Arc<dyn UpdateServiceHandler>> {
        self.miners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("unknown miner node {node}")))
    }
}

#[async_trait]
impl NodeCaller for LoopbackCaller {
    async fn advise_new_block(
        &self,
        node: &NodeId,
        req: AdviseNewBlockReq,
    ) -> ChainResult<AdviseNewBlockResp> {
        self.chain(node)?.advise_new_block(req).await
    }

    async fn fetch_block(&self, node: &NodeId, req: FetchBlockReq) -> ChainResult<FetchBlockResp> {
        self.chain(node)?.fetch_block(req).await
    }

    async fn update_service(
        &self,
        node: &NodeId,
        req: UpdateServiceReq,
    ) -> ChainResult<UpdateServiceResp> {
        self.miner(node)?.update_service(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testutil::test_chain;
    use crate::keys::test_signing_key;
    use std::time::Duration;

    #[test]
    fn envelope_signature_round_trip() {
        let key = test_signing_key(20);
        let envelope = Envelope::sign(NodeId("bp00".to_string()), &key, b"payload");
        envelope.verify(b"payload").expect("valid");
        assert!(envelope.verify(b"other payload").is_err());
    }

    #[test]
    fn service_header_signature_round_trip() {
        let key = test_signing_key(21);
        let header = UpdateServiceHeader {
            op: ServiceOp::CreateDb,
            instance: ServiceInstance {
                database_id: DatabaseId("db0".to_string()),
                peers: None,
                genesis_block: vec![1, 2, 3],
            },
        };
        let signed = SignedUpdateServiceHeader::sign(header, &key).expect("sign");
        signed.verify().expect("valid");
    }

    #[tokio::test]
    async fn produced_block_is_advised_to_the_peer() {
        let caller = Arc::new(LoopbackCaller::new());
        let producer = test_chain(
            "bp00",
            0,
            2,
            &["bp00", "bp01"],
            caller.clone(),
            30,
        );
        let observer = test_chain(
            "bp01",
            1,
            2,
            &["bp00", "bp01"],
            caller.clone(),
            31,
        );
        caller.register_chain(
            NodeId("bp01".to_string()),
            Arc::new(ChainRpcServer::new(observer.clone())),
        );

        // One my-turn tick produces exactly one block and advises the peer.
        producer.produce_block(10_000).await.expect("produce");
        assert_eq!(producer.runtime.head().state.height, 1);

        let (_, mut rpc_rx, _) = observer.take_receivers().expect("receivers");
        let advised = tokio::time::timeout(Duration::from_secs(1), rpc_rx.recv())
            .await
            .expect("advise arrives")
            .expect("block");
        assert_eq!(advised.hash(), producer.runtime.head().state.head_hash);

        // The observer applies it through its own worker path.
        observer.runtime.reset_next_turn(2);
        let mut stash = Vec::new();
        observer.handle_rpc_block(advised, &mut stash);
        assert_eq!(observer.runtime.head().state.height, 1);
        assert_eq!(
            observer.runtime.head().state.head_hash,
            producer.runtime.head().state.head_hash
        );
    }

    #[tokio::test]
    async fn sync_head_fetches_the_missing_turn() {
        let caller = Arc::new(LoopbackCaller::new());
        let source = test_chain(
            "bp00",
            0,
            2,
            &["bp00", "bp01"],
            caller.clone(),
            32,
        );
        let gapped = test_chain(
            "bp01",
            1,
            2,
            &["bp00", "bp01"],
            caller.clone(),
            33,
        );
        caller.register_chain(
            NodeId("bp00".to_string()),
            Arc::new(ChainRpcServer::new(source.clone())),
        );

        for height in 1..=4u64 {
            source.produce_block(height * 10_000).await.expect("produce");
        }

        // head.height(0) < next_turn - 1 = 4: fetch height 4 from peers.
        gapped.runtime.reset_next_turn(5);
        gapped.sync_head().await;

        let (_, mut rpc_rx, _) = gapped.take_receivers().expect("receivers");
        let fetched = tokio::time::timeout(Duration::from_secs(1), rpc_rx.recv())
            .await
            .expect("fetch result")
            .expect("block");
        assert_eq!(
            fetched.hash(),
            source.fetch_block_by_height(4).expect("source block").hash()
        );
    }

    #[tokio::test]
    async fn fetch_block_returns_null_for_unknown_height() {
        let caller = Arc::new(LoopbackCaller::new());
        let chain = test_chain(
            "bp00",
            0,
            1,
            &["bp00"],
            caller.clone(),
            34,
        );
        let server = ChainRpcServer::new(chain);
        let req = FetchBlockReq::new(NodeId("bp01".to_string()), &test_signing_key(35), 9);
        let resp = server.fetch_block(req).await.expect("served");
        assert!(resp.block.is_none());
    }

    #[tokio::test]
    async fn advise_rejects_bad_envelope() {
        let caller = Arc::new(LoopbackCaller::new());
        let chain = test_chain(
            "bp00",
            0,
            1,
            &["bp00"],
            caller.clone(),
            36,
        );
        let block = chain.fetch_block_by_height(0).expect("genesis");
        let server = ChainRpcServer::new(chain);
        let mut req =
            AdviseNewBlockReq::new(NodeId("bp01".to_string()), &test_signing_key(37), block);
        req.envelope.signature = Signature::from_bytes(&[0u8; 64]);
        assert!(matches!(
            server.advise_new_block(req).await,
            Err(ChainError::RequestSignatureInvalid)
        ));
    }
}
