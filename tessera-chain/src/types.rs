//! Core types of the Tessera chain

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::errors::{ChainError, ChainResult};
use crate::merkle::merkle_root;

/// 32-byte hash type used for block hashes, merkle roots, tx hashes.
pub type Hash = [u8; 32];

/// 32-byte account address derived from a public key.
pub type Address = [u8; 32];

/// Block height.
pub type Height = u64;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Per-account transaction sequence number.
pub type Nonce = u64;

/// Current block format version.
pub const BLOCK_VERSION: u32 = 1;

/// Identifier of a node in the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a provisioned sharded database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(pub String);

impl DatabaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Blocks
// ============================================================================

/// Block header covered by the producer signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block format version.
    pub version: u32,
    /// Address of the producing node's account.
    pub producer: Address,
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Merkle root over the transaction hashes, in order.
    pub merkle_root: Hash,
    /// Production timestamp (ms since epoch).
    pub timestamp: Timestamp,
}

impl BlockHeader {
    /// The block hash is the digest of the encoded header.
    pub fn compute_hash(&self) -> ChainResult<Hash> {
        let encoded = bincode::serialize(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }
}

/// Header plus its hash and producer signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBlockHeader {
    pub header: BlockHeader,
    /// `H(header_bytes)`.
    pub block_hash: Hash,
    /// Producer public key.
    pub signee: [u8; 32],
    /// Producer signature over `block_hash`.
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

impl SignedBlockHeader {
    /// Check hash integrity and the producer signature.
    pub fn verify(&self) -> ChainResult<()> {
        if self.header.compute_hash()? != self.block_hash {
            return Err(ChainError::InvalidHash);
        }
        let verifier = VerifyingKey::from_bytes(&self.signee)
            .map_err(|_| ChainError::BlockSignatureInvalid)?;
        verifier
            .verify_strict(&self.block_hash, &self.signature)
            .map_err(|_| ChainError::BlockSignatureInvalid)
    }
}

/// Signed header plus transaction list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub signed_header: SignedBlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble an unsigned block over `transactions`.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            signed_header: SignedBlockHeader {
                header,
                block_hash: [0u8; 32],
                signee: [0u8; 32],
                signature: Signature::from_bytes(&[0u8; 64]),
            },
            transactions,
        }
    }

    /// Compute the merkle root, the block hash, and sign the header.
    pub fn pack_and_sign(&mut self, key: &SigningKey) -> ChainResult<()> {
        self.signed_header.header.merkle_root = merkle_root(&self.tx_hashes());
        self.signed_header.block_hash = self.signed_header.header.compute_hash()?;
        self.signed_header.signee = key.verifying_key().to_bytes();
        self.signed_header.signature = key.sign(&self.signed_header.block_hash);
        Ok(())
    }

    /// Full verification: merkle root, hash integrity, producer signature.
    pub fn verify(&self) -> ChainResult<()> {
        if merkle_root(&self.tx_hashes()) != self.signed_header.header.merkle_root {
            return Err(ChainError::InvalidMerkleRoot);
        }
        self.signed_header.verify()
    }

    pub fn hash(&self) -> Hash {
        self.signed_header.block_hash
    }

    pub fn parent_hash(&self) -> Hash {
        self.signed_header.header.parent_hash
    }

    pub fn timestamp(&self) -> Timestamp {
        self.signed_header.header.timestamp
    }

    /// Transaction hashes in block order.
    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(Transaction::hash).collect()
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Closed set of transaction kinds. Each kind owns a durable sub-bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Billing,
}

impl TxKind {
    /// Durable sub-bucket name under `tx_index/`.
    pub fn bucket(&self) -> &'static str {
        match self {
            TxKind::Billing => "billing",
        }
    }
}

/// Tagged transaction variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Transaction {
    Billing(TxBilling),
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::Billing(_) => TxKind::Billing,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Transaction::Billing(tx) => tx.hash(),
        }
    }

    /// The account whose nonce sequence this transaction consumes.
    pub fn account(&self) -> Address {
        match self {
            Transaction::Billing(tx) => tx.producer,
        }
    }

    pub fn nonce(&self) -> Nonce {
        match self {
            Transaction::Billing(tx) => tx.nonce,
        }
    }

    pub fn verify_signature(&self) -> ChainResult<()> {
        match self {
            Transaction::Billing(tx) => tx.verify_signature(),
        }
    }
}

/// Billing transaction: credits each receiver `fees[i] + rewards[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxBilling {
    pub nonce: Nonce,
    /// Hash of the billing request this transaction settles.
    pub request_hash: Hash,
    /// The block producer issuing the transaction.
    pub producer: Address,
    pub receivers: Vec<Address>,
    pub fees: Vec<u64>,
    pub rewards: Vec<u64>,
    pub signee: [u8; 32],
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

impl TxBilling {
    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes.extend_from_slice(&self.request_hash);
        bytes.extend_from_slice(&self.producer);
        for receiver in &self.receivers {
            bytes.extend_from_slice(receiver);
        }
        for fee in &self.fees {
            bytes.extend_from_slice(&fee.to_le_bytes());
        }
        for reward in &self.rewards {
            bytes.extend_from_slice(&reward.to_le_bytes());
        }
        bytes
    }

    /// Transaction hash over the signed content (signature excluded).
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_bytes());
        hasher.finalize().into()
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.signee = key.verifying_key().to_bytes();
        self.signature = key.sign(&self.signing_bytes());
    }

    pub fn verify_signature(&self) -> ChainResult<()> {
        let verifier =
            VerifyingKey::from_bytes(&self.signee).map_err(|_| ChainError::TxSignatureInvalid)?;
        verifier
            .verify_strict(&self.signing_bytes(), &self.signature)
            .map_err(|_| ChainError::TxSignatureInvalid)
    }
}

// ============================================================================
// Billing requests
// ============================================================================

/// Gas consumed by one account on a sqlchain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasAmount {
    pub address: Address,
    pub gas: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRequestHeader {
    pub database_id: DatabaseId,
    pub gas_amounts: Vec<GasAmount>,
}

/// One signature attached to a billing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSignature {
    pub signee: [u8; 32],
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

/// A billing request signed by the miners of a sqlchain and countersigned
/// by the block producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRequest {
    pub header: BillingRequestHeader,
    pub request_hash: Hash,
    /// Signatures over `request_hash`.
    pub signatures: Vec<RequestSignature>,
}

impl BillingRequest {
    pub fn new(header: BillingRequestHeader) -> ChainResult<Self> {
        let request_hash = Self::compute_request_hash(&header)?;
        Ok(Self {
            header,
            request_hash,
            signatures: Vec::new(),
        })
    }

    pub fn compute_request_hash(header: &BillingRequestHeader) -> ChainResult<Hash> {
        let encoded = bincode::serialize(header)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }

    /// Append a signature over the request hash.
    pub fn sign(&mut self, key: &SigningKey) {
        self.signatures.push(RequestSignature {
            signee: key.verifying_key().to_bytes(),
            signature: key.sign(&self.request_hash),
        });
    }

    /// Verify hash integrity and every attached signature.
    pub fn verify_signatures(&self) -> ChainResult<()> {
        if Self::compute_request_hash(&self.header)? != self.request_hash {
            return Err(ChainError::RequestSignatureInvalid);
        }
        for sig in &self.signatures {
            let verifier = VerifyingKey::from_bytes(&sig.signee)
                .map_err(|_| ChainError::RequestSignatureInvalid)?;
            verifier
                .verify_strict(&self.request_hash, &sig.signature)
                .map_err(|_| ChainError::RequestSignatureInvalid)?;
        }
        Ok(())
    }
}

// ============================================================================
// Service placement
// ============================================================================

/// Role of a node inside a sqlchain peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerServer {
    pub role: PeerRole,
    pub id: NodeId,
    pub public_key: [u8; 32],
}

/// Signed peer set of a provisioned sqlchain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peers {
    pub term: u64,
    pub leader: NodeId,
    pub servers: Vec<PeerServer>,
    pub signee: [u8; 32],
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

impl Peers {
    fn signing_bytes(&self) -> ChainResult<Vec<u8>> {
        let mut bytes = bincode::serialize(&(self.term, &self.leader))?;
        bytes.extend(bincode::serialize(&self.servers)?);
        Ok(bytes)
    }

    pub fn sign(&mut self, key: &SigningKey) -> ChainResult<()> {
        self.signee = key.verifying_key().to_bytes();
        self.signature = key.sign(&self.signing_bytes()?);
        Ok(())
    }

    pub fn verify(&self) -> ChainResult<()> {
        let verifier = VerifyingKey::from_bytes(&self.signee)
            .map_err(|_| ChainError::RequestSignatureInvalid)?;
        verifier
            .verify_strict(&self.signing_bytes()?, &self.signature)
            .map_err(|_| ChainError::RequestSignatureInvalid)
    }

    /// The node ids of every server in the peer set.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.servers.iter().map(|s| s.id.clone()).collect()
    }
}

/// Resources requested for a new sharded database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbResourceMeta {
    /// Number of miner nodes to allocate.
    pub node_count: usize,
    /// Minimum free memory per node, in bytes.
    pub memory: u64,
}

/// Durable record of a provisioned database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInstanceMeta {
    pub database_id: DatabaseId,
    pub peers: Peers,
    pub resource: DbResourceMeta,
}

// ============================================================================
// Signature serde
// ============================================================================

/// Serde support for ed25519 signatures.
pub mod signature_serde {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(sig: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        sig.to_bytes().to_vec().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let array: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid signature length"))?;
        Ok(Signature::from_bytes(&array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_signing_key;

    #[test]
    fn block_hash_matches_header_bytes() {
        let key = test_signing_key(1);
        let mut block = Block::new(
            BlockHeader {
                version: BLOCK_VERSION,
                producer: [1u8; 32],
                parent_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1_000,
            },
            vec![],
        );
        block.pack_and_sign(&key).expect("sign");
        assert_eq!(
            block.signed_header.header.compute_hash().expect("hash"),
            block.hash()
        );
        block.verify().expect("verify");
    }

    #[test]
    fn tampered_header_fails_verification() {
        let key = test_signing_key(2);
        let mut block = Block::new(
            BlockHeader {
                version: BLOCK_VERSION,
                producer: [1u8; 32],
                parent_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1_000,
            },
            vec![],
        );
        block.pack_and_sign(&key).expect("sign");
        block.signed_header.header.timestamp = 2_000;
        assert!(matches!(block.verify(), Err(ChainError::InvalidHash)));
    }

    #[test]
    fn billing_tx_signature_round_trip() {
        let key = test_signing_key(3);
        let mut tx = TxBilling {
            nonce: 0,
            request_hash: [7u8; 32],
            producer: [1u8; 32],
            receivers: vec![[2u8; 32]],
            fees: vec![10],
            rewards: vec![0],
            signee: [0u8; 32],
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        tx.sign(&key);
        tx.verify_signature().expect("valid signature");

        tx.fees[0] = 11;
        assert!(tx.verify_signature().is_err());
    }

    #[test]
    fn billing_request_counter_signatures_verify() {
        let miner = test_signing_key(4);
        let producer = test_signing_key(5);
        let mut request = BillingRequest::new(BillingRequestHeader {
            database_id: DatabaseId("db0".to_string()),
            gas_amounts: vec![GasAmount {
                address: [9u8; 32],
                gas: 3,
            }],
        })
        .expect("request");
        request.sign(&miner);
        request.sign(&producer);
        request.verify_signatures().expect("all signatures verify");
    }
}
