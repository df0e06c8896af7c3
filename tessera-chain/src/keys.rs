//! Node key management and address derivation

use std::fs;
use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::{ChainError, ChainResult};
use crate::types::Address;

/// Load the node signing key from `path`, generating and saving a fresh
/// one on first run.
pub fn load_or_generate_keypair(path: &Path) -> ChainResult<SigningKey> {
    if path.exists() {
        let bytes = fs::read(path)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Config(format!("key file {} is malformed", path.display())))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, seed)?;
    info!(path = %path.display(), "generated node keypair");
    Ok(key)
}

/// Derive an account address from a public key.
pub fn address_from_pubkey(pubkey: &VerifyingKey) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(pubkey.as_bytes());
    hasher.finalize().into()
}

/// Derive an account address from a signing key.
pub fn address_from_privkey(key: &SigningKey) -> Address {
    address_from_pubkey(&key.verifying_key())
}

/// Deterministic signing key for tests.
#[cfg(test)]
pub fn test_signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.key");
        let first = load_or_generate_keypair(&path).expect("generate");
        let second = load_or_generate_keypair(&path).expect("load");
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn address_is_stable_per_key() {
        let key = test_signing_key(11);
        assert_eq!(address_from_privkey(&key), address_from_privkey(&key));
        assert_ne!(
            address_from_privkey(&key),
            address_from_privkey(&test_signing_key(12))
        );
    }
}
