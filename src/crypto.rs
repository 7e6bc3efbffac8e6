//! Node key material and hashing

use crate::types::{Address, Hash, ADDRESS_SIZE};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use thiserror::Error;

pub const PUBKEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Node signing key. Ed25519 signatures are deterministic, which the
/// salt derivation relies on.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair, used by tests and fixtures
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }

    pub fn address(&self) -> Address {
        pubkey_to_address(&self.signing.verifying_key().to_bytes())
    }
}

pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk: [u8; PUBKEY_SIZE] = pubkey
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let vk = VerifyingKey::from_bytes(&pk).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    vk.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn sha3(data: &[u8]) -> Hash {
    Hash(Sha3_256::digest(data).into())
}

pub fn sha3_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    Hash(hasher.finalize().into())
}

/// Tail of the public-key digest, same shape as account addresses
pub fn pubkey_to_address(pubkey: &[u8]) -> Address {
    let digest = sha3(pubkey);
    Address::from_slice(&digest.0[HASH_TAIL..])
}

const HASH_TAIL: usize = crate::types::HASH_SIZE - ADDRESS_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::from_seed([7u8; 32]);
        let sig = keypair.sign(b"ceremony");
        assert!(verify(&keypair.public_key(), b"ceremony", &sig).is_ok());
        assert!(verify(&keypair.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn signatures_are_deterministic() {
        let keypair = Keypair::from_seed([9u8; 32]);
        assert_eq!(keypair.sign(b"salt-input"), keypair.sign(b"salt-input"));
    }

    #[test]
    fn address_is_pubkey_tail() {
        let keypair = Keypair::from_seed([1u8; 32]);
        let digest = sha3(&keypair.public_key());
        assert_eq!(keypair.address().as_bytes(), &digest.0[12..]);
    }
}
