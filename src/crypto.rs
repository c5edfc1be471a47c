//! # Signing primitives
//!
//! Every signed artifact in the core (query plans, audit entries, capsule
//! breach proofs) goes through the [`KeyStore`] trait rather than a
//! concrete key type, so the algorithm behind a `signing_key_id` can change
//! without touching call sites. One concrete backend ships here —
//! [`SoftwareKeyStore`], Ed25519 keys held in process memory — but any
//! implementation that signs/verifies byte strings and exposes a public
//! key can be swapped in.
//!
//! # Example
//!
//! ```rust
//! use consent_core::crypto::{SoftwareKeyStore, KeyStore};
//!
//! let key_store = SoftwareKeyStore::generate();
//! let data = b"canonical signable form";
//! let signature = key_store.sign(data).unwrap();
//! assert!(key_store.verify(data, &signature).is_ok());
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to sign data: {0}")]
    SigningFailed(String),

    #[error("failed to verify signature: {0}")]
    VerificationFailed(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Pluggable key storage backend.
///
/// Implementations MUST use constant-time verification and be `Send + Sync`
/// so a key store can be shared across the per-entity locks described in the
/// concurrency model.
pub trait KeyStore: Send + Sync {
    /// Sign `data` with the private key, returning the raw signature bytes.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify `signature` over `data` against the public key.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;

    /// The public key, in whatever encoding the backend's algorithm defines.
    fn public_key_bytes(&self) -> Vec<u8>;

    /// A stable identifier a caller can record as `signing_key_id`.
    fn identifier(&self) -> String {
        "KeyStore".to_string()
    }
}

/// Configuration selecting which `KeyStore` backend to construct.
///
/// Only `Software` is implemented today; the enum exists so a collaborator
/// can add a hardware-backed variant without changing callers that hold a
/// `KeyStoreConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStoreConfig {
    Software,
}

pub fn create_key_store(config: KeyStoreConfig) -> Box<dyn KeyStore> {
    match config {
        KeyStoreConfig::Software => Box::new(SoftwareKeyStore::generate()),
    }
}

/// Ed25519 keys held in process memory.
///
/// Keys are lost on process termination; for a persistent identity use
/// [`SoftwareKeyStore::from_seed`] with a seed the caller stores securely.
#[derive(Clone)]
pub struct SoftwareKeyStore {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SoftwareKeyStore {
    /// Generate a new random Ed25519 keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        SoftwareKeyStore {
            signing_key,
            verifying_key,
        }
    }

    /// Derive a deterministic keypair from a 32-byte seed.
    ///
    /// The seed must come from a CSPRNG and be stored securely; it is
    /// equivalent to the private key.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        SoftwareKeyStore {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key_bytes_array(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

impl KeyStore for SoftwareKeyStore {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let sig = Signature::from_slice(signature)
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;
        self.verifying_key
            .verify(data, &sig)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(())
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }

    fn identifier(&self) -> String {
        format!(
            "SoftwareKeyStore(Ed25519:{})",
            hex::encode(&self.public_key_bytes()[0..8])
        )
    }
}

/// Hash data with SHA-256. Used for content hashes and the audit chain,
/// not for signing (Ed25519 hashes internally with SHA-512).
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 32 bytes of OS randomness, used for nonces and capsule encryption keys.
pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::RngCore::fill_bytes(&mut OsRng, &mut nonce);
    nonce
}
