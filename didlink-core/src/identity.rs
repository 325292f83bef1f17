//! Agent identity and crypto: ed25519 verkeys, DIDs, key agreement, wire encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of a key seed, in bytes (and in characters for string seeds).
pub const SEED_LEN: usize = 32;

/// Verification key: ed25519 public key, base58 on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Verkey([u8; 32]);

impl Verkey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Verkey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// DID derived from this key: base58 of the first 16 key bytes.
    pub fn did(&self) -> String {
        bs58::encode(&self.0[..16]).into_string()
    }

    /// Verify an ed25519 signature made by the holder of this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::NotOnCurve)?;
        let signature = Signature::from_slice(signature).map_err(|_| KeyError::BadSignature)?;
        key.verify(message, &signature)
            .map_err(|_| KeyError::BadSignature)
    }

    /// X25519 form of this key, for key agreement.
    pub fn agreement_key(&self) -> Result<X25519PublicKey, KeyError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::NotOnCurve)?;
        Ok(X25519PublicKey::from(key.to_montgomery().to_bytes()))
    }
}

impl fmt::Display for Verkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Verkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Verkey({})", self.to_base58())
    }
}

impl FromStr for Verkey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| KeyError::InvalidVerkey(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidVerkey(s.to_string()))?;
        Ok(Verkey(bytes))
    }
}

impl TryFrom<String> for Verkey {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Verkey> for String {
    fn from(key: Verkey) -> Self {
        key.to_base58()
    }
}

/// Ed25519 keypair. The secret never leaves this struct; the same secret drives
/// signing and (in X25519 form) key agreement.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    verkey: Verkey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let verkey = Verkey(signing.verifying_key().to_bytes());
        Self { signing, verkey }
    }

    /// Deterministic keypair from a 32-character seed string.
    pub fn from_seed_str(seed: &str) -> Result<Self, KeyError> {
        let bytes: [u8; SEED_LEN] = seed
            .as_bytes()
            .try_into()
            .map_err(|_| KeyError::InvalidSeed(seed.len()))?;
        Ok(Self::from_seed(&bytes))
    }

    pub fn verkey(&self) -> Verkey {
        self.verkey
    }

    pub fn did(&self) -> String {
        self.verkey.did()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Shared secret with another agent's verkey (X25519 over the converted keys).
    pub fn shared_secret(&self, other: &Verkey) -> Result<[u8; 32], KeyError> {
        let other = other.agreement_key()?;
        Ok(self.agreement_with_point(other.as_bytes()))
    }

    /// X25519 agreement with a raw Montgomery point, e.g. an ephemeral sender key.
    pub fn agreement_with_point(&self, point: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.signing.to_scalar_bytes());
        secret
            .diffie_hellman(&X25519PublicKey::from(*point))
            .to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("verkey", &self.verkey)
            .finish_non_exhaustive()
    }
}

/// Derive a 32-byte symmetric key from agreement secrets and a context label.
pub fn derive_session_key(label: &[u8], secrets: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"didlink-pack-v1");
    hasher.update(label);
    for secret in secrets {
        hasher.update(secret);
    }
    hasher.finalize().into()
}

/// Random 96-bit nonce.
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Wire encryption: ChaCha20-Poly1305 with associated data. Output carries the tag at the end.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = chacha20poly1305::Nonce::from_slice(nonce);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = chacha20poly1305::Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid verkey: {0}")]
    InvalidVerkey(String),
    #[error("seed must be {SEED_LEN} bytes, got {0}")]
    InvalidSeed(usize),
    #[error("key is not a valid curve point")]
    NotOnCurve,
    #[error("signature verification failed")]
    BadSignature,
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
