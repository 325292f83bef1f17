//! Wallet capability: key storage, signing, pack/unpack and pairwise records.
//!
//! The agent only talks to a [`Wallet`] trait object. Operations are async so a
//! wallet can live behind the relay; [`InMemoryWallet`] is a complete local
//! implementation kept in process memory.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{KeyError, Keypair, Verkey};
use crate::pack::{self, Opened, PackError};

/// One half of a pairwise relationship as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseRecord {
    pub my_did: String,
    pub their_did: String,
    pub metadata: Value,
}

#[async_trait]
pub trait Wallet: Send + Sync {
    /// New DID with its verkey. With a seed, repeated calls return the same DID.
    async fn create_and_store_my_did(&self, seed: Option<&str>) -> Result<(String, Verkey), WalletError>;

    /// New signing key. With a seed, repeated calls return the existing key.
    async fn create_key(&self, seed: Option<&str>) -> Result<Verkey, WalletError>;

    async fn key_for_local_did(&self, did: &str) -> Result<Verkey, WalletError>;

    /// Verkey for a local DID or a stored counterpart DID.
    async fn key_for_did(&self, did: &str) -> Result<Verkey, WalletError>;

    async fn store_their_did(&self, did: &str, verkey: &Verkey) -> Result<(), WalletError>;

    async fn sign(&self, verkey: &Verkey, message: &[u8]) -> Result<Vec<u8>, WalletError>;

    async fn verify(&self, verkey: &Verkey, message: &[u8], signature: &[u8]) -> bool {
        verkey.verify(message, signature).is_ok()
    }

    /// Seal for `recipients`; anonymous when `sender` is `None`.
    async fn pack(
        &self,
        message: &[u8],
        recipients: &[Verkey],
        sender: Option<&Verkey>,
    ) -> Result<Vec<u8>, WalletError>;

    async fn unpack(&self, wire: &[u8]) -> Result<Opened, WalletError>;

    async fn create_pairwise(
        &self,
        their_did: &str,
        my_did: &str,
        metadata: Value,
    ) -> Result<(), WalletError>;

    async fn is_pairwise_exists(&self, their_did: &str) -> Result<bool, WalletError>;

    async fn get_pairwise(&self, their_did: &str) -> Result<PairwiseRecord, WalletError>;

    async fn list_pairwise(&self) -> Result<Vec<PairwiseRecord>, WalletError>;

    async fn set_pairwise_metadata(&self, their_did: &str, metadata: Value) -> Result<(), WalletError>;
}

#[derive(Default)]
struct Store {
    keys: HashMap<Verkey, Keypair>,
    my_dids: HashMap<String, Verkey>,
    their_dids: HashMap<String, Verkey>,
    pairwise: HashMap<String, PairwiseRecord>,
}

#[derive(Default)]
pub struct InMemoryWallet {
    store: RwLock<Store>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    fn keypair(seed: Option<&str>) -> Result<Keypair, WalletError> {
        Ok(match seed {
            Some(seed) => Keypair::from_seed_str(seed)?,
            None => Keypair::generate(),
        })
    }
}

impl std::fmt::Debug for InMemoryWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.read();
        f.debug_struct("InMemoryWallet")
            .field("keys", &store.keys.len())
            .field("pairwise", &store.pairwise.len())
            .finish()
    }
}

#[async_trait]
impl Wallet for InMemoryWallet {
    async fn create_and_store_my_did(&self, seed: Option<&str>) -> Result<(String, Verkey), WalletError> {
        let keypair = Self::keypair(seed)?;
        let (did, verkey) = (keypair.did(), keypair.verkey());
        let mut store = self.write();
        store.keys.entry(verkey).or_insert(keypair);
        store.my_dids.insert(did.clone(), verkey);
        Ok((did, verkey))
    }

    async fn create_key(&self, seed: Option<&str>) -> Result<Verkey, WalletError> {
        let keypair = Self::keypair(seed)?;
        let verkey = keypair.verkey();
        self.write().keys.entry(verkey).or_insert(keypair);
        Ok(verkey)
    }

    async fn key_for_local_did(&self, did: &str) -> Result<Verkey, WalletError> {
        self.read()
            .my_dids
            .get(did)
            .copied()
            .ok_or_else(|| WalletError::UnknownDid(did.to_string()))
    }

    async fn key_for_did(&self, did: &str) -> Result<Verkey, WalletError> {
        let store = self.read();
        store
            .my_dids
            .get(did)
            .or_else(|| store.their_dids.get(did))
            .copied()
            .ok_or_else(|| WalletError::UnknownDid(did.to_string()))
    }

    async fn store_their_did(&self, did: &str, verkey: &Verkey) -> Result<(), WalletError> {
        self.write().their_dids.insert(did.to_string(), *verkey);
        Ok(())
    }

    async fn sign(&self, verkey: &Verkey, message: &[u8]) -> Result<Vec<u8>, WalletError> {
        let store = self.read();
        let keypair = store.keys.get(verkey).ok_or(WalletError::UnknownKey(*verkey))?;
        Ok(keypair.sign(message))
    }

    async fn pack(
        &self,
        message: &[u8],
        recipients: &[Verkey],
        sender: Option<&Verkey>,
    ) -> Result<Vec<u8>, WalletError> {
        let sender = match sender {
            Some(verkey) => Some(
                self.read()
                    .keys
                    .get(verkey)
                    .cloned()
                    .ok_or(WalletError::UnknownKey(*verkey))?,
            ),
            None => None,
        };
        Ok(pack::seal(message, recipients, sender.as_ref())?)
    }

    async fn unpack(&self, wire: &[u8]) -> Result<Opened, WalletError> {
        let store = self.read();
        Ok(pack::open(wire, |kid| store.keys.get(kid).cloned())?)
    }

    async fn create_pairwise(
        &self,
        their_did: &str,
        my_did: &str,
        metadata: Value,
    ) -> Result<(), WalletError> {
        let mut store = self.write();
        if store.pairwise.contains_key(their_did) {
            return Err(WalletError::AlreadyExists(their_did.to_string()));
        }
        if !store.their_dids.contains_key(their_did) {
            return Err(WalletError::UnknownDid(their_did.to_string()));
        }
        if !store.my_dids.contains_key(my_did) {
            return Err(WalletError::UnknownDid(my_did.to_string()));
        }
        store.pairwise.insert(
            their_did.to_string(),
            PairwiseRecord {
                my_did: my_did.to_string(),
                their_did: their_did.to_string(),
                metadata,
            },
        );
        Ok(())
    }

    async fn is_pairwise_exists(&self, their_did: &str) -> Result<bool, WalletError> {
        Ok(self.read().pairwise.contains_key(their_did))
    }

    async fn get_pairwise(&self, their_did: &str) -> Result<PairwiseRecord, WalletError> {
        self.read()
            .pairwise
            .get(their_did)
            .cloned()
            .ok_or_else(|| WalletError::UnknownDid(their_did.to_string()))
    }

    async fn list_pairwise(&self) -> Result<Vec<PairwiseRecord>, WalletError> {
        Ok(self.read().pairwise.values().cloned().collect())
    }

    async fn set_pairwise_metadata(&self, their_did: &str, metadata: Value) -> Result<(), WalletError> {
        let mut store = self.write();
        let record = store
            .pairwise
            .get_mut(their_did)
            .ok_or_else(|| WalletError::UnknownDid(their_did.to_string()))?;
        record.metadata = metadata;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("unknown DID: {0}")]
    UnknownDid(String),
    #[error("unknown key: {0}")]
    UnknownKey(Verkey),
    #[error("pack error: {0}")]
    Pack(#[from] PackError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A wallet hosted elsewhere failed or could not be reached.
    #[error("remote wallet: {0}")]
    Remote(String),
}
