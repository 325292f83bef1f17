//! Wallet hosted by the relay. Every operation is a remote call on the agent's
//! rpc session; byte payloads travel as unpadded base64url.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use didlink_core::pack::Opened;
use didlink_core::{PairwiseRecord, Verkey, Wallet, WalletError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rpc::AgentRpc;

/// Wallet operations are `<prefix><operation>`, e.g. `...sirius_rpc/1.0/sign`.
pub const WALLET_OP_PREFIX: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/sirius_rpc/1.0/";

pub struct RpcWallet {
    rpc: Arc<AgentRpc>,
}

#[derive(Deserialize)]
struct UnpackedReply {
    message: String,
    #[serde(default)]
    sender_verkey: Option<Verkey>,
    recipient_verkey: Verkey,
}

impl RpcWallet {
    pub fn new(rpc: Arc<AgentRpc>) -> Self {
        Self { rpc }
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, params: Value) -> Result<T, WalletError> {
        let msg_type = format!("{WALLET_OP_PREFIX}{operation}");
        let value = self
            .rpc
            .remote_call(&msg_type, params)
            .await
            .map_err(|e| WalletError::Remote(format!("{operation}: {e}")))?;
        Ok(serde_json::from_value(value)?)
    }
}

fn decode(text: &str) -> Result<Vec<u8>, WalletError> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| WalletError::Remote(format!("bad base64 in reply: {e}")))
}

#[async_trait]
impl Wallet for RpcWallet {
    async fn create_and_store_my_did(&self, seed: Option<&str>) -> Result<(String, Verkey), WalletError> {
        self.call("create_and_store_my_did", json!({ "seed": seed }))
            .await
    }

    async fn create_key(&self, seed: Option<&str>) -> Result<Verkey, WalletError> {
        self.call("create_key", json!({ "seed": seed })).await
    }

    async fn key_for_local_did(&self, did: &str) -> Result<Verkey, WalletError> {
        self.call("key_for_local_did", json!({ "did": did })).await
    }

    async fn key_for_did(&self, did: &str) -> Result<Verkey, WalletError> {
        self.call("key_for_did", json!({ "did": did })).await
    }

    async fn store_their_did(&self, did: &str, verkey: &Verkey) -> Result<(), WalletError> {
        self.call("store_their_did", json!({ "did": did, "verkey": verkey }))
            .await
    }

    async fn sign(&self, verkey: &Verkey, message: &[u8]) -> Result<Vec<u8>, WalletError> {
        let params = json!({
            "verkey": verkey,
            "message": URL_SAFE_NO_PAD.encode(message),
        });
        let signature: String = self.call("sign", params).await?;
        decode(&signature)
    }

    async fn pack(
        &self,
        message: &[u8],
        recipients: &[Verkey],
        sender: Option<&Verkey>,
    ) -> Result<Vec<u8>, WalletError> {
        let params = json!({
            "message": URL_SAFE_NO_PAD.encode(message),
            "recipient_verkeys": recipients,
            "sender_verkey": sender,
        });
        let wire: String = self.call("pack_message", params).await?;
        decode(&wire)
    }

    async fn unpack(&self, wire: &[u8]) -> Result<Opened, WalletError> {
        let reply: UnpackedReply = self
            .call("unpack_message", json!({ "jwe": URL_SAFE_NO_PAD.encode(wire) }))
            .await?;
        Ok(Opened {
            plaintext: decode(&reply.message)?,
            sender_key: reply.sender_verkey,
            recipient_key: reply.recipient_verkey,
        })
    }

    async fn create_pairwise(
        &self,
        their_did: &str,
        my_did: &str,
        metadata: Value,
    ) -> Result<(), WalletError> {
        let params = json!({
            "their_did": their_did,
            "my_did": my_did,
            "metadata": metadata,
        });
        self.call("create_pairwise", params).await
    }

    async fn is_pairwise_exists(&self, their_did: &str) -> Result<bool, WalletError> {
        self.call("is_pairwise_exists", json!({ "their_did": their_did }))
            .await
    }

    async fn get_pairwise(&self, their_did: &str) -> Result<PairwiseRecord, WalletError> {
        self.call("get_pairwise", json!({ "their_did": their_did }))
            .await
    }

    async fn list_pairwise(&self) -> Result<Vec<PairwiseRecord>, WalletError> {
        self.call("list_pairwise", json!({})).await
    }

    async fn set_pairwise_metadata(&self, their_did: &str, metadata: Value) -> Result<(), WalletError> {
        let params = json!({ "their_did": their_did, "metadata": metadata });
        self.call("set_pairwise_metadata", params).await
    }
}

impl std::fmt::Debug for RpcWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcWallet")
            .field("open", &self.rpc.is_open())
            .finish()
    }
}
