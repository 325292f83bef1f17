//! In-process relay for tests. Each named agent gets its own memory connector,
//! an encrypted channel to the relay, and an endpoint `http://relay.test/<name>`.
//! `send_message` is routed to the agent owning the target endpoint: into its
//! co-protocol tunnel when that thread has a rendezvous, otherwise as an event.
//! Wallet operations are served from a per-agent [`InMemoryWallet`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use didlink_core::envelope::new_id;
use didlink_core::wire::{build_future, request_promise, MSG_TYPE_SEND_MESSAGE};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use didlink_core::{
    decode_frame, encode_frame, Envelope, Frame, InMemoryWallet, Keypair, P2PConnection,
    TunnelFrame, Verkey, Wallet, WalletError, MSG_TYPE_CONTEXT,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::Agent;
use crate::connector::{Link, MemoryConnector};
use crate::session::SessionOptions;
use crate::wallet::WALLET_OP_PREFIX;

pub const MSG_TYPE_ECHO: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/sirius_rpc/1.0/echo";
const MSG_TYPE_EVENT: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/sirius_rpc/1.0/event";
const RPC_CHANNEL: &str = "rpc";
const COPROTOCOL_CHANNEL: &str = "coprotocol";

pub fn endpoint_of(name: &str) -> String {
    format!("http://relay.test/{name}")
}

/// Context frame: rpc/co-protocol channels, one plain endpoint plus a
/// front-end entry with two routing keys, and a balancing group.
pub fn context_value(name: &str) -> Value {
    let address = endpoint_of(name);
    json!({
        "@type": MSG_TYPE_CONTEXT,
        "@id": new_id(),
        "~proxy": [
            {"id": "reverse", "data": {"json": {"address": RPC_CHANNEL}}},
            {"id": "sub-protocol", "data": {"json": {"address": COPROTOCOL_CHANNEL}}}
        ],
        "~endpoints": [
            {"id": "plain", "data": {"json": {"address": address}}},
            {"id": "routed", "data": {"json": {
                "address": address,
                "frontend_routing_key": "frontend-key",
                "routing_keys": [
                    {"routing_key": "routing-key-1", "is_default": true},
                    {"routing_key": "routing-key-2", "is_default": false}
                ]
            }}}
        ],
        "~balancing": [
            {"id": "kafka", "data": {"json": {"group_id": format!("group-{name}")}}}
        ]
    })
}

#[derive(Default)]
struct Peer {
    rpc: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: Option<mpsc::UnboundedSender<Vec<u8>>>,
    p2p: Option<P2PConnection>,
    wallet: Arc<InMemoryWallet>,
}

#[derive(Default)]
struct State {
    peers: HashMap<String, Peer>,
    /// (endpoint, thid) -> co-protocol channel of the agent waiting on that thread.
    rendezvous: HashMap<(String, String), String>,
    rpc_calls: usize,
}

impl State {
    fn send_tunnel(&self, address: &str, channel: &str, message: &Value) {
        let Some(peer) = self.peers.get(address) else {
            return;
        };
        let (Some(p2p), Some(rpc)) = (&peer.p2p, &peer.rpc) else {
            return;
        };
        let frame = Frame::Tunnel(TunnelFrame {
            channel: channel.to_string(),
            payload: p2p.pack(message).unwrap(),
        });
        let _ = rpc.send(encode_frame(&frame).unwrap());
    }

    fn send_event(&self, address: &str, event: &Value) {
        let Some(peer) = self.peers.get(address) else {
            return;
        };
        let (Some(p2p), Some(events)) = (&peer.p2p, &peer.events) else {
            return;
        };
        let _ = events.send(serde_json::to_vec(&p2p.pack(event).unwrap()).unwrap());
    }

    fn route(&mut self, from: &str, params: &Value) -> Result<Value, String> {
        let message = params.get("message").cloned().ok_or("missing message")?;
        let target = params
            .get("endpoint_address")
            .and_then(Value::as_str)
            .ok_or("missing endpoint_address")?
            .to_string();
        if let Some(coprotocol) = params.get("coprotocol") {
            let thid = coprotocol["thid"].as_str().unwrap_or_default().to_string();
            let channel = coprotocol["channel_address"]
                .as_str()
                .unwrap_or(COPROTOCOL_CHANNEL)
                .to_string();
            self.rendezvous.insert((from.to_string(), thid), channel);
        }
        if !self.peers.contains_key(&target) {
            return Ok(json!([false, "unknown endpoint"]));
        }

        let thid = Envelope::from_value(message.clone())
            .ok()
            .and_then(|e| e.thread_id());
        let waiting = thid.and_then(|t| self.rendezvous.remove(&(target.clone(), t)));
        match waiting {
            Some(channel) => self.send_tunnel(&target, &channel, &message),
            None => {
                let event = json!({
                    "@type": MSG_TYPE_EVENT,
                    "@id": new_id(),
                    "message": message,
                    "recipient_verkey": params["recipient_verkeys"].get(0).cloned(),
                    "sender_verkey": params.get("sender_verkey").cloned(),
                });
                self.send_event(&target, &event);
            }
        }
        Ok(json!([true, null]))
    }
}

#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Relay {
    pub fn start() -> Self {
        Self::default()
    }

    /// Connector for agent `name`, plus the agent's side of its channel to the relay.
    pub fn connector(&self, name: &str) -> (MemoryConnector, P2PConnection) {
        let relay_key = Keypair::generate();
        let agent_key = Keypair::generate();
        let address = endpoint_of(name);
        lock(&self.state).peers.entry(address.clone()).or_default().p2p =
            Some(P2PConnection::new(relay_key.clone(), agent_key.verkey()));

        let (connector, mut acceptor) = MemoryConnector::new();
        let state = self.state.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some((path, link)) = acceptor.recv().await {
                let Link { outbound, inbound } = link;
                {
                    let mut s = lock(&state);
                    let peer = s.peers.entry(address.clone()).or_default();
                    match path.as_str() {
                        "/rpc" => peer.rpc = Some(outbound.clone()),
                        _ => peer.events = Some(outbound.clone()),
                    }
                }
                let context = serde_json::to_vec(&context_value(&name)).unwrap();
                let _ = outbound.send(context);
                if path == "/rpc" {
                    tokio::spawn(serve_rpc(state.clone(), address.clone(), inbound));
                } else {
                    tokio::spawn(drain(inbound));
                }
            }
        });
        (connector, P2PConnection::new(agent_key, relay_key.verkey()))
    }

    /// Agent `name`, using the wallet the relay hosts for it.
    pub fn agent(&self, name: &str) -> Agent {
        self.agent_with(name, SessionOptions::default())
    }

    pub fn agent_with(&self, name: &str, options: SessionOptions) -> Agent {
        let (connector, p2p) = self.connector(name);
        Agent::new(Arc::new(connector), Some(p2p), options)
    }

    /// Relay-side store behind `name`'s wallet operations.
    pub fn hosted_wallet(&self, name: &str) -> Arc<InMemoryWallet> {
        lock(&self.state)
            .peers
            .entry(endpoint_of(name))
            .or_default()
            .wallet
            .clone()
    }

    /// Requests received on any rpc session so far.
    pub fn rpc_calls(&self) -> usize {
        lock(&self.state).rpc_calls
    }

    /// Push `message` to `name`'s events session, wrapped as a relay event.
    pub fn push_event(&self, name: &str, message: Value) {
        let event = json!({"@type": MSG_TYPE_EVENT, "@id": new_id(), "message": message});
        lock(&self.state).send_event(&endpoint_of(name), &event);
    }
}

async fn serve_rpc(state: Arc<Mutex<State>>, address: String, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = inbound.recv().await {
        handle_request(&state, &address, &bytes).await;
    }
}

async fn handle_request(state: &Mutex<State>, address: &str, bytes: &[u8]) {
    let Ok(Frame::Tunnel(frame)) = decode_frame(bytes) else {
        return;
    };
    let (p2p, wallet) = {
        let mut s = lock(state);
        s.rpc_calls += 1;
        match s.peers.get(address) {
            Some(Peer { p2p: Some(p2p), wallet, .. }) => (p2p.clone(), wallet.clone()),
            _ => return,
        }
    };
    let request = Envelope::from_value(p2p.unpack(&frame.payload).unwrap()).unwrap();
    let Some(promise) = request_promise(&request) else {
        return;
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let msg_type = request.msg_type().to_string();
    let result = match msg_type.as_str() {
        MSG_TYPE_SEND_MESSAGE => {
            let mut s = lock(state);
            s.route(address, &params)
        }
        MSG_TYPE_ECHO => Ok(params),
        other => match other.strip_prefix(WALLET_OP_PREFIX) {
            Some(operation) => serve_wallet(&*wallet, operation, &params)
                .await
                .map_err(|e| e.to_string()),
            None => Err(format!("unsupported request {other}")),
        },
    };
    let reply = build_future(&promise.id, result).unwrap();
    lock(state).send_tunnel(address, &promise.channel_address, &reply.into_value());
}

fn arg<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T, WalletError> {
    Ok(serde_json::from_value(params.get(key).cloned().unwrap_or(Value::Null))?)
}

fn bytes_arg(params: &Value, key: &str) -> Result<Vec<u8>, WalletError> {
    let text: String = arg(params, key)?;
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| WalletError::Remote(e.to_string()))
}

async fn serve_wallet(wallet: &dyn Wallet, operation: &str, params: &Value) -> Result<Value, WalletError> {
    let value = match operation {
        "create_and_store_my_did" => {
            let seed: Option<String> = arg(params, "seed")?;
            json!(wallet.create_and_store_my_did(seed.as_deref()).await?)
        }
        "create_key" => {
            let seed: Option<String> = arg(params, "seed")?;
            json!(wallet.create_key(seed.as_deref()).await?)
        }
        "key_for_local_did" => json!(wallet.key_for_local_did(&arg::<String>(params, "did")?).await?),
        "key_for_did" => json!(wallet.key_for_did(&arg::<String>(params, "did")?).await?),
        "store_their_did" => {
            let verkey: Verkey = arg(params, "verkey")?;
            wallet.store_their_did(&arg::<String>(params, "did")?, &verkey).await?;
            Value::Null
        }
        "sign" => {
            let verkey: Verkey = arg(params, "verkey")?;
            let signature = wallet.sign(&verkey, &bytes_arg(params, "message")?).await?;
            json!(URL_SAFE_NO_PAD.encode(signature))
        }
        "pack_message" => {
            let recipients: Vec<Verkey> = arg(params, "recipient_verkeys")?;
            let sender: Option<Verkey> = arg(params, "sender_verkey")?;
            let message = bytes_arg(params, "message")?;
            let wire = wallet.pack(&message, &recipients, sender.as_ref()).await?;
            json!(URL_SAFE_NO_PAD.encode(wire))
        }
        "unpack_message" => {
            let opened = wallet.unpack(&bytes_arg(params, "jwe")?).await?;
            json!({
                "message": URL_SAFE_NO_PAD.encode(opened.plaintext),
                "sender_verkey": opened.sender_key,
                "recipient_verkey": opened.recipient_key,
            })
        }
        "create_pairwise" => {
            let their_did: String = arg(params, "their_did")?;
            let my_did: String = arg(params, "my_did")?;
            wallet
                .create_pairwise(&their_did, &my_did, arg(params, "metadata")?)
                .await?;
            Value::Null
        }
        "is_pairwise_exists" => json!(wallet.is_pairwise_exists(&arg::<String>(params, "their_did")?).await?),
        "get_pairwise" => json!(wallet.get_pairwise(&arg::<String>(params, "their_did")?).await?),
        "list_pairwise" => json!(wallet.list_pairwise().await?),
        "set_pairwise_metadata" => {
            let their_did: String = arg(params, "their_did")?;
            wallet
                .set_pairwise_metadata(&their_did, arg(params, "metadata")?)
                .await?;
            Value::Null
        }
        other => return Err(WalletError::Remote(format!("unsupported wallet operation {other}"))),
    };
    Ok(value)
}

async fn drain(mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while inbound.recv().await.is_some() {}
}
