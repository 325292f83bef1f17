//! Agent facade: one rpc session and one events session against the same relay.
//! Unless a local wallet is supplied, wallet operations go to the relay-hosted
//! wallet over the rpc session.

use std::sync::Arc;

use didlink_core::{Delivery, Endpoint, Keypair, Message, P2PConnection, Verkey, Wallet};

use crate::config::Config;
use crate::connector::{Connector, WebSocketConnector};
use crate::error::AgentError;
use crate::events::{AgentEvents, Listener};
use crate::rpc::AgentRpc;
use crate::session::SessionOptions;
use crate::wallet::RpcWallet;

pub struct Agent {
    connector: Arc<dyn Connector>,
    p2p: Option<P2PConnection>,
    options: SessionOptions,
    local_wallet: Option<Arc<dyn Wallet>>,
    rpc: Option<Arc<AgentRpc>>,
    events: Option<Arc<AgentEvents>>,
    wallet: Option<Arc<dyn Wallet>>,
}

impl Agent {
    pub fn new(
        connector: Arc<dyn Connector>,
        p2p: Option<P2PConnection>,
        options: SessionOptions,
    ) -> Self {
        Self {
            connector,
            p2p,
            options,
            local_wallet: None,
            rpc: None,
            events: None,
            wallet: None,
        }
    }

    /// Use `wallet` instead of the relay-hosted one.
    pub fn with_wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.local_wallet = Some(wallet);
        self
    }

    /// WebSocket agent from configuration.
    pub fn from_config(config: &Config) -> Result<Self, AgentError> {
        let connector = WebSocketConnector::new(&config.server_address, config.credentials.clone());
        let p2p = match &config.p2p {
            Some(p2p) => {
                let me = Keypair::from_seed_str(&p2p.my_seed)
                    .map_err(|e| AgentError::ProtocolViolation(format!("p2p seed: {e}")))?;
                let their: Verkey = p2p
                    .their_verkey
                    .parse()
                    .map_err(|e| AgentError::ProtocolViolation(format!("p2p verkey: {e}")))?;
                Some(P2PConnection::new(me, their))
            }
            None => None,
        };
        Ok(Self::new(Arc::new(connector), p2p, config.session_options()))
    }

    /// Open both sessions. A second call on an open agent is a no-op.
    pub async fn open(&mut self) -> Result<(), AgentError> {
        if self.is_open() {
            return Ok(());
        }
        let rpc = AgentRpc::create(&*self.connector, self.p2p.clone(), self.options).await?;
        let events = AgentEvents::create(&*self.connector, self.p2p.clone(), self.options).await?;
        let rpc = Arc::new(rpc);
        let wallet: Arc<dyn Wallet> = match &self.local_wallet {
            Some(wallet) => wallet.clone(),
            None => Arc::new(RpcWallet::new(rpc.clone())),
        };
        tracing::info!(
            endpoints = rpc.endpoints().len(),
            balancing_group = ?events.balancing_group(),
            hosted_wallet = self.local_wallet.is_none(),
            "agent open"
        );
        self.rpc = Some(rpc);
        self.events = Some(Arc::new(events));
        self.wallet = Some(wallet);
        Ok(())
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.wallet = None;
        if let Some(rpc) = self.rpc.take() {
            rpc.close();
        }
        if let Some(events) = self.events.take() {
            events.close();
        }
    }

    pub fn is_open(&self) -> bool {
        let rpc_open = self.rpc.as_ref().is_some_and(|r| r.is_open());
        let events_open = self.events.as_ref().is_some_and(|e| e.is_open());
        rpc_open && events_open
    }

    /// Wallet bound at open; `ConnectionClosed` before that.
    pub fn wallet(&self) -> Result<&Arc<dyn Wallet>, AgentError> {
        self.wallet.as_ref().ok_or(AgentError::ConnectionClosed)
    }

    pub fn rpc(&self) -> Result<&AgentRpc, AgentError> {
        self.rpc.as_deref().ok_or(AgentError::ConnectionClosed)
    }

    /// Endpoints advertised by the relay; empty until opened.
    pub fn endpoints(&self) -> &[Endpoint] {
        self.rpc.as_deref().map(AgentRpc::endpoints).unwrap_or(&[])
    }

    /// First endpoint that needs no routing keys.
    pub fn simple_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints().iter().find(|e| e.routing_keys.is_empty())
    }

    pub fn balancing_group(&self) -> Option<&str> {
        self.events.as_deref().and_then(AgentEvents::balancing_group)
    }

    /// New listener over the shared events session.
    pub fn subscribe(&self) -> Result<Listener, AgentError> {
        let events = self.events.clone().ok_or(AgentError::ConnectionClosed)?;
        Ok(Listener::new(events, self.wallet()?.clone()))
    }

    pub async fn send_message(
        &self,
        message: &Message,
        recipient_keys: &[Verkey],
        endpoint: &str,
        sender_key: Option<&Verkey>,
        routing_keys: &[String],
        coprotocol: bool,
    ) -> Result<Option<Message>, AgentError> {
        self.rpc()?
            .send_message(
                message,
                recipient_keys,
                endpoint,
                sender_key,
                routing_keys,
                coprotocol,
            )
            .await
    }

    /// Perform a delivery produced by a handshake machine.
    pub async fn send_to(&self, delivery: &Delivery) -> Result<Option<Message>, AgentError> {
        tracing::debug!(
            kind = delivery.message.kind(),
            endpoint = %delivery.endpoint,
            expects_reply = delivery.expects_reply,
            "sending"
        );
        self.send_message(
            &delivery.message,
            &delivery.recipient_keys,
            &delivery.endpoint,
            delivery.sender_key.as_ref(),
            &delivery.routing_keys,
            delivery.expects_reply,
        )
        .await
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Relay;
    use didlink_core::InMemoryWallet;
    use std::time::Duration;

    #[tokio::test]
    async fn open_exposes_context() {
        let relay = Relay::start();
        let mut agent = relay.agent("alice");
        assert!(!agent.is_open());
        assert!(agent.endpoints().is_empty());
        agent.open().await.unwrap();
        assert!(agent.is_open());
        assert_eq!(agent.balancing_group(), Some("group-alice"));
        assert_eq!(
            agent.simple_endpoint().map(|e| e.address.as_str()),
            Some("http://relay.test/alice")
        );
        let routed: Vec<_> = agent
            .endpoints()
            .iter()
            .filter(|e| !e.routing_keys.is_empty())
            .collect();
        assert_eq!(routed.len(), 2);
        assert_eq!(routed.iter().filter(|e| e.is_default).count(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let relay = Relay::start();
        let mut agent = relay.agent("alice");
        agent.open().await.unwrap();
        agent.close();
        agent.close();
        assert!(!agent.is_open());
        assert!(matches!(agent.rpc(), Err(AgentError::ConnectionClosed)));
        assert!(matches!(agent.wallet(), Err(AgentError::ConnectionClosed)));
        assert!(matches!(agent.subscribe(), Err(AgentError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn open_binds_relay_hosted_wallet() {
        let relay = Relay::start();
        let mut agent = relay.agent("alice");
        assert!(agent.wallet().is_err());
        agent.open().await.unwrap();

        let calls_before = relay.rpc_calls();
        let (did, verkey) = agent
            .wallet()
            .unwrap()
            .create_and_store_my_did(None)
            .await
            .unwrap();
        assert!(relay.rpc_calls() > calls_before);
        let hosted = relay.hosted_wallet("alice");
        assert_eq!(hosted.key_for_local_did(&did).await.unwrap(), verkey);
    }

    #[tokio::test]
    async fn local_wallet_stays_local() {
        let relay = Relay::start();
        let local: Arc<dyn Wallet> = Arc::new(InMemoryWallet::new());
        let mut agent = relay.agent("alice").with_wallet(local.clone());
        agent.open().await.unwrap();

        let calls_before = relay.rpc_calls();
        let verkey = agent.wallet().unwrap().create_key(None).await.unwrap();
        assert_eq!(relay.rpc_calls(), calls_before);
        let signature = local.sign(&verkey, b"x").await.unwrap();
        assert!(local.verify(&verkey, b"x", &signature).await);
    }

    #[tokio::test]
    async fn message_between_agents_arrives_as_event() {
        let relay = Relay::start();
        let mut alice = relay.agent("alice");
        let mut bob = relay.agent("bob");
        alice.open().await.unwrap();
        bob.open().await.unwrap();

        let (_, alice_vk) = alice
            .wallet()
            .unwrap()
            .create_and_store_my_did(None)
            .await
            .unwrap();
        let (_, bob_vk) = bob
            .wallet()
            .unwrap()
            .create_and_store_my_did(None)
            .await
            .unwrap();
        let listener = bob.subscribe().unwrap();

        let ack = didlink_core::Ack::new("t-1", didlink_core::Status::Ok);
        let reply = alice
            .send_message(
                &ack.into(),
                &[bob_vk],
                "http://relay.test/bob",
                Some(&alice_vk),
                &[],
                false,
            )
            .await
            .unwrap();
        assert!(reply.is_none());

        let event = listener.get(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(event.message, Message::Ack(_)));
        assert_eq!(event.recipient_verkey, Some(bob_vk));
        assert_eq!(event.sender_verkey, Some(alice_vk));
        assert!(event.pairwise.is_none());
    }
}
