//! Remote-Call service: request/response RPC over the `/rpc` session, plus
//! `send_message` with an optional co-protocol rendezvous.

use std::time::Duration;

use didlink_core::wire::{build_request, MSG_TYPE_SEND_MESSAGE};
use didlink_core::{Endpoint, Message, MessageError, P2PConnection, Verkey};
use serde_json::{json, Value};

use crate::connector::Connector;
use crate::error::AgentError;
use crate::future::RpcFuture;
use crate::session::{Session, SessionOptions, Unmatched};
use crate::tunnel::AddressedTunnel;

pub const RPC_PATH: &str = "/rpc";

pub struct AgentRpc {
    session: Session,
    rpc: AddressedTunnel,
    coprotocol: AddressedTunnel,
    endpoints: Vec<Endpoint>,
}

impl AgentRpc {
    /// Open the session and set up the rpc and co-protocol tunnels from the context.
    pub async fn create(
        connector: &dyn Connector,
        p2p: Option<P2PConnection>,
        options: SessionOptions,
    ) -> Result<Self, AgentError> {
        let session = Session::open(connector, RPC_PATH, p2p, options).await?;
        let (rpc_address, coprotocol_address) = session.context().rpc_channels()?;
        let endpoints = session.context().endpoints()?;
        let rpc = session.tunnel(&rpc_address, Unmatched::Drop);
        let coprotocol = session.tunnel(&coprotocol_address, Unmatched::Queue);
        tracing::info!(
            rpc = %rpc_address,
            coprotocol = %coprotocol_address,
            endpoints = endpoints.len(),
            "rpc session ready"
        );
        Ok(Self {
            session,
            rpc,
            coprotocol,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn io_timeout(&self) -> Duration {
        self.session.options().io_timeout
    }

    /// Tunnel for co-protocol frames that arrive without a waiting thread.
    pub fn coprotocol(&self) -> &AddressedTunnel {
        &self.coprotocol
    }

    pub async fn remote_call(&self, msg_type: &str, params: Value) -> Result<Value, AgentError> {
        self.remote_call_with_timeout(msg_type, params, self.io_timeout())
            .await
    }

    pub async fn remote_call_with_timeout(
        &self,
        msg_type: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        if !self.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let future = RpcFuture::new(&self.rpc, timeout)?;
        let request = build_request(msg_type, &future.promise(), params)?;
        self.rpc.post(&request)?;
        future.wait().await
    }

    /// Hand `message` to the server for delivery. With `coprotocol`, also wait
    /// for the peer's reply on the message thread and return it.
    pub async fn send_message(
        &self,
        message: &Message,
        recipient_keys: &[Verkey],
        endpoint: &str,
        sender_key: Option<&Verkey>,
        routing_keys: &[String],
        coprotocol: bool,
    ) -> Result<Option<Message>, AgentError> {
        if !self.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let timeout = self.io_timeout();
        let envelope = message.encode()?;
        let mut params = json!({
            "message": envelope.as_value(),
            "routing_keys": routing_keys,
            "recipient_verkeys": recipient_keys,
            "sender_verkey": sender_key,
            "endpoint_address": endpoint,
        });
        let rendezvous = if coprotocol {
            let thid = envelope.thread_id().ok_or(MessageError::MissingThread)?;
            let future = RpcFuture::with_id(&self.coprotocol, thid.clone(), timeout)?;
            params["coprotocol"] = json!({
                "thid": thid,
                "ttl": timeout.as_secs(),
                "channel_address": self.coprotocol.address(),
            });
            Some(future)
        } else {
            None
        };

        let reply = self
            .remote_call_with_timeout(MSG_TYPE_SEND_MESSAGE, params, timeout)
            .await?;
        check_delivery(&reply)?;

        match rendezvous {
            Some(mut future) => {
                future.reset_deadline(timeout);
                let envelope = future.wait_envelope().await?;
                Ok(Some(Message::decode(envelope)?))
            }
            None => Ok(None),
        }
    }

    pub fn close(&self) {
        self.session.close();
    }
}

/// Delivery reply is `[success, error-or-null]`.
fn check_delivery(reply: &Value) -> Result<(), AgentError> {
    let Value::Array(items) = reply else {
        return Ok(());
    };
    if let Some(error) = items.get(1).and_then(Value::as_str) {
        return Err(AgentError::Rpc(error.to_string()));
    }
    if items.first().and_then(Value::as_bool) == Some(false) {
        return Err(AgentError::Rpc("delivery failed".into()));
    }
    Ok(())
}
