//! Correlation future: a single-use, deadline-bounded wait for the frame
//! carrying a given thread id.
//!
//! The deadline belongs to the future, not the tunnel: each future checks it
//! before suspending and waits with `timeout_at`, so unrelated calls never
//! block each other. Dropping a future deregisters its waiter.

use std::sync::Weak;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use didlink_core::envelope::new_id;
use didlink_core::wire::parse_future;
use didlink_core::{Envelope, Promise};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::AgentError;
use crate::session::SessionInner;
use crate::tunnel::AddressedTunnel;

pub struct RpcFuture {
    id: String,
    channel: String,
    session: Weak<SessionInner>,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl RpcFuture {
    /// Fresh correlation id on `tunnel`.
    pub fn new(tunnel: &AddressedTunnel, timeout: Duration) -> Result<Self, AgentError> {
        Self::with_id(tunnel, new_id(), timeout)
    }

    /// Wait for the frame whose thread id is `id`.
    pub fn with_id(
        tunnel: &AddressedTunnel,
        id: String,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let rx = tunnel.expect(&id)?;
        Ok(Self {
            id,
            channel: tunnel.address().to_string(),
            session: tunnel.session(),
            deadline: Instant::now() + timeout,
            rx: Some(rx),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Promise to embed in the request so the server knows where to reply.
    pub fn promise(&self) -> Promise {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Promise {
            id: self.id.clone(),
            channel_address: self.channel.clone(),
            expiration_stamp: (now + remaining).as_secs(),
        }
    }

    /// Move the deadline to `now + timeout`.
    pub fn reset_deadline(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }

    /// Resolve with the raw envelope. Consumes the future.
    pub async fn wait_envelope(mut self) -> Result<Envelope, AgentError> {
        let Some(rx) = self.rx.take() else {
            return Err(AgentError::ConnectionClosed);
        };
        if Instant::now() >= self.deadline {
            tracing::debug!(id = %self.id, "future expired before wait");
            return Err(AgentError::Timeout);
        }
        match tokio::time::timeout_at(self.deadline, rx).await {
            Err(_) => {
                tracing::debug!(id = %self.id, channel = %self.channel, "future timed out");
                Err(AgentError::Timeout)
            }
            Ok(Err(_)) => Err(AgentError::ConnectionClosed),
            Ok(Ok(envelope)) => Ok(envelope),
        }
    }

    /// Resolve as an RPC reply: the value, or the remote exception as `Rpc`.
    pub async fn wait(self) -> Result<Value, AgentError> {
        let envelope = self.wait_envelope().await?;
        let reply = parse_future(&envelope).ok_or_else(|| {
            AgentError::InvalidPayloadStructure(format!(
                "expected future reply, got {}",
                envelope.msg_type()
            ))
        })?;
        match reply.exception {
            Some(message) => Err(AgentError::Rpc(message)),
            None => Ok(reply.value),
        }
    }
}

impl Drop for RpcFuture {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            inner.deregister(&self.channel, &self.id);
        }
    }
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFuture")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("deadline", &self.deadline)
            .finish()
    }
}
