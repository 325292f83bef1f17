//! Addressed tunnel: one logical channel over a shared session.

use std::sync::{Arc, Weak};
use std::time::Duration;

use didlink_core::{encode_frame, Envelope, Frame, Message, TunnelFrame};
use tokio::sync::oneshot;

use crate::error::AgentError;
use crate::session::{QueueReceiver, SessionInner};

/// Frames on one tunnel arrive in send order; there is no ordering across tunnels.
#[derive(Clone)]
pub struct AddressedTunnel {
    inner: Arc<SessionInner>,
    address: String,
    queue: QueueReceiver,
}

impl AddressedTunnel {
    pub(crate) fn new(inner: Arc<SessionInner>, address: String, queue: QueueReceiver) -> Self {
        Self {
            inner,
            address,
            queue,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Write `envelope` to this tunnel, packed for the server when a p2p channel is configured.
    pub fn post(&self, envelope: &Envelope) -> Result<(), AgentError> {
        if !self.inner.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let payload = match self.inner.p2p() {
            Some(p2p) => p2p.pack(&envelope.as_value())?,
            None => envelope.as_value(),
        };
        let bytes = encode_frame(&Frame::Tunnel(TunnelFrame {
            channel: self.address.clone(),
            payload,
        }))
        .map_err(|e| AgentError::InvalidPayloadStructure(e.to_string()))?;
        self.inner.send(bytes)
    }

    /// Next queued frame nobody was waiting for.
    pub async fn receive_envelope(&self, timeout: Duration) -> Result<Envelope, AgentError> {
        if !self.inner.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let mut queue = self.queue.lock().await;
        match tokio::time::timeout(timeout, queue.recv()).await {
            Err(_) => Err(AgentError::Timeout),
            Ok(None) => Err(AgentError::ConnectionClosed),
            Ok(Some(envelope)) => Ok(envelope),
        }
    }

    /// Like [`receive_envelope`](Self::receive_envelope), decoded.
    pub async fn receive(&self, timeout: Duration) -> Result<Message, AgentError> {
        let envelope = self.receive_envelope(timeout).await?;
        Ok(Message::decode(envelope)?)
    }

    pub(crate) fn expect(&self, thid: &str) -> Result<oneshot::Receiver<Envelope>, AgentError> {
        self.inner.register(&self.address, thid)
    }

    pub(crate) fn session(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for AddressedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressedTunnel")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .finish()
    }
}
