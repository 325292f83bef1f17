//! Event service: inbound messages pushed by the relay over the `/events` session.

use std::sync::Arc;
use std::time::Duration;

use didlink_core::pack::is_packed;
use didlink_core::pairwise::find_by_their_verkey;
use didlink_core::{Envelope, Message, P2PConnection, PackError, Pairwise, Verkey, Wallet};
use serde_json::Value;

use crate::connector::Connector;
use crate::error::AgentError;
use crate::session::{Session, SessionOptions};

pub const EVENTS_PATH: &str = "/events";

pub struct AgentEvents {
    session: Session,
    balancing_group: Option<String>,
}

impl AgentEvents {
    pub async fn create(
        connector: &dyn Connector,
        p2p: Option<P2PConnection>,
        options: SessionOptions,
    ) -> Result<Self, AgentError> {
        let session = Session::open(connector, EVENTS_PATH, p2p, options).await?;
        let balancing_group = session.context().balancing_group();
        tracing::info!(balancing_group = ?balancing_group, "events session ready");
        Ok(Self {
            session,
            balancing_group,
        })
    }

    /// Consumer group the relay assigned to this agent's event stream.
    pub fn balancing_group(&self) -> Option<&str> {
        self.balancing_group.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub async fn pull(&self) -> Result<Message, AgentError> {
        self.pull_timeout(self.session.options().io_timeout).await
    }

    pub async fn pull_timeout(&self, timeout: Duration) -> Result<Message, AgentError> {
        let envelope = self.pull_envelope(timeout).await?;
        Ok(Message::decode(envelope)?)
    }

    /// Next event frame as a raw envelope, unpacked when it arrives sealed.
    pub async fn pull_envelope(&self, timeout: Duration) -> Result<Envelope, AgentError> {
        let bytes = self.session.read(timeout).await?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::InvalidPayloadStructure(e.to_string()))?;
        let payload = if is_packed(&payload) {
            match self.session.p2p() {
                Some(p2p) => p2p.unpack(&payload)?,
                None => return Err(PackError::NotARecipient.into()),
            }
        } else {
            payload
        };
        Envelope::from_value(payload).map_err(|e| AgentError::InvalidPayloadStructure(e.to_string()))
    }

    pub fn close(&self) {
        self.session.close();
    }
}

/// Inbound message with the keys it travelled under and, when known, the
/// relationship it belongs to.
#[derive(Debug, Clone)]
pub struct Event {
    pub message: Message,
    pub recipient_verkey: Option<Verkey>,
    pub sender_verkey: Option<Verkey>,
    pub pairwise: Option<Pairwise>,
}

impl Event {
    /// Unwrap a relay event (`{message, recipient_verkey, sender_verkey}`);
    /// any other envelope is taken as the message itself.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, AgentError> {
        let Some(inner) = envelope.get("message").cloned() else {
            return Ok(Self {
                message: Message::decode(envelope)?,
                recipient_verkey: None,
                sender_verkey: None,
                pairwise: None,
            });
        };
        Ok(Self {
            message: Message::from_value(inner)?,
            recipient_verkey: verkey_field(&envelope, "recipient_verkey"),
            sender_verkey: verkey_field(&envelope, "sender_verkey"),
            pairwise: None,
        })
    }
}

fn verkey_field(envelope: &Envelope, key: &str) -> Option<Verkey> {
    envelope.get(key)?.as_str()?.parse().ok()
}

/// Event stream bound to a wallet. Any number of listeners may share one
/// events session; each `get` takes the next event.
#[derive(Clone)]
pub struct Listener {
    events: Arc<AgentEvents>,
    wallet: Arc<dyn Wallet>,
}

impl Listener {
    pub(crate) fn new(events: Arc<AgentEvents>, wallet: Arc<dyn Wallet>) -> Self {
        Self { events, wallet }
    }

    pub async fn get(&self, timeout: Duration) -> Result<Event, AgentError> {
        let envelope = self.events.pull_envelope(timeout).await?;
        let mut event = Event::from_envelope(envelope)?;
        if let Some(sender) = &event.sender_verkey {
            event.pairwise = find_by_their_verkey(&*self.wallet, sender).await?;
        }
        tracing::debug!(
            kind = event.message.kind(),
            known_sender = event.pairwise.is_some(),
            "event received"
        );
        Ok(event)
    }
}
