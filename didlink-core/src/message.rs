//! Typed protocol messages. Known types decode into a closed enum; anything else is kept raw.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ack::Ack;
use crate::connection::{ConnRequest, ConnResponse, ProblemReport};
use crate::envelope::{Envelope, MessageError, MessageType, Thread, DOC_URI};
use crate::invitation::Invitation;

/// Accessors shared by every typed protocol message.
pub trait ProtocolMessage: Serialize + DeserializeOwned + Sized {
    const PROTOCOL: &'static str;
    const VERSION: &'static str;
    const NAME: &'static str;

    fn id(&self) -> &str;

    fn thread(&self) -> Option<&Thread>;

    /// `~thread.thid` if set, else the message's own id.
    fn thread_id(&self) -> String {
        self.thread()
            .map(|t| t.thid.clone())
            .unwrap_or_else(|| self.id().to_string())
    }

    fn default_type() -> String {
        format!("{DOC_URI}{}/{}/{}", Self::PROTOCOL, Self::VERSION, Self::NAME)
    }

    fn message_type() -> MessageType {
        MessageType::new(Self::PROTOCOL, Self::VERSION, Self::NAME)
    }

    fn check_type(envelope: &Envelope) -> Result<(), MessageError> {
        if envelope.msg_type().matches(Self::PROTOCOL, Self::NAME) {
            Ok(())
        } else {
            Err(MessageError::UnexpectedType {
                expected: Self::default_type(),
                got: envelope.msg_type().to_string(),
            })
        }
    }

    /// Deserialize from an envelope of the matching type.
    fn from_envelope(envelope: &Envelope) -> Result<Self, MessageError> {
        Self::check_type(envelope)?;
        Ok(serde_json::from_value(envelope.as_value())?)
    }

    fn to_envelope(&self) -> Result<Envelope, MessageError> {
        Envelope::from_value(serde_json::to_value(self)?)
    }
}

/// Every message this agent understands, plus a raw fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invitation(Invitation),
    ConnRequest(ConnRequest),
    ConnResponse(ConnResponse),
    ProblemReport(ProblemReport),
    Ack(Ack),
    Unknown(Envelope),
}

impl Message {
    /// Select the variant by `@type`. A known type with a malformed body is an error.
    pub fn decode(envelope: Envelope) -> Result<Self, MessageError> {
        let t = envelope.msg_type();
        let message = match (t.protocol.as_str(), t.name.as_str()) {
            (Invitation::PROTOCOL, Invitation::NAME) => {
                Message::Invitation(Invitation::from_envelope(&envelope)?)
            }
            (ConnRequest::PROTOCOL, ConnRequest::NAME) => {
                Message::ConnRequest(ConnRequest::from_envelope(&envelope)?)
            }
            (ConnResponse::PROTOCOL, ConnResponse::NAME) => {
                Message::ConnResponse(ConnResponse::from_envelope(&envelope)?)
            }
            (ProblemReport::PROTOCOL, ProblemReport::NAME) => {
                Message::ProblemReport(ProblemReport::from_envelope(&envelope)?)
            }
            (Ack::PROTOCOL, Ack::NAME) => Message::Ack(Ack::parse(&envelope)?),
            _ => Message::Unknown(envelope),
        };
        Ok(message)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, MessageError> {
        Self::decode(Envelope::from_value(value)?)
    }

    pub fn encode(&self) -> Result<Envelope, MessageError> {
        match self {
            Message::Invitation(m) => m.to_envelope(),
            Message::ConnRequest(m) => m.to_envelope(),
            Message::ConnResponse(m) => m.to_envelope(),
            Message::ProblemReport(m) => m.to_envelope(),
            Message::Ack(m) => m.to_envelope(),
            Message::Unknown(env) => Ok(env.clone()),
        }
    }

    pub fn id(&self) -> Option<String> {
        match self {
            Message::Invitation(m) => Some(m.id().to_string()),
            Message::ConnRequest(m) => Some(m.id().to_string()),
            Message::ConnResponse(m) => Some(m.id().to_string()),
            Message::ProblemReport(m) => Some(m.id().to_string()),
            Message::Ack(m) => Some(m.id().to_string()),
            Message::Unknown(env) => env.id().map(str::to_string),
        }
    }

    pub fn thread_id(&self) -> Option<String> {
        match self {
            Message::Invitation(m) => Some(m.thread_id()),
            Message::ConnRequest(m) => Some(m.thread_id()),
            Message::ConnResponse(m) => Some(m.thread_id()),
            Message::ProblemReport(m) => Some(m.thread_id()),
            Message::Ack(m) => Some(m.thread_id()),
            Message::Unknown(env) => env.thread_id(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Invitation(_) => "invitation",
            Message::ConnRequest(_) => "request",
            Message::ConnResponse(_) => "response",
            Message::ProblemReport(_) => "problem_report",
            Message::Ack(_) => "ack",
            Message::Unknown(_) => "unknown",
        }
    }
}

impl From<Ack> for Message {
    fn from(m: Ack) -> Self {
        Message::Ack(m)
    }
}

impl From<ConnRequest> for Message {
    fn from(m: ConnRequest) -> Self {
        Message::ConnRequest(m)
    }
}

impl From<ConnResponse> for Message {
    fn from(m: ConnResponse) -> Self {
        Message::ConnResponse(m)
    }
}

impl From<ProblemReport> for Message {
    fn from(m: ProblemReport) -> Self {
        Message::ProblemReport(m)
    }
}
