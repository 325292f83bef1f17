//! Delivery acknowledgement (`notification/1.0/ack`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{new_id, Envelope, MessageError, Thread, THREAD_DECORATOR};
use crate::message::ProtocolMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Outcome occurred and was positive.
    Ok,
    /// No outcome known yet.
    Pending,
    /// Outcome occurred and was negative.
    Fail,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Pending => "PENDING",
            Status::Fail => "FAIL",
        }
    }

    fn parse(value: &str) -> Result<Self, MessageError> {
        match value {
            "OK" => Ok(Status::Ok),
            "PENDING" => Ok(Status::Pending),
            "FAIL" => Ok(Status::Fail),
            other => Err(MessageError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default = "new_id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub status: Status,
    #[serde(rename = "~please_ack", default, skip_serializing_if = "Option::is_none")]
    pub please_ack: Option<Value>,
}

impl Ack {
    pub fn new(thread_id: impl Into<String>, status: Status) -> Self {
        Self {
            msg_type: Self::default_type(),
            id: new_id(),
            thread: Thread::new(thread_id),
            status,
            please_ack: None,
        }
    }

    /// Decode an ack. The thread id is checked before the status is read, and
    /// unknown statuses are rejected rather than defaulted.
    pub fn parse(envelope: &Envelope) -> Result<Self, MessageError> {
        Self::check_type(envelope)?;
        let thid = envelope
            .get(THREAD_DECORATOR)
            .and_then(|t| t.get("thid"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(MessageError::MissingThread)?;
        let raw_status = envelope
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::InvalidStatus("<missing>".into()))?;
        let status = Status::parse(raw_status)?;
        let mut thread = envelope.thread().unwrap_or_else(|| Thread::new(thid));
        thread.thid = thid.to_string();
        Ok(Self {
            msg_type: envelope.msg_type().to_string(),
            id: envelope.id().map(str::to_string).unwrap_or_else(new_id),
            thread,
            status,
            please_ack: envelope.get("~please_ack").cloned(),
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl ProtocolMessage for Ack {
    const PROTOCOL: &'static str = "notification";
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "ack";

    fn id(&self) -> &str {
        &self.id
    }

    fn thread(&self) -> Option<&Thread> {
        Some(&self.thread)
    }
}
