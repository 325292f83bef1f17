//! Message envelope: a JSON object carrying `@type`, `@id` and an optional `~thread`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Document URI prefix used for every protocol this crate speaks.
pub const DOC_URI: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

/// Decorator carrying thread linkage.
pub const THREAD_DECORATOR: &str = "~thread";

/// Fresh message id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parsed `@type`: `<doc_uri><protocol>/<version>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub doc_uri: String,
    pub protocol: String,
    pub version: String,
    pub name: String,
}

impl MessageType {
    pub fn new(protocol: &str, version: &str, name: &str) -> Self {
        Self {
            doc_uri: DOC_URI.to_string(),
            protocol: protocol.to_string(),
            version: version.to_string(),
            name: name.to_string(),
        }
    }

    /// Same protocol and message name; version is not compared.
    pub fn matches(&self, protocol: &str, name: &str) -> bool {
        self.protocol == protocol && self.name == name
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}",
            self.doc_uri, self.protocol, self.version, self.name
        )
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    /// Accepts both `did:sov:...;spec/proto/1.0/name` and `https://host/proto/1.0/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (doc_uri, tail) = match s.find(";spec/") {
            Some(pos) => s.split_at(pos + ";spec/".len()),
            None => {
                let mut cut = s.len();
                for _ in 0..3 {
                    cut = s[..cut]
                        .rfind('/')
                        .ok_or_else(|| MessageError::InvalidType(s.to_string()))?;
                }
                s.split_at(cut + 1)
            }
        };
        let parts: Vec<&str> = tail.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(MessageError::InvalidType(s.to_string()));
        }
        Ok(Self {
            doc_uri: doc_uri.to_string(),
            protocol: parts[0].to_string(),
            version: parts[1].to_string(),
            name: parts[2].to_string(),
        })
    }
}

/// Thread linkage. `thid` names the exchange; `pthid` the parent exchange, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

impl Thread {
    pub fn new(thid: impl Into<String>) -> Self {
        Self {
            thid: thid.into(),
            pthid: None,
        }
    }
}

/// Untyped message: any JSON object with a parseable `@type`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    msg_type: MessageType,
    fields: Map<String, Value>,
}

impl Envelope {
    /// New message of the given type with a fresh `@id`.
    pub fn new(msg_type: &str) -> Result<Self, MessageError> {
        let parsed: MessageType = msg_type.parse()?;
        let mut fields = Map::new();
        fields.insert("@type".into(), Value::String(msg_type.to_string()));
        fields.insert("@id".into(), Value::String(new_id()));
        Ok(Self {
            msg_type: parsed,
            fields,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(fields) = value else {
            return Err(MessageError::NotAnObject);
        };
        let msg_type = fields
            .get("@type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?
            .parse()?;
        Ok(Self { msg_type, fields })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn msg_type(&self) -> &MessageType {
        &self.msg_type
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get("@id").and_then(Value::as_str)
    }

    pub fn thread(&self) -> Option<Thread> {
        self.fields
            .get(THREAD_DECORATOR)
            .and_then(|t| serde_json::from_value(t.clone()).ok())
    }

    /// `~thread.thid` if present, else the message's own id.
    pub fn thread_id(&self) -> Option<String> {
        self.thread()
            .map(|t| t.thid)
            .or_else(|| self.id().map(str::to_string))
    }

    pub fn set_thread(&mut self, thread: Thread) -> Result<(), MessageError> {
        self.fields
            .insert(THREAD_DECORATOR.into(), serde_json::to_value(thread)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a field. `@type` and `@id` are fixed at creation.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), MessageError> {
        if key == "@type" || key == "@id" {
            return Err(MessageError::Immutable(key.to_string()));
        }
        self.fields.insert(key.to_string(), value);
        Ok(())
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(&self.fields)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message @type is empty")]
    MissingType,
    #[error("invalid message type: {0}")]
    InvalidType(String),
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType { expected: String, got: String },
    #[error("field {0} cannot be changed")]
    Immutable(String),
    #[error("message has no thread id")]
    MissingThread,
    #[error("unexpected status value: {0}")]
    InvalidStatus(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
