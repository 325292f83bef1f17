//! Framing over a message-oriented connection, plus the RPC request/future shapes.
//!
//! Every frame is one JSON object. Tunnel frames carry `~tunnel` (the channel
//! address) and `payload`; anything else is a plain frame.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{Envelope, MessageError, Thread};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

pub const MSG_TYPE_FUTURE: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/sirius_rpc/1.0/future";
pub const MSG_TYPE_SEND_MESSAGE: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/sirius_rpc/1.0/send_message";

const TUNNEL_KEY: &str = "~tunnel";
const PROMISE_KEY: &str = "@promise";

/// Frame addressed to one logical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelFrame {
    #[serde(rename = "~tunnel")]
    pub channel: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Tunnel(TunnelFrame),
    Plain(Value),
}

/// Encode a frame into one transport message.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let bytes = match frame {
        Frame::Tunnel(t) => serde_json::to_vec(t)?,
        Frame::Plain(v) => serde_json::to_vec(v)?,
    };
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    Ok(bytes)
}

/// Decode one transport message.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    let value: Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject);
    }
    if value.get(TUNNEL_KEY).is_some() {
        return Ok(Frame::Tunnel(serde_json::from_value(value)?));
    }
    Ok(Frame::Plain(value))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large")]
    TooLarge,
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Correlation handle embedded in a request: where and until when the reply is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub id: String,
    pub channel_address: String,
    /// Unix seconds.
    pub expiration_stamp: u64,
}

/// Build an RPC request envelope: `{@type, @id, @promise, params}`.
pub fn build_request(
    msg_type: &str,
    promise: &Promise,
    params: Value,
) -> Result<Envelope, MessageError> {
    let mut request = Envelope::new(msg_type)?;
    request.insert(PROMISE_KEY, serde_json::to_value(promise)?)?;
    request.insert("params", params)?;
    Ok(request)
}

/// Promise carried by a request, if any.
pub fn request_promise(request: &Envelope) -> Option<Promise> {
    request
        .get(PROMISE_KEY)
        .and_then(|p| serde_json::from_value(p.clone()).ok())
}

/// Reply resolving a promise: either a value or a remote exception.
#[derive(Debug, Clone, PartialEq)]
pub struct FutureResponse {
    pub thid: String,
    pub value: Value,
    pub exception: Option<String>,
}

/// Parse a `future` reply. `None` if the envelope is some other message.
pub fn parse_future(envelope: &Envelope) -> Option<FutureResponse> {
    if envelope.msg_type().to_string() != MSG_TYPE_FUTURE {
        return None;
    }
    let thid = envelope.thread()?.thid;
    let exception = match envelope.get("exception") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(
            other
                .get("printable")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    };
    Some(FutureResponse {
        thid,
        value: envelope.get("value").cloned().unwrap_or(Value::Null),
        exception,
    })
}

/// Build a `future` reply for promise `thid`.
pub fn build_future(thid: &str, result: Result<Value, String>) -> Result<Envelope, MessageError> {
    let mut reply = Envelope::new(MSG_TYPE_FUTURE)?;
    reply.set_thread(Thread::new(thid))?;
    match result {
        Ok(value) => {
            reply.insert("value", value)?;
            reply.insert("exception", Value::Null)?;
        }
        Err(printable) => {
            reply.insert("value", Value::Null)?;
            reply.insert("exception", json!({ "printable": printable }))?;
        }
    }
    Ok(reply)
}
