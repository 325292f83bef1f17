//! Errors surfaced by the agent runtime.

use didlink_core::{ContextError, HandshakeError, MessageError, PackError, WalletError};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Operation on a session that is not open. Reopen first.
    #[error("connection closed")]
    ConnectionClosed,
    /// No correlated response before the deadline.
    #[error("timed out")]
    Timeout,
    #[error("invalid payload structure: {0}")]
    InvalidPayloadStructure(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PackError),
    /// The remote side reported failure.
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("invalid handshake: {0}")]
    InvalidHandshake(#[from] ContextError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("too many pending requests (limit {0})")]
    TooManyPending(usize),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
}

impl From<HandshakeError> for AgentError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Wallet(e) => AgentError::Wallet(e),
            other => AgentError::ProtocolViolation(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server address: {0}")]
    InvalidAddress(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("no listener at {0}")]
    Refused(String),
}
