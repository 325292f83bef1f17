//! DIDComm connection protocol core.
//! Host-driven: no I/O; the runtime passes frames and messages in and performs the returned actions.

pub mod ack;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod handshake;
pub mod identity;
pub mod invitation;
pub mod message;
pub mod pack;
pub mod pairwise;
pub mod wallet;
pub mod wire;

pub use ack::{Ack, Status};
pub use connection::{ConnRequest, ConnResponse, Connection, DidDoc, ProblemReport};
pub use context::{ContextError, Endpoint, ServerContext, MSG_TYPE_CONTEXT};
pub use envelope::{Envelope, MessageError, MessageType, Thread};
pub use handshake::{
    Delivery, HandshakeError, InviteeMachine, InviterMachine, OutboundAction, State,
};
pub use identity::{KeyError, Keypair, Verkey};
pub use invitation::Invitation;
pub use message::{Message, ProtocolMessage};
pub use pack::{P2PConnection, PackError};
pub use pairwise::{Me, Pairwise, Their};
pub use wallet::{InMemoryWallet, PairwiseRecord, Wallet, WalletError};
pub use wire::{decode_frame, encode_frame, Frame, FrameError, Promise, TunnelFrame};
