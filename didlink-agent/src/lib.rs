//! Agent runtime over a relay: one session per service path, addressed tunnels
//! multiplexed over it, correlation futures, and the connection handshake roles.

pub mod agent;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod future;
pub mod handshake;
pub mod rpc;
pub mod session;
pub mod tunnel;
pub mod wallet;

#[cfg(test)]
mod testkit;

pub use agent::Agent;
pub use config::Config;
pub use connector::{Connector, Link, MemoryConnector, WebSocketConnector};
pub use error::{AgentError, TransportError};
pub use events::{AgentEvents, Event, Listener};
pub use future::RpcFuture;
pub use handshake::{Invitee, Inviter, Outcome};
pub use rpc::AgentRpc;
pub use session::{Session, SessionOptions, Unmatched};
pub use tunnel::AddressedTunnel;
pub use wallet::RpcWallet;
