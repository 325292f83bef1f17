//! Physical connection to the relay: one full-duplex message stream per path.
//!
//! A connector yields a [`Link`]: an outbound sender and an inbound receiver of
//! whole transport messages. Writer and reader tasks own the socket; dropping
//! the outbound sender closes it.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::TransportError;

const CREDENTIALS_HEADER: &str = "credentials";

/// Duplex stream of transport messages.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Link {
    /// Two links wired back to back.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to the service at `path` (e.g. `/rpc`).
    async fn connect(&self, path: &str) -> Result<Link, TransportError>;
}

/// WebSocket connector. The opaque credentials go in a request header.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    server_address: String,
    credentials: Option<String>,
}

impl WebSocketConnector {
    pub fn new(server_address: impl Into<String>, credentials: Option<String>) -> Self {
        Self {
            server_address: server_address.into(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        let base = self.server_address.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}{path}")
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, path: &str) -> Result<Link, TransportError> {
        let url = self.url(path);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
        if let Some(credentials) = &self.credentials {
            let value = HeaderValue::from_str(credentials)
                .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
            request.headers_mut().insert(CREDENTIALS_HEADER, value);
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %url, "websocket connected");
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                let text = match String::from_utf8(bytes) {
                    Ok(text) => WsMessage::text(text),
                    Err(e) => WsMessage::binary(e.into_bytes()),
                };
                if sink.send(text).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let bytes = match msg {
                    Ok(WsMessage::Text(t)) => t.as_bytes().to_vec(),
                    Ok(WsMessage::Binary(b)) => b.to_vec(),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if in_tx.send(bytes).is_err() {
                    break;
                }
            }
            tracing::debug!(url = %url, "websocket closed");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// In-process connector: each `connect` hands the server side of a fresh
/// [`Link::pair`] to whoever holds the acceptor.
#[derive(Clone)]
pub struct MemoryConnector {
    acceptor: mpsc::UnboundedSender<(String, Link)>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Link)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { acceptor: tx }, rx)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, path: &str) -> Result<Link, TransportError> {
        let (client, server) = Link::pair();
        self.acceptor
            .send((path.to_string(), server))
            .map_err(|_| TransportError::Refused(path.to_string()))?;
        Ok(client)
    }
}
