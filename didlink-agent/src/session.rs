//! Connection session: owns one physical link, reads the context frame, and
//! runs the single reader loop that demultiplexes tunnel frames.
//!
//! ```text
//!  link.inbound ──► reader loop ──► tunnel frame? ──► waiter for thid? ──► oneshot
//!                        │                                  └─ no ──► channel queue (or drop)
//!                        └──► anything else ──► inbox (Session::read)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use didlink_core::pack::is_packed;
use didlink_core::{decode_frame, Envelope, Frame, P2PConnection, ServerContext, TunnelFrame};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connector::Connector;
use crate::error::AgentError;
use crate::tunnel::AddressedTunnel;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PENDING: usize = 8192;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub io_timeout: Duration,
    /// Cap on outstanding correlation waiters across all tunnels.
    pub max_pending: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// What the router does with a tunnel frame nobody is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    /// Keep it, in arrival order, for `AddressedTunnel::receive`. At most
    /// `max_pending` frames are held per channel; newer ones are dropped.
    Queue,
    /// Drop it (late replies to abandoned futures).
    Drop,
}

pub(crate) type QueueReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>;

struct Route {
    waiters: HashMap<String, oneshot::Sender<Envelope>>,
    queue_tx: mpsc::Sender<Envelope>,
    queue_rx: QueueReceiver,
    unmatched: Unmatched,
}

#[derive(Default)]
struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    fn pending(&self) -> usize {
        self.routes.values().map(|r| r.waiters.len()).sum()
    }
}

/// State shared by the session, its tunnels and its futures.
pub(crate) struct SessionInner {
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    router: Mutex<Router>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    p2p: Option<P2PConnection>,
    options: SessionOptions,
}

impl SessionInner {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn p2p(&self) -> Option<&P2PConnection> {
        self.p2p.as_ref()
    }

    pub(crate) fn options(&self) -> SessionOptions {
        self.options
    }

    fn router(&self) -> MutexGuard<'_, Router> {
        self.router.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write one transport message.
    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<(), AgentError> {
        if !self.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) if tx.send(bytes).is_ok() => Ok(()),
            _ => Err(AgentError::ConnectionClosed),
        }
    }

    fn ensure_route(&self, channel: &str, unmatched: Unmatched) -> QueueReceiver {
        let mut router = self.router();
        let route = router.routes.entry(channel.to_string()).or_insert_with(|| {
            let (queue_tx, queue_rx) = mpsc::channel(self.options.max_pending.max(1));
            Route {
                waiters: HashMap::new(),
                queue_tx,
                queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
                unmatched,
            }
        });
        route.queue_rx.clone()
    }

    /// Register a waiter for the frame on `channel` whose thread id is `thid`.
    pub(crate) fn register(
        &self,
        channel: &str,
        thid: &str,
    ) -> Result<oneshot::Receiver<Envelope>, AgentError> {
        if !self.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let mut router = self.router();
        let pending = router.pending();
        if pending >= self.options.max_pending {
            tracing::warn!(pending, max_pending = self.options.max_pending, "refusing new waiter");
            return Err(AgentError::TooManyPending(self.options.max_pending));
        }
        let route = router
            .routes
            .get_mut(channel)
            .ok_or(AgentError::ConnectionClosed)?;
        let (tx, rx) = oneshot::channel();
        if route.waiters.insert(thid.to_string(), tx).is_some() {
            tracing::debug!(channel, thid, "waiter replaced");
        }
        tracing::trace!(channel, thid, pending = pending + 1, "waiter registered");
        Ok(rx)
    }

    pub(crate) fn deregister(&self, channel: &str, thid: &str) {
        if let Some(route) = self.router().routes.get_mut(channel) {
            route.waiters.remove(thid);
        }
    }

    fn route(&self, frame: TunnelFrame) {
        let TunnelFrame { channel, payload } = frame;
        let payload = if is_packed(&payload) {
            let Some(p2p) = &self.p2p else {
                tracing::warn!(channel = %channel, "packed frame without a p2p channel; dropped");
                return;
            };
            match p2p.unpack(&payload) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "undecryptable frame dropped");
                    return;
                }
            }
        } else {
            payload
        };
        let envelope = match Envelope::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "malformed frame dropped");
                return;
            }
        };

        let mut router = self.router();
        let Some(route) = router.routes.get_mut(&channel) else {
            tracing::debug!(channel = %channel, "frame for unknown channel dropped");
            return;
        };
        let thid = envelope.thread().map(|t| t.thid);
        let envelope = match thid.as_deref().and_then(|t| route.waiters.remove(t)) {
            Some(waiter) => match waiter.send(envelope) {
                Ok(()) => return,
                Err(envelope) => envelope,
            },
            None => envelope,
        };
        match route.unmatched {
            Unmatched::Queue => match route.queue_tx.try_send(envelope) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => tracing::warn!(
                    channel = %channel,
                    thid = ?thid,
                    max_pending = self.options.max_pending,
                    "unmatched queue full; frame dropped"
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            },
            Unmatched::Drop => {
                tracing::debug!(channel = %channel, thid = ?thid, "unmatched frame dropped");
            }
        }
    }

    /// Mark closed and release every waiter; blocked callers see `ConnectionClosed`.
    fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.router().routes.clear();
    }
}

async fn read_loop(
    inner: Arc<SessionInner>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(bytes) = inbound.recv().await {
        match decode_frame(&bytes) {
            Ok(Frame::Tunnel(frame)) => inner.route(frame),
            _ => {
                if inbox.send(bytes).is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("session link closed by peer");
    inner.shutdown();
}

/// One open connection to the relay at a given path.
pub struct Session {
    inner: Arc<SessionInner>,
    context: ServerContext,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect, then read exactly one frame: the context. Anything else fails the handshake.
    pub async fn open(
        connector: &dyn Connector,
        path: &str,
        p2p: Option<P2PConnection>,
        options: SessionOptions,
    ) -> Result<Self, AgentError> {
        let mut link = connector.connect(path).await?;
        let first = match tokio::time::timeout(options.io_timeout, link.inbound.recv()).await {
            Err(_) => return Err(AgentError::Timeout),
            Ok(None) => return Err(AgentError::ConnectionClosed),
            Ok(Some(bytes)) => bytes,
        };
        let context = ServerContext::from_slice(&first)?;
        tracing::debug!(path, "context received");

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            open: AtomicBool::new(true),
            outbound: Mutex::new(Some(link.outbound)),
            router: Mutex::new(Router::default()),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            p2p,
            options,
        });
        let reader = tokio::spawn(read_loop(inner.clone(), link.inbound, inbox_tx));
        Ok(Self {
            inner,
            context,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub(crate) fn p2p(&self) -> Option<&P2PConnection> {
        self.inner.p2p()
    }

    /// Tunnel for `address`, multiplexed over this session.
    pub fn tunnel(&self, address: &str, unmatched: Unmatched) -> AddressedTunnel {
        let queue = self.inner.ensure_route(address, unmatched);
        AddressedTunnel::new(self.inner.clone(), address.to_string(), queue)
    }

    /// Next non-tunnel frame, raw.
    pub async fn read(&self, timeout: Duration) -> Result<Vec<u8>, AgentError> {
        if !self.is_open() {
            return Err(AgentError::ConnectionClosed);
        }
        let mut inbox = self.inner.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Err(_) => Err(AgentError::Timeout),
            Ok(None) => Err(AgentError::ConnectionClosed),
            Ok(Some(bytes)) => Ok(bytes),
        }
    }

    /// Idempotent. In-flight calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
            tracing::debug!("session closed");
        }
        self.inner.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Link, MemoryConnector};
    use didlink_core::{encode_frame, MSG_TYPE_CONTEXT};
    use serde_json::json;

    fn context_bytes() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "@type": MSG_TYPE_CONTEXT,
            "~proxy": [
                {"id": "reverse", "data": {"json": {"address": "rpc"}}},
                {"id": "sub-protocol", "data": {"json": {"address": "co"}}}
            ],
            "~endpoints": [{"data": {"json": {"address": "https://relay.test/a"}}}]
        }))
        .unwrap()
    }

    async fn open_with(first: Vec<u8>) -> (Result<Session, AgentError>, Link) {
        let (connector, mut acceptor) = MemoryConnector::new();
        let server = tokio::spawn(async move {
            let (_, link) = acceptor.recv().await.unwrap();
            link.outbound.send(first).unwrap();
            link
        });
        let session = Session::open(&connector, "/rpc", None, SessionOptions::default()).await;
        (session, server.await.unwrap())
    }

    fn tunnel_bytes(channel: &str, payload: serde_json::Value) -> Vec<u8> {
        encode_frame(&Frame::Tunnel(TunnelFrame {
            channel: channel.into(),
            payload,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn wrong_context_type_fails_handshake() {
        let bad = serde_json::to_vec(&json!({"@type": "https://didcomm.org/x/1.0/y"})).unwrap();
        let (session, _link) = open_with(bad).await;
        assert!(matches!(session, Err(AgentError::InvalidHandshake(_))));
    }

    #[tokio::test]
    async fn frames_are_demultiplexed() {
        let (session, link) = open_with(context_bytes()).await;
        let session = session.unwrap();
        let co = session.tunnel("co", Unmatched::Queue);
        let waiter = session.inner.register("co", "t-1").unwrap();

        link.outbound
            .send(tunnel_bytes("co", json!({"@type": "https://didcomm.org/a/1.0/b", "@id": "1"})))
            .unwrap();
        link.outbound
            .send(tunnel_bytes(
                "co",
                json!({"@type": "https://didcomm.org/a/1.0/b", "@id": "2", "~thread": {"thid": "t-1"}}),
            ))
            .unwrap();
        link.outbound.send(b"{\"plain\": true}".to_vec()).unwrap();

        let matched = waiter.await.unwrap();
        assert_eq!(matched.id(), Some("2"));
        let queued = co.receive_envelope(Duration::from_secs(1)).await.unwrap();
        assert_eq!(queued.id(), Some("1"));
        let plain = session.read(Duration::from_secs(1)).await.unwrap();
        assert_eq!(plain, b"{\"plain\": true}");
    }

    #[tokio::test]
    async fn peer_close_releases_waiters() {
        let (session, link) = open_with(context_bytes()).await;
        let session = session.unwrap();
        let _co = session.tunnel("co", Unmatched::Queue);
        let waiter = session.inner.register("co", "t-1").unwrap();
        drop(link);
        assert!(waiter.await.is_err());
        assert!(!session.is_open());
        assert!(matches!(
            session.read(Duration::from_millis(10)).await,
            Err(AgentError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _link) = open_with(context_bytes()).await;
        let session = session.unwrap();
        session.close();
        session.close();
        assert!(!session.is_open());
        assert!(matches!(
            session.inner.send(b"x".to_vec()),
            Err(AgentError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn pending_cap_is_enforced() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let server = tokio::spawn(async move {
            let (_, link) = acceptor.recv().await.unwrap();
            link.outbound.send(context_bytes()).unwrap();
            link
        });
        let options = SessionOptions {
            io_timeout: Duration::from_secs(1),
            max_pending: 1,
        };
        let session = Session::open(&connector, "/rpc", None, options).await.unwrap();
        let _link = server.await.unwrap();
        let _rpc = session.tunnel("rpc", Unmatched::Drop);
        let _first = session.inner.register("rpc", "a").unwrap();
        assert!(matches!(
            session.inner.register("rpc", "b"),
            Err(AgentError::TooManyPending(1))
        ));
        session.inner.deregister("rpc", "a");
        assert!(session.inner.register("rpc", "b").is_ok());
    }

    #[tokio::test]
    async fn unmatched_queue_is_capped() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let server = tokio::spawn(async move {
            let (_, link) = acceptor.recv().await.unwrap();
            link.outbound.send(context_bytes()).unwrap();
            link
        });
        let options = SessionOptions {
            io_timeout: Duration::from_secs(1),
            max_pending: 4,
        };
        let session = Session::open(&connector, "/rpc", None, options).await.unwrap();
        let link = server.await.unwrap();
        let co = session.tunnel("co", Unmatched::Queue);

        for i in 0..10 {
            link.outbound
                .send(tunnel_bytes(
                    "co",
                    json!({"@type": "https://didcomm.org/a/1.0/b", "@id": i.to_string()}),
                ))
                .unwrap();
        }
        // The reader handles frames in order, so all ten are routed once this arrives.
        link.outbound.send(b"{\"plain\": true}".to_vec()).unwrap();
        session.read(Duration::from_secs(1)).await.unwrap();

        for i in 0..4 {
            let queued = co.receive_envelope(Duration::from_millis(100)).await.unwrap();
            assert_eq!(queued.id(), Some(i.to_string().as_str()));
        }
        assert!(matches!(
            co.receive_envelope(Duration::from_millis(50)).await,
            Err(AgentError::Timeout)
        ));
    }
}
