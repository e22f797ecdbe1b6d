//! The SDK channel acceptor and its per-client sessions.
//!
//! A channel session carries framed [`ChannelMessage`]s over
//! server-authenticated TLS. The header's length field is the framing, so
//! the read loop accumulates bytes and decodes incrementally. Outbound
//! messages go through a FIFO queue drained by a writer task; tests build
//! detached sessions and inspect the queue's receiving end directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use mesh_core::config::ChannelConfig;
use mesh_core::wire::ChannelMessage;
use mesh_core::{Endpoint, NetError};

use crate::router::ChannelRouter;

/// Depth of the per-session outbound queue.
const OUTBOUND_QUEUE: usize = 256;

// ── Channel session ───────────────────────────────────────────────────────────

/// One connected SDK client.
pub struct ChannelSession {
    id: u64,
    remote: Endpoint,
    topics: RwLock<HashSet<String>>,
    active: AtomicBool,
    outbound: mpsc::Sender<ChannelMessage>,
}

impl ChannelSession {
    /// Create a session plus the receiver its writer task drains.
    pub fn new(id: u64, remote: Endpoint) -> (Arc<Self>, mpsc::Receiver<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Arc::new(Self {
                id,
                remote,
                topics: RwLock::new(HashSet::new()),
                active: AtomicBool::new(true),
                outbound: tx,
            }),
            rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Replace the session's topic set (0x32 semantics).
    pub fn set_topics(&self, topics: HashSet<String>) {
        *self.topics.write() = topics;
    }

    pub fn topics(&self) -> HashSet<String> {
        self.topics.read().clone()
    }

    pub fn subscribes(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    /// Queue a message for the client. FIFO with respect to the caller.
    pub async fn send(&self, message: ChannelMessage) -> Result<(), NetError> {
        if !self.is_active() {
            return Err(NetError::Cancelled);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| NetError::Cancelled)
    }
}

// ── Channel server ────────────────────────────────────────────────────────────

/// The second TLS acceptor: SDK clients, not peers.
pub struct ChannelServer {
    cfg: ChannelConfig,
    tls: Arc<ServerConfig>,
    router: Arc<ChannelRouter>,
    running: AtomicBool,
    listen_port: AtomicU16,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_session_id: AtomicU64,
}

impl ChannelServer {
    pub fn new(cfg: ChannelConfig, tls: Arc<ServerConfig>, router: Arc<ChannelRouter>) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            listen_port: AtomicU16::new(cfg.listen_port),
            cfg,
            tls,
            router,
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            next_session_id: AtomicU64::new(0),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the acceptor and start serving SDK clients. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr: std::net::IpAddr = self
            .cfg
            .listen_ip
            .parse()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        let listener = TcpListener::bind((addr, self.cfg.listen_port))
            .await
            .map_err(NetError::Transport)?;
        let port = listener.local_addr().map_err(NetError::Transport)?.port();
        self.listen_port.store(port, Ordering::Relaxed);

        tracing::info!(%addr, port, "channel server listening");

        let accept = {
            let server = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { server.accept_loop(listener, shutdown).await })
        };
        let expiry = {
            let router = self.router.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { router.expiry_task(shutdown).await })
        };
        self.tasks.lock().extend([accept, expiry]);
        Ok(())
    }

    /// Stop accepting and drop every client session. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("channel server stopping");
        let _ = self.shutdown.send(());
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.router.close_all_sessions().await;
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let acceptor = TlsAcceptor::from(self.tls.clone());
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                r = listener.accept() => r,
            };
            let (tcp, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "channel accept failed");
                    continue;
                }
            };
            if !self.is_running() {
                break;
            }

            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "channel tls accept failed");
                        return;
                    }
                };
                server.serve_client(stream, remote).await;
            });
        }
        tracing::debug!("channel acceptor stopped");
    }

    async fn serve_client(
        self: Arc<Self>,
        stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
        remote: std::net::SocketAddr,
    ) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (session, mut rx) = ChannelSession::new(session_id, Endpoint::from(remote));
        self.router.register_session(session.clone());

        tracing::info!(session = session_id, %remote, "sdk client connected");

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // Writer: encode and flush queued messages in order. It holds
        // only a weak session reference so the queue closes (and the task
        // ends) once the session is dropped everywhere else.
        let writer_session = Arc::downgrade(&session);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let frame = match message.encode() {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(session = session_id, error = %e, "unencodable message dropped");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&frame).await {
                    tracing::debug!(session = session_id, error = %e, "channel write failed");
                    if let Some(s) = writer_session.upgrade() {
                        s.deactivate();
                    }
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader: accumulate and decode frames, hand them to the router.
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match ChannelMessage::decode(&mut buf) {
                Ok(Some(message)) => {
                    self.router.on_client_message(&session, message).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session = session_id, %remote, error = %e, "bad channel frame");
                    break;
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    tracing::debug!(session = session_id, %remote, "sdk client closed");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(session = session_id, %remote, error = %e, "channel read failed");
                    break;
                }
            }
        }

        self.router.on_disconnect(session_id).await;
        tracing::info!(session = session_id, %remote, "sdk client removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_core::wire::msg_type;

    fn seq32(c: char) -> String {
        std::iter::repeat(c).take(32).collect()
    }

    #[tokio::test]
    async fn detached_session_queues_messages_in_order() {
        let (session, mut rx) = ChannelSession::new(7, Endpoint::default());
        assert!(session.is_active());

        let a = ChannelMessage::new(msg_type::HEARTBEAT, seq32('a'), 0, Bytes::from_static(b"0"));
        let b = ChannelMessage::new(msg_type::HEARTBEAT, seq32('b'), 0, Bytes::from_static(b"0"));
        session.send(a.clone()).await.unwrap();
        session.send(b.clone()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), a);
        assert_eq!(rx.recv().await.unwrap(), b);
    }

    #[tokio::test]
    async fn deactivated_session_refuses_sends() {
        let (session, _rx) = ChannelSession::new(7, Endpoint::default());
        session.deactivate();
        let msg = ChannelMessage::new(msg_type::HEARTBEAT, seq32('a'), 0, Bytes::new());
        assert!(matches!(session.send(msg).await, Err(NetError::Cancelled)));
    }

    #[test]
    fn topic_set_is_replaced_not_merged() {
        let (session, _rx) = ChannelSession::new(1, Endpoint::default());
        session.set_topics(["a".to_string(), "b".to_string()].into());
        assert!(session.subscribes("a"));

        session.set_topics(["c".to_string()].into());
        assert!(!session.subscribes("a"));
        assert!(session.subscribes("c"));
    }
}
