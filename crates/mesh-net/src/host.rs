//! The peer host — owner of the acceptor, the peer and session maps, and
//! the keep-alive / reconnect / announcement control loop.
//!
//! Locking: the peer map (by endpoint name) and session map (by node id)
//! live behind one reader/writer lock, taken for map mutation and
//! snapshot reads only — it is always released before user callbacks run.
//! The pending-connection name set has its own lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use alloy_primitives::{keccak256, B256};
use alloy_rlp::Encodable;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use mesh_core::config::NetworkConfig;
use mesh_core::interfaces::{ChannelMessageSink, NodeConnManager, PeerMesh};
use mesh_core::wire::{
    AnnouncedNode, Announcement, BasePacket, CapabilityDesc, DisconnectReason, HelloMessage,
    FRAMING_MIN_VERSION, MAX_ANNOUNCEMENT_NODES, PROTOCOL_VERSION,
};
use mesh_core::{Endpoint, NetError, NodeId};

use crate::capability::{assign_slots, CapabilityRegistry};
use crate::framed::FramedSocket;
use crate::handshake::exchange_hello;
use crate::session::{Peer, PeerSession, PeerStream, SessionInfo, SharedPeer};
use crate::tls::PeerTlsContext;

// ── Timing ────────────────────────────────────────────────────────────────────

/// Period of the host's driving timer.
pub const LOOP_INTERVAL: Duration = Duration::from_millis(100);
/// Ping cadence.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// A connected peer silent past the last ping tick for this long is dead.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the authorized-list reconnect sweep.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the peer-set announcement broadcast.
pub const ANNOUNCEMENT_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the topic-set republish to peers.
pub const TOPIC_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Ingress admission allows this multiple of the ideal peer count.
pub const INGRESS_STRETCH: u32 = 4;

// ── Host ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct HostMaps {
    /// Known peers by canonical endpoint name. One peer per name.
    peers: BTreeMap<String, SharedPeer>,
    /// Active sessions by node id. One session per id.
    sessions: HashMap<NodeId, Arc<PeerSession>>,
}

struct Ticks {
    last_ping: Instant,
    last_reconnect: Instant,
    last_announce: Instant,
    last_topic_refresh: Instant,
}

pub struct PeerHost {
    cfg: NetworkConfig,
    id: NodeId,
    banner: String,
    conn_manager: Arc<dyn NodeConnManager>,
    registry: CapabilityRegistry,
    tls: PeerTlsContext,

    channel_sink: RwLock<Option<Arc<dyn ChannelMessageSink>>>,

    maps: RwLock<HostMaps>,
    pending: Mutex<HashSet<String>>,
    required: Mutex<HashSet<NodeId>>,

    running: AtomicBool,
    shutdown: broadcast::Sender<()>,
    listen_port: AtomicU16,
    public_endpoint: RwLock<Endpoint>,
    /// Remote endpoint of the most recently accepted connection.
    client_endpoint: RwLock<Option<std::net::SocketAddr>>,

    topics: RwLock<HashSet<String>>,
    topic_seq: AtomicU64,

    ticks: Mutex<Ticks>,
    reconnect_now: AtomicBool,

    /// Acceptor and event-loop handles.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// In-flight connect/handshake attempts, reaped each tick.
    connecting: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerHost {
    pub fn new(
        cfg: NetworkConfig,
        id: NodeId,
        conn_manager: Arc<dyn NodeConnManager>,
        tls: PeerTlsContext,
        registry: CapabilityRegistry,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let listen_port = cfg.listen_port;
        let now = Instant::now();
        // First ticks fire immediately after start.
        let long_ago = now
            .checked_sub(RECONNECT_INTERVAL + ANNOUNCEMENT_INTERVAL + KEEP_ALIVE_INTERVAL)
            .unwrap_or(now);
        Arc::new(Self {
            banner: format!("meshd/v{}", env!("CARGO_PKG_VERSION")),
            cfg,
            id,
            conn_manager,
            registry,
            tls,
            channel_sink: RwLock::new(None),
            maps: RwLock::new(HostMaps::default()),
            pending: Mutex::new(HashSet::new()),
            required: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            shutdown,
            listen_port: AtomicU16::new(listen_port),
            public_endpoint: RwLock::new(Endpoint::default()),
            client_endpoint: RwLock::new(None),
            topics: RwLock::new(HashSet::new()),
            topic_seq: AtomicU64::new(0),
            ticks: Mutex::new(Ticks {
                last_ping: long_ago,
                last_reconnect: long_ago,
                last_announce: long_ago,
                last_topic_refresh: now,
            }),
            reconnect_now: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            connecting: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wire the channel router in. Must happen before frames arrive;
    /// frames received without a sink are dropped with a log line.
    pub fn set_channel_sink(&self, sink: Arc<dyn ChannelMessageSink>) {
        *self.channel_sink.write() = Some(sink);
    }

    fn ingress_slots(&self) -> usize {
        (self.cfg.ideal_peer_count * INGRESS_STRETCH) as usize
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Bind the acceptor and start the event loop. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for cap in self.registry.iter() {
            cap.on_starting();
        }

        let listener = TcpListener::bind((self.cfg.listen_addr(), self.cfg.listen_port))
            .await
            .map_err(NetError::Transport)?;
        let port = listener.local_addr().map_err(NetError::Transport)?.port();
        self.listen_port.store(port, Ordering::Relaxed);
        self.determine_public();

        tracing::info!(
            id = %self.id.abridged(),
            port,
            public = %self.public_endpoint.read().name(),
            "peer host listening"
        );

        let accept = {
            let host = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { host.accept_loop(listener, shutdown).await })
        };
        let events = {
            let host = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { host.event_loop(shutdown).await })
        };
        self.tasks.lock().extend([accept, events]);
        Ok(())
    }

    /// Stop the acceptor, cancel pending handshakes, disconnect every
    /// session with `ClientQuit`, and clear the maps. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(id = %self.id.abridged(), "peer host stopping");
        let _ = self.shutdown.send(());

        for cap in self.registry.iter() {
            cap.on_stopping();
        }

        for handle in self.connecting.lock().drain(..) {
            handle.abort();
        }

        let sessions: Vec<Arc<PeerSession>> =
            self.maps.read().sessions.values().cloned().collect();
        for session in sessions {
            session.disconnect(DisconnectReason::ClientQuit).await;
        }

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        {
            let mut maps = self.maps.write();
            maps.sessions.clear();
            maps.peers.clear();
        }
        self.pending.lock().clear();
    }

    /// Publish either the configured public address or the listen address.
    fn determine_public(&self) {
        let port = self.listen_port();
        let listen = self.cfg.listen_addr();
        let public = self.cfg.public_addr();

        let addr = if self.cfg.traverse_nat && !listen.is_unspecified() && !listen.is_loopback() {
            listen
        } else if let Some(p) = public {
            p
        } else {
            listen
        };
        *self.public_endpoint.write() = Endpoint::new(addr, port);
    }

    // ── Public operations ────────────────────────────────────────────────

    /// Schedule a connect attempt to the endpoint.
    pub async fn add_peer(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), NetError> {
        if !self.is_running() {
            return Err(NetError::NotReady);
        }
        self.connect(endpoint).await;
        Ok(())
    }

    /// Pin a node id as required (for pinned mode) and try to connect.
    pub async fn require_peer(
        self: &Arc<Self>,
        id: NodeId,
        endpoint: Endpoint,
    ) -> Result<(), NetError> {
        if !self.is_running() {
            return Err(NetError::NotReady);
        }
        self.required.lock().insert(id);
        self.connect(endpoint).await;
        Ok(())
    }

    /// Remove a node id from the required set.
    pub fn relinquish_peer(&self, id: NodeId) {
        self.required.lock().remove(&id);
    }

    /// Disconnect the session with the given hex node id with
    /// `UserReason`. No-op when unknown; refused for our own id.
    pub async fn disconnect_by_node_id(&self, hex_id: &str) -> bool {
        if self.id.to_hex() == hex_id.trim_start_matches("0x") {
            tracing::warn!(id = %self.id.abridged(), "refusing to disconnect self");
            return false;
        }
        let Ok(node) = hex_id.parse::<NodeId>() else {
            tracing::warn!(hex_id, "disconnect: malformed node id");
            return false;
        };
        let session = self.maps.read().sessions.get(&node).cloned();
        match session {
            Some(session) if session.is_connected() => {
                session.disconnect(DisconnectReason::UserReason).await;
                true
            }
            _ => {
                tracing::warn!(node = %node.abridged(), "disconnect: no session found");
                false
            }
        }
    }

    /// Snapshot of every connected session.
    pub fn peer_session_info(&self) -> Vec<SessionInfo> {
        if !self.is_running() {
            return Vec::new();
        }
        self.maps
            .read()
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.info())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.maps.read().sessions.len()
    }

    /// Number of connect attempts currently in flight.
    pub fn pending_connections(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn have_session(&self, id: NodeId) -> bool {
        self.maps
            .read()
            .sessions
            .get(&id)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Trigger keep-alive and reconnect on the next tick.
    pub fn reconnect_now(&self) {
        self.reconnect_now.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn deliver_channel_data(&self, from: NodeId, frame: Bytes) {
        let sink = self.channel_sink.read().clone();
        match sink {
            Some(sink) => sink.on_node_channel_message(from, frame).await,
            None => {
                tracing::warn!(from = %from.abridged(), "channel frame dropped: no sink wired")
            }
        }
    }

    // ── Connect path ─────────────────────────────────────────────────────

    /// True when the endpoint resolves to this host's own listener.
    fn is_self_endpoint(&self, endpoint: &Endpoint) -> bool {
        if endpoint.tcp_port != self.listen_port() {
            return false;
        }
        let addr = endpoint.address;
        let listen = self.cfg.listen_addr();
        let matches = (!self.cfg.listen_ip.is_empty() && addr == listen)
            || self.cfg.public_addr() == Some(addr)
            || addr.is_loopback()
            || addr.is_unspecified()
            || addr == self.public_endpoint.read().address
            || self
                .client_endpoint
                .read()
                .map(|c| c.ip() == addr)
                .unwrap_or(false);
        matches
    }

    /// Open a TLS client connection and run the application handshake.
    /// Rejections are logged, never propagated; the pending flag is
    /// always cleared.
    pub async fn connect(self: &Arc<Self>, endpoint: Endpoint) {
        if !self.is_running() {
            return;
        }
        if self.is_self_endpoint(&endpoint)
            || endpoint == *self.public_endpoint.read()
            || endpoint == Endpoint::new(self.cfg.listen_addr(), self.listen_port())
        {
            tracing::trace!(endpoint = %endpoint.name(), "ignore connect self");
            return;
        }
        {
            let maps = self.maps.read();
            if let Some(peer) = maps.peers.get(&endpoint.name()) {
                tracing::trace!(endpoint = %endpoint.name(), "already known, not reconnecting");
                if !endpoint.host.is_empty() {
                    peer.write().endpoint.host = endpoint.host.clone();
                }
                return;
            }
        }
        if endpoint.is_unspecified() {
            tracing::trace!(endpoint = %endpoint.name(), "target address is empty");
            return;
        }
        {
            let mut pending = self.pending.lock();
            if !pending.insert(endpoint.name()) {
                return;
            }
        }

        tracing::info!(
            id = %self.id.abridged(),
            endpoint = %endpoint.name(),
            "attempting connection"
        );

        let host = self.clone();
        let handle = tokio::spawn(async move {
            let name = endpoint.name();
            if let Err(e) = host.dial(endpoint).await {
                tracing::warn!(endpoint = %name, error = %e, "connect failed");
            }
            host.pending.lock().remove(&name);
        });
        self.connecting.lock().push(handle);
    }

    async fn dial(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), NetError> {
        let tcp = TcpStream::connect(endpoint.socket_addr())
            .await
            .map_err(NetError::Transport)?;
        let remote = tcp.peer_addr().map_err(NetError::Transport)?;

        let connector = TlsConnector::from(self.tls.client.clone());
        let server_name =
            rustls::pki_types::ServerName::IpAddress(endpoint.address.into());
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(NetError::Transport)?;

        let socket = FramedSocket::new(PeerStream::Client(stream), remote);
        self.handshake_and_admit(socket).await
    }

    // ── Accept path ──────────────────────────────────────────────────────

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let acceptor = TlsAcceptor::from(self.tls.server.clone());
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                r = listener.accept() => r,
            };
            let (tcp, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if !self.is_running() {
                break;
            }
            tracing::info!(%remote, "incoming connection");

            if self.session_count() > self.ingress_slots() {
                tracing::info!(%remote, "dropping incoming connect: peer slots exhausted");
                continue;
            }
            *self.client_endpoint.write() = Some(remote);

            let host = self.clone();
            let acceptor = acceptor.clone();
            let handle = tokio::spawn(async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "tls accept failed");
                        return;
                    }
                };
                let socket = FramedSocket::new(PeerStream::Server(stream), remote);
                if let Err(e) = host.handshake_and_admit(socket).await {
                    tracing::warn!(%remote, error = %e, "inbound handshake failed");
                }
            });
            self.connecting.lock().push(handle);
        }
        tracing::debug!("acceptor stopped");
    }

    // ── Admission ────────────────────────────────────────────────────────

    async fn handshake_and_admit<S>(self: &Arc<Self>, socket: FramedSocket<S>) -> Result<(), NetError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ours = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            client_banner: self.banner.clone(),
            capabilities: self.registry.descriptors(),
            listen_port: self.listen_port(),
            node_id: self.id,
        };
        let (socket, theirs) = exchange_hello(socket, &ours).await?;
        self.admit(socket, theirs).await
    }

    /// Evaluate the admission rules against a completed handshake.
    /// Returns the negotiated capability set on success.
    pub fn evaluate_hello(
        &self,
        hello: &HelloMessage,
    ) -> Result<Vec<CapabilityDesc>, DisconnectReason> {
        if hello.node_id == self.id {
            return Err(DisconnectReason::LocalIdentity);
        }
        if hello.protocol_version < PROTOCOL_VERSION - 1 {
            return Err(DisconnectReason::IncompatibleProtocol);
        }
        let negotiated = self.registry.negotiate(&hello.capabilities);
        if negotiated.is_empty() {
            return Err(DisconnectReason::UselessPeer);
        }
        if self.cfg.pin_mode && !self.required.lock().contains(&hello.node_id) {
            tracing::warn!(
                peer = %hello.node_id.abridged(),
                "unexpected identity: not on the required list"
            );
            return Err(DisconnectReason::UnexpectedIdentity);
        }
        if self.have_session(hello.node_id) {
            tracing::warn!(
                peer = %hello.node_id.abridged(),
                "session already exists for this node id"
            );
            return Err(DisconnectReason::DuplicatePeer);
        }
        if self.session_count() > self.ingress_slots() {
            tracing::warn!("too many peers");
            return Err(DisconnectReason::TooManyPeers);
        }
        Ok(negotiated)
    }

    /// Register a session for an accepted handshake, or send the reject
    /// reason and close.
    pub async fn admit<S>(
        self: &Arc<Self>,
        mut socket: FramedSocket<S>,
        hello: HelloMessage,
    ) -> Result<(), NetError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let remote = socket.remote();
        tracing::info!(
            peer = %hello.node_id.abridged(),
            banner = %hello.client_banner,
            %remote,
            "peer session starting"
        );

        let negotiated = match self.evaluate_hello(&hello) {
            Ok(caps) => caps,
            Err(DisconnectReason::LocalIdentity) => {
                // Connected to ourselves: close without ceremony.
                tracing::trace!(%remote, "disconnect self");
                return Err(NetError::HandshakeReject(DisconnectReason::LocalIdentity));
            }
            Err(reason) => {
                let framed =
                    hello.protocol_version.min(PROTOCOL_VERSION) >= FRAMING_MIN_VERSION;
                let frame: &[u8] = if framed {
                    &[0, BasePacket::Disconnect as u8, reason as u8]
                } else {
                    &[BasePacket::Disconnect as u8, reason as u8]
                };
                let _ = socket.write_frame(frame).await;
                return Err(NetError::HandshakeReject(reason));
            }
        };

        // The session's peer record is keyed by the remote address plus
        // the listen port it announced.
        let mut endpoint = Endpoint::new(remote.ip(), hello.listen_port);
        endpoint.udp_port = hello.listen_port;

        let (slots, framed) = assign_slots(
            &self.registry,
            &negotiated,
            hello.protocol_version,
            PROTOCOL_VERSION,
        );
        let slots: Vec<_> = slots
            .into_iter()
            .filter_map(|slot| self.registry.get(&slot.desc).map(|cap| (slot, cap)))
            .collect();

        let info = SessionInfo {
            id: hello.node_id,
            client_banner: hello.client_banner.clone(),
            address: remote.ip(),
            listen_port: hello.listen_port,
            capabilities: negotiated.clone(),
            topics: HashSet::new(),
            topic_seq: 0,
        };

        let admitted = {
            let mut maps = self.maps.write();

            // A concurrent handshake for the same id may have registered
            // between evaluation and here; the later one loses.
            let raced = maps
                .sessions
                .get(&hello.node_id)
                .map(|s| s.is_connected())
                .unwrap_or(false);
            if raced {
                None
            } else {
                let peer = maps
                    .peers
                    .entry(endpoint.name())
                    .or_insert_with(|| Arc::new(RwLock::new(Peer::new(hello.node_id, endpoint.clone()))))
                    .clone();
                peer.write().endpoint = endpoint.clone();

                let (session, rx) = PeerSession::new(
                    hello.node_id,
                    peer,
                    info,
                    Arc::downgrade(self),
                    slots.clone(),
                    framed,
                );
                maps.sessions.insert(hello.node_id, session.clone());

                Some((session, rx, slots))
            }
        };

        let (session, slot_list) = match admitted {
            Some((session, rx, slots)) => {
                let (reader, writer) = socket.split();
                tokio::spawn(session.clone().writer_task(rx, writer));
                tokio::spawn(session.clone().read_loop(reader));
                session.mark_active();
                (session, slots)
            }
            None => {
                let reason = DisconnectReason::DuplicatePeer;
                let frame: &[u8] = if framed {
                    &[0, BasePacket::Disconnect as u8, reason as u8]
                } else {
                    &[BasePacket::Disconnect as u8, reason as u8]
                };
                let _ = socket.write_frame(frame).await;
                return Err(NetError::HandshakeReject(reason));
            }
        };

        // Lock released: now run user callbacks.
        for (slot, cap) in &slot_list {
            cap.new_peer(
                Arc::downgrade(&session),
                &slot.desc,
                slot.offset,
                slot.subproto_id,
            );
        }

        // Let the new peer see our current topic set right away.
        let payload = crate::session::encode_topic_update(
            self.topic_seq.load(Ordering::SeqCst),
            &self.topics.read(),
        );
        let _ = session.send_base(BasePacket::TopicUpdate, &payload).await;

        tracing::info!(peer = %hello.node_id.abridged(), "peer registered");
        Ok(())
    }

    // ── Event loop ───────────────────────────────────────────────────────

    async fn event_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(LOOP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }
            if !self.is_running() {
                break;
            }
            self.connecting.lock().retain(|h| !h.is_finished());
            self.keep_alive_peers().await;
            self.reconnect_all_nodes().await;
            self.announce().await;
            self.refresh_topics().await;
        }
        tracing::debug!("event loop stopped");
    }

    async fn keep_alive_peers(&self) {
        let now = Instant::now();
        let last_ping = self.ticks.lock().last_ping;
        if now.duration_since(last_ping) < KEEP_ALIVE_INTERVAL
            && !self.reconnect_now.load(Ordering::SeqCst)
        {
            return;
        }

        let sessions: Vec<(NodeId, Arc<PeerSession>)> = self
            .maps
            .read()
            .sessions
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        for (id, session) in &sessions {
            if session.is_connected() {
                if ping_timed_out(now, last_ping, session.last_received()) {
                    tracing::warn!(peer = %id.abridged(), "keep-alive timeout");
                    session.disconnect(DisconnectReason::PingTimeout).await;
                } else {
                    let _ = session.ping().await;
                }
            } else {
                let name = session.peer().read().endpoint.name();
                let mut maps = self.maps.write();
                maps.sessions.remove(id);
                maps.peers.remove(&name);
                tracing::warn!(peer = %id.abridged(), endpoint = %name, "reaped dead session");
            }
        }

        // Drop peer records that no longer have any session behind them.
        {
            let mut maps = self.maps.write();
            let live: HashSet<NodeId> = maps.sessions.keys().copied().collect();
            maps.peers.retain(|name, peer| {
                let keep = live.contains(&peer.read().id);
                if !keep {
                    tracing::debug!(endpoint = %name, "dropping sessionless peer");
                }
                keep
            });
        }

        self.ticks.lock().last_ping = Instant::now();
    }

    async fn reconnect_all_nodes(self: &Arc<Self>) {
        {
            let last = self.ticks.lock().last_reconnect;
            if Instant::now().duration_since(last) < RECONNECT_INTERVAL
                && !self.reconnect_now.load(Ordering::SeqCst)
            {
                return;
            }
        }

        let authorized = self.conn_manager.get_all_connect();
        let peers: Vec<(String, Endpoint, NodeId)> = self
            .maps
            .read()
            .peers
            .iter()
            .map(|(name, p)| {
                let p = p.read();
                (name.clone(), p.endpoint.clone(), p.id)
            })
            .collect();

        let mut merged: BTreeMap<String, Endpoint> = BTreeMap::new();
        for (name, endpoint, _) in &peers {
            merged
                .entry(name.clone())
                .or_insert_with(|| endpoint.clone());
        }

        for (name, target) in &authorized {
            let known = peers.iter().find(|(_, ep, _)| ep == target);
            match known {
                Some((_, endpoint, id)) => {
                    if !self.have_session(*id) {
                        tracing::debug!(endpoint = %name, "reconnecting known peer");
                        self.connect(endpoint.clone()).await;
                    }
                }
                None => {
                    let own_listen =
                        Endpoint::new(self.cfg.listen_addr(), self.listen_port());
                    if *target != *self.public_endpoint.read() && *target != own_listen {
                        tracing::debug!(endpoint = %name, "connecting authorized peer");
                        self.connect(target.clone()).await;
                    }
                }
            }
            merged.entry(name.clone()).or_insert_with(|| target.clone());
        }

        self.conn_manager.update_all_connect(merged);
        self.ticks.lock().last_reconnect = Instant::now();
        self.reconnect_now.store(false, Ordering::SeqCst);
    }

    async fn announce(&self) {
        {
            let last = self.ticks.lock().last_announce;
            if Instant::now().duration_since(last) < ANNOUNCEMENT_INTERVAL {
                return;
            }
        }

        let (digest, nodes) = self.announcement_node_list();
        let announcement = Announcement { digest, nodes };
        let mut payload = Vec::new();
        announcement.encode(&mut payload);

        let sessions: Vec<Arc<PeerSession>> = self
            .maps
            .read()
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .cloned()
            .collect();
        tracing::trace!(
            digest = %announcement.digest,
            sample = announcement.nodes.len(),
            sessions = sessions.len(),
            "broadcasting announcement"
        );
        for session in sessions {
            let _ = session.send_base(BasePacket::Announcement, &payload).await;
        }

        self.ticks.lock().last_announce = Instant::now();
    }

    /// Digest of {self ∪ peers} endpoint names plus a bounded random
    /// sample of peers.
    fn announcement_node_list(&self) -> (B256, Vec<AnnouncedNode>) {
        let peers: Vec<AnnouncedNode> = self
            .maps
            .read()
            .peers
            .values()
            .map(|p| {
                let p = p.read();
                AnnouncedNode {
                    id: p.id,
                    address: p.endpoint.address.to_string(),
                    tcp_port: p.endpoint.tcp_port,
                    udp_port: p.endpoint.udp_port,
                }
            })
            .collect();

        let own = {
            let public = self.public_endpoint.read();
            AnnouncedNode {
                id: self.id,
                address: public.address.to_string(),
                tcp_port: public.tcp_port,
                udp_port: public.tcp_port,
            }
        };

        let mut names: Vec<String> = peers
            .iter()
            .chain(std::iter::once(&own))
            .map(|n| format!("{}:{}", n.address, n.tcp_port))
            .collect();
        let digest = announcement_digest(&mut names);

        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (digest, sample_nodes(peers, seed))
    }

    async fn refresh_topics(&self) {
        {
            let mut ticks = self.ticks.lock();
            if Instant::now().duration_since(ticks.last_topic_refresh) < TOPIC_REFRESH_INTERVAL {
                return;
            }
            ticks.last_topic_refresh = Instant::now();
        }
        self.broadcast_topics().await;
    }

    async fn broadcast_topics(&self) {
        let payload = crate::session::encode_topic_update(
            self.topic_seq.load(Ordering::SeqCst),
            &self.topics.read(),
        );
        let sessions: Vec<Arc<PeerSession>> = self
            .maps
            .read()
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .cloned()
            .collect();
        for session in sessions {
            let _ = session.send_base(BasePacket::TopicUpdate, &payload).await;
        }
    }
}

// ── Mesh interface for the channel router ─────────────────────────────────────

#[async_trait]
impl PeerMesh for PeerHost {
    async fn send_channel_data(&self, node: NodeId, frame: Bytes) -> Result<(), NetError> {
        let session = self.maps.read().sessions.get(&node).cloned();
        match session {
            Some(session) if session.is_connected() => {
                session.send_base(BasePacket::ChannelData, &frame).await
            }
            _ => Err(NetError::NodeUnreachable(node.abridged())),
        }
    }

    fn peers_by_topic(&self, topic: &str) -> Vec<NodeId> {
        self.maps
            .read()
            .sessions
            .values()
            .filter(|s| s.is_connected() && s.has_topic(topic))
            .map(|s| s.node_id())
            .collect()
    }

    async fn update_local_topics(&self, topics: HashSet<String>) {
        {
            *self.topics.write() = topics;
        }
        self.topic_seq.fetch_add(1, Ordering::SeqCst);
        self.broadcast_topics().await;
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// The keep-alive decision: a connected peer is dead when the timeout
/// window elapsed since the last ping tick and nothing was received since
/// that tick.
pub fn ping_timed_out(now: Instant, last_ping: Instant, last_received: Instant) -> bool {
    now.duration_since(last_ping) > KEEP_ALIVE_TIMEOUT && last_received < last_ping
}

/// Order-independent digest over endpoint names: sort, concatenate,
/// keccak.
pub fn announcement_digest(names: &mut Vec<String>) -> B256 {
    names.sort();
    let mut joined = String::new();
    for name in names.iter() {
        joined.push_str(name);
    }
    keccak256(joined.as_bytes())
}

/// Fisher–Yates shuffle seeded from wall-clock seconds, capped at
/// [`MAX_ANNOUNCEMENT_NODES`] entries.
pub fn sample_nodes(mut nodes: Vec<AnnouncedNode>, seed: u64) -> Vec<AnnouncedNode> {
    if nodes.len() <= MAX_ANNOUNCEMENT_NODES {
        return nodes;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let len = nodes.len();
    for i in 0..len {
        let r = rng.gen_range(i..len);
        nodes.swap(i, r);
    }
    nodes.truncate(MAX_ANNOUNCEMENT_NODES);
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_decision() {
        let base = Instant::now();
        let last_ping = base;
        // 11 s past the ping tick, nothing received since: dead.
        let now = base + Duration::from_secs(11);
        let stale = base - Duration::from_secs(1);
        assert!(ping_timed_out(now, last_ping, stale));

        // Fresh traffic after the tick keeps the session alive.
        let fresh = base + Duration::from_secs(5);
        assert!(!ping_timed_out(now, last_ping, fresh));

        // Inside the timeout window nothing is dead yet.
        let soon = base + Duration::from_secs(9);
        assert!(!ping_timed_out(soon, last_ping, stale));
    }

    #[test]
    fn digest_is_permutation_invariant() {
        let mut a = vec![
            "10.0.0.1:30300".to_string(),
            "10.0.0.2:30300".to_string(),
            "10.0.0.3:30300".to_string(),
        ];
        let mut b = vec![a[2].clone(), a[0].clone(), a[1].clone()];
        assert_eq!(announcement_digest(&mut a), announcement_digest(&mut b));

        let mut c = vec![a[0].clone(), a[1].clone()];
        assert_ne!(announcement_digest(&mut a), announcement_digest(&mut c));
    }

    #[test]
    fn sample_caps_at_limit_and_is_seed_deterministic() {
        let nodes: Vec<AnnouncedNode> = (0..250u16)
            .map(|i| AnnouncedNode {
                id: NodeId::default(),
                address: format!("10.0.{}.{}", i / 250, i % 250),
                tcp_port: 30300 + i,
                udp_port: 30300 + i,
            })
            .collect();

        let a = sample_nodes(nodes.clone(), 42);
        let b = sample_nodes(nodes.clone(), 42);
        let c = sample_nodes(nodes.clone(), 43);
        assert_eq!(a.len(), MAX_ANNOUNCEMENT_NODES);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let few = sample_nodes(nodes[..3].to_vec(), 42);
        assert_eq!(few.len(), 3);
    }
}
