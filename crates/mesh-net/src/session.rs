//! Long-lived per-peer sessions.
//!
//! A session owns the framed TLS stream of one authenticated peer: a
//! FIFO write queue pumped by a writer task, and a read loop that answers
//! pings, tracks liveness, and dispatches capability frames. Sessions are
//! owned exclusively by the host; everything else holds `Weak` references
//! and resolves them through the host under its session-map lock.
//!
//! Peer frame layout inside the length prefix:
//!   offset mode — `[packet_id] payload`
//!   framed mode — `[subproto_id] [packet_id] payload`, sub-protocol 0
//!   being the base protocol.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Instant;

use alloy_rlp::{Decodable, Encodable};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use mesh_core::wire::{
    Announcement, BasePacket, CapabilityDesc, DisconnectReason, TopicUpdate, USER_PACKET,
};
use mesh_core::{Endpoint, NetError, NodeId};

use crate::capability::CapabilitySlot;
use crate::framed::{FrameReader, FrameWriter};
use crate::host::PeerHost;

/// The TLS stream a peer session runs over, either direction.
pub type PeerStream = tokio_rustls::TlsStream<TcpStream>;

/// Depth of the per-session outbound queue.
const OUTBOUND_QUEUE: usize = 256;

// ── Peer ──────────────────────────────────────────────────────────────────────

/// A known peer: created on first successful handshake, keyed in the host
/// by its endpoint name. At most one peer exists per endpoint name.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub last_connected: Option<Instant>,
    pub offline: bool,
}

impl Peer {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            last_connected: None,
            offline: true,
        }
    }
}

/// Shared handle to a peer record; the host map and its sessions point at
/// the same one.
pub type SharedPeer = Arc<RwLock<Peer>>;

// ── Session info ──────────────────────────────────────────────────────────────

/// Snapshot of an active session, as returned by
/// `PeerHost::peer_session_info`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: NodeId,
    pub client_banner: String,
    pub address: IpAddr,
    pub listen_port: u16,
    pub capabilities: Vec<CapabilityDesc>,
    /// Channel topics the remote node has published.
    pub topics: HashSet<String>,
    pub topic_seq: u64,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Disconnecting,
    Closed,
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct PeerSession {
    node_id: NodeId,
    peer: SharedPeer,
    info: RwLock<SessionInfo>,
    state: RwLock<SessionState>,
    last_received: RwLock<Instant>,
    outbound: mpsc::Sender<Bytes>,
    /// Level-triggered close signal; both session tasks watch it.
    closed: watch::Sender<bool>,
    host: Weak<PeerHost>,
    slots: Vec<(CapabilitySlot, Arc<dyn crate::capability::Capability>)>,
    framed: bool,
}

impl PeerSession {
    /// Create a session plus the receiver its writer task drains.
    pub fn new(
        node_id: NodeId,
        peer: SharedPeer,
        info: SessionInfo,
        host: Weak<PeerHost>,
        slots: Vec<(CapabilitySlot, Arc<dyn crate::capability::Capability>)>,
        framed: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            node_id,
            peer,
            info: RwLock::new(info),
            state: RwLock::new(SessionState::Connecting),
            last_received: RwLock::new(Instant::now()),
            outbound: tx,
            closed,
            host,
            slots,
            framed,
        });
        (session, rx)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn peer(&self) -> &SharedPeer {
        &self.peer
    }

    pub fn info(&self) -> SessionInfo {
        self.info.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Active)
    }

    pub fn last_received(&self) -> Instant {
        *self.last_received.read()
    }

    /// Topics the remote has published, for topic routing.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.info.read().topics.contains(topic)
    }

    pub(crate) fn mark_active(&self) {
        *self.state.write() = SessionState::Active;
        let mut peer = self.peer.write();
        peer.offline = false;
        peer.last_connected = Some(Instant::now());
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Queue a base-protocol packet. Frames observe FIFO order with
    /// respect to the caller.
    pub async fn send_base(&self, packet: BasePacket, payload: &[u8]) -> Result<(), NetError> {
        self.enqueue(0, packet as u8, payload).await
    }

    /// Queue a capability packet by descriptor. The packet id is relative
    /// to the capability's range.
    pub async fn send_capability(
        &self,
        desc: &CapabilityDesc,
        packet_id: u8,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let slot = self
            .slots
            .iter()
            .map(|(s, _)| s)
            .find(|s| &s.desc == desc)
            .ok_or_else(|| NetError::Protocol(format!("capability {desc} not negotiated")))?;
        if self.framed {
            self.enqueue(slot.subproto_id, packet_id, payload).await
        } else {
            self.enqueue(0, slot.offset + packet_id, payload).await
        }
    }

    async fn enqueue(&self, subproto: u8, packet: u8, payload: &[u8]) -> Result<(), NetError> {
        if matches!(self.state(), SessionState::Closed) {
            return Err(NetError::Cancelled);
        }
        let mut frame = BytesMut::with_capacity(payload.len() + 2);
        if self.framed {
            frame.put_u8(subproto);
        }
        frame.put_u8(packet);
        frame.put_slice(payload);
        self.outbound
            .send(frame.freeze())
            .await
            .map_err(|_| NetError::Cancelled)
    }

    pub async fn ping(&self) -> Result<(), NetError> {
        self.send_base(BasePacket::Ping, &[]).await
    }

    /// Send a Disconnect frame with the reason, then close the session.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Disconnecting | SessionState::Closed) {
                return;
            }
            *state = SessionState::Disconnecting;
        }
        tracing::info!(
            peer = %self.node_id.abridged(),
            %reason,
            "disconnecting session"
        );
        let _ = self.send_base(BasePacket::Disconnect, &[reason as u8]).await;
        self.close();
    }

    /// Mark the session closed and wake both session tasks. The peer
    /// record is flagged offline; the host reaps the session on its next
    /// tick.
    pub fn close(&self) {
        *self.state.write() = SessionState::Closed;
        self.peer.write().offline = true;
        self.closed.send_replace(true);
    }

    // ── Tasks ────────────────────────────────────────────────────────────

    /// Drain the outbound queue into the write half. Ends on close or a
    /// transport failure; frames already queued at close time (the
    /// Disconnect reason among them) are flushed first.
    pub(crate) async fn writer_task<S>(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Bytes>,
        mut writer: FrameWriter<S>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        let mut closed = self.closed.subscribe();
        loop {
            let frame = tokio::select! {
                f = rx.recv() => f,
                _ = async { while !*closed.borrow() { if closed.changed().await.is_err() { break; } } } => {
                    while let Ok(frame) = rx.try_recv() {
                        if writer.write_frame(&frame).await.is_err() {
                            break;
                        }
                    }
                    None
                }
            };
            let Some(frame) = frame else { break };
            if let Err(e) = writer.write_frame(&frame).await {
                tracing::debug!(
                    peer = %self.node_id.abridged(),
                    remote = %writer.remote(),
                    error = %e,
                    "session write failed"
                );
                self.close();
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Read frames until EOF, error, or local close.
    pub(crate) async fn read_loop<S>(self: Arc<Self>, mut reader: FrameReader<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        let remote = reader.remote();
        let mut closed = self.closed.subscribe();
        loop {
            let frame = tokio::select! {
                r = reader.read_frame() => r,
                _ = closed.wait_for(|c| *c) => break,
            };
            match frame {
                Ok(Some(frame)) => {
                    *self.last_received.write() = Instant::now();
                    if let Err(e) = self.handle_frame(&frame, remote).await {
                        tracing::warn!(
                            peer = %self.node_id.abridged(),
                            %remote,
                            error = %e,
                            "bad peer frame"
                        );
                    }
                    if matches!(self.state(), SessionState::Closed) {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(peer = %self.node_id.abridged(), %remote, "peer half-closed");
                    *self.state.write() = SessionState::Disconnecting;
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        peer = %self.node_id.abridged(),
                        %remote,
                        error = %e,
                        "session read failed"
                    );
                    break;
                }
            }
        }
        self.close();
    }

    async fn handle_frame(&self, frame: &[u8], remote: SocketAddr) -> Result<(), NetError> {
        let (subproto, packet, payload) = if self.framed {
            if frame.len() < 2 {
                return Err(NetError::Protocol("frame shorter than framed header".into()));
            }
            (frame[0], frame[1], &frame[2..])
        } else {
            if frame.is_empty() {
                return Err(NetError::Protocol("empty frame".into()));
            }
            (0, frame[0], &frame[1..])
        };

        if subproto == 0 && packet < USER_PACKET {
            return self.handle_base(packet, payload, remote).await;
        }

        let cap = if self.framed {
            self.slots
                .iter()
                .find(|(s, _)| s.subproto_id == subproto)
                .map(|(s, c)| (packet, s.desc.clone(), c.clone()))
        } else {
            self.slots
                .iter()
                .find(|(s, _)| packet >= s.offset && packet < s.offset.saturating_add(s.count))
                .map(|(s, c)| (packet - s.offset, s.desc.clone(), c.clone()))
        };

        match cap {
            Some((relative, desc, cap)) => {
                tracing::trace!(
                    peer = %self.node_id.abridged(),
                    cap = %desc,
                    packet = relative,
                    "capability frame"
                );
                cap.on_message(self.node_id, relative, Bytes::copy_from_slice(payload));
                Ok(())
            }
            None => Err(NetError::Protocol(format!(
                "no capability claims packet 0x{packet:02x} (subproto {subproto})"
            ))),
        }
    }

    async fn handle_base(
        &self,
        packet: u8,
        payload: &[u8],
        remote: SocketAddr,
    ) -> Result<(), NetError> {
        match BasePacket::try_from(packet)? {
            BasePacket::Hello => Err(NetError::Protocol("unexpected hello after handshake".into())),
            BasePacket::Ping => {
                self.send_base(BasePacket::Pong, &[]).await?;
                Ok(())
            }
            BasePacket::Pong => Ok(()),
            BasePacket::Disconnect => {
                let reason = payload
                    .first()
                    .copied()
                    .map(DisconnectReason::try_from)
                    .transpose()?
                    .unwrap_or(DisconnectReason::ClientQuit);
                tracing::info!(
                    peer = %self.node_id.abridged(),
                    %remote,
                    %reason,
                    "peer disconnected us"
                );
                self.close();
                Ok(())
            }
            BasePacket::Announcement => {
                let ann = Announcement::decode(&mut &payload[..])
                    .map_err(|e| NetError::Protocol(format!("bad announcement: {e}")))?;
                tracing::trace!(
                    peer = %self.node_id.abridged(),
                    digest = %ann.digest,
                    sample = ann.nodes.len(),
                    "peer announcement"
                );
                Ok(())
            }
            BasePacket::TopicUpdate => {
                let update = TopicUpdate::decode(&mut &payload[..])
                    .map_err(|e| NetError::Protocol(format!("bad topic update: {e}")))?;
                let mut info = self.info.write();
                if update.seq > info.topic_seq {
                    info.topic_seq = update.seq;
                    info.topics = update.topics.into_iter().collect();
                    tracing::debug!(
                        peer = %self.node_id.abridged(),
                        seq = info.topic_seq,
                        topics = info.topics.len(),
                        "peer topics updated"
                    );
                }
                Ok(())
            }
            BasePacket::ChannelData => {
                if let Some(host) = self.host.upgrade() {
                    host.deliver_channel_data(self.node_id, Bytes::copy_from_slice(payload))
                        .await;
                }
                Ok(())
            }
        }
    }
}

/// Encode a topic update frame payload.
pub(crate) fn encode_topic_update(seq: u64, topics: &HashSet<String>) -> Vec<u8> {
    let mut sorted: Vec<String> = topics.iter().cloned().collect();
    sorted.sort();
    let update = TopicUpdate { seq, topics: sorted };
    let mut out = Vec::new();
    update.encode(&mut out);
    out
}
