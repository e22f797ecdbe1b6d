//! The channel router: request correlation and topic routing.
//!
//! Every 0x20/0x30 request opens a correlation entry keyed by its seq.
//! Topic requests pick a target uniformly at random among subscribers and
//! retry with exclusion on failed responses; when no candidate remains
//! the origin gets the appropriate unavailable result. RPC bodies (0x12)
//! go to the local dispatcher and the response returns on the
//! originating session under the request seq.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

use mesh_core::interfaces::{ChannelMessageSink, PeerMesh, RpcDispatcher};
use mesh_core::wire::{msg_type, result_code, ChannelMessage};
use mesh_core::{NetError, NodeId};

/// How long a topic request waits for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

// ── Correlation state ─────────────────────────────────────────────────────────

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Session(u64),
    Node(NodeId),
}

/// One in-flight topic request (0x30), keyed by seq.
struct PendingRequest {
    /// The original request, re-sent verbatim on retry.
    message: ChannelMessage,
    topic: String,
    from: Origin,
    to_session: Option<u64>,
    to_node: Option<NodeId>,
    failed_sessions: HashSet<u64>,
    failed_nodes: HashSet<NodeId>,
    created_at: Instant,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub struct ChannelRouter {
    dispatcher: Arc<dyn RpcDispatcher>,
    /// Set once at wiring time, after the host exists.
    mesh: RwLock<Option<Arc<dyn PeerMesh>>>,
    sessions: DashMap<u64, Arc<crate::server::ChannelSession>>,
    /// seq → originating session, for 0x12 and 0x20 correlation.
    seq_to_session: Mutex<HashMap<String, u64>>,
    /// seq → in-flight topic request.
    pending: Mutex<HashMap<String, PendingRequest>>,
    rng: Mutex<StdRng>,
}

impl ChannelRouter {
    pub fn new(dispatcher: Arc<dyn RpcDispatcher>) -> Arc<Self> {
        Self::with_rng(dispatcher, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied RNG; tests seed it.
    pub fn with_rng(dispatcher: Arc<dyn RpcDispatcher>, rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            mesh: RwLock::new(None),
            sessions: DashMap::new(),
            seq_to_session: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        })
    }

    /// Wire the peer overlay in.
    pub fn set_mesh(&self, mesh: Arc<dyn PeerMesh>) {
        *self.mesh.write() = Some(mesh);
    }

    fn mesh(&self) -> Option<Arc<dyn PeerMesh>> {
        self.mesh.read().clone()
    }

    /// A fresh 32-char hex seq.
    pub fn new_seq() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    // ── Session registry ─────────────────────────────────────────────────

    pub fn register_session(&self, session: Arc<crate::server::ChannelSession>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove a disconnected session and every correlation entry that
    /// references it, then republish the topic union.
    pub async fn on_disconnect(&self, session_id: u64) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            session.deactivate();
        }
        self.seq_to_session
            .lock()
            .retain(|_, sid| *sid != session_id);
        self.pending.lock().retain(|_, req| {
            req.from != Origin::Session(session_id) && req.to_session != Some(session_id)
        });
        self.recompute_topics().await;
    }

    pub async fn close_all_sessions(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.deactivate();
            }
        }
        self.seq_to_session.lock().clear();
        self.pending.lock().clear();
    }

    /// Union of all active sessions' topics, published to the overlay.
    pub async fn recompute_topics(&self) {
        let mut union: HashSet<String> = HashSet::new();
        for entry in self.sessions.iter() {
            if entry.value().is_active() {
                union.extend(entry.value().topics());
            }
        }
        if let Some(mesh) = self.mesh() {
            mesh.update_local_topics(union).await;
        }
    }

    // ── Client-origin messages ───────────────────────────────────────────

    /// Entry point for frames read off an SDK session.
    pub async fn on_client_message(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        message: ChannelMessage,
    ) {
        tracing::debug!(
            session = session.id(),
            typ = format_args!("0x{:02x}", message.typ),
            seq = %message.seq,
            len = message.length(),
            "sdk message"
        );
        match message.typ {
            msg_type::NODE_MESSAGE | msg_type::NODE_RESPONSE => {
                self.on_client_node_message(session, message).await
            }
            msg_type::RPC_REQUEST => self.on_client_rpc(session, message).await,
            msg_type::HEARTBEAT => self.on_heartbeat(session, message).await,
            msg_type::TOPIC_REQUEST => self.on_client_topic_request(session, message).await,
            msg_type::TOPIC_RESPONSE => self.on_client_topic_response(session, message).await,
            msg_type::TOPIC_SUBSCRIBE => self.on_topic_subscribe(session, message).await,
            other => {
                tracing::warn!(session = session.id(), typ = other, "unknown sdk message type")
            }
        }
    }

    /// 0x13: reply "1" when asked "0", absorb "1".
    async fn on_heartbeat(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        mut message: ChannelMessage,
    ) {
        if &message.data[..] == b"0" {
            message.data = Bytes::from_static(b"1");
            message.result = result_code::SUCCESS;
            let _ = session.send(message).await;
        }
    }

    /// 0x12: forward to the local dispatcher, return the response on the
    /// originating session keyed by seq.
    async fn on_client_rpc(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        message: ChannelMessage,
    ) {
        self.seq_to_session
            .lock()
            .insert(message.seq.clone(), session.id());

        let response = self.dispatcher.dispatch(&message.data).await;
        let body = match response {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(seq = %message.seq, error = %e, "rpc dispatch failed");
                return;
            }
        };
        self.send_rpc_response(&message.seq, body).await;
    }

    /// Deliver an RPC response to whichever session originated the seq.
    pub async fn send_rpc_response(&self, seq: &str, body: Vec<u8>) {
        let session_id = self.seq_to_session.lock().remove(seq);
        let Some(session_id) = session_id else {
            tracing::warn!(seq, "rpc response has no origin seq, timed out?");
            return;
        };
        let Some(session) = self.sessions.get(&session_id).map(|e| e.value().clone()) else {
            tracing::warn!(seq, session = session_id, "rpc origin session is gone");
            return;
        };
        let response = ChannelMessage::new(
            msg_type::RPC_REQUEST,
            seq.to_string(),
            result_code::SUCCESS,
            body,
        );
        if session.send(response).await.is_ok() {
            tracing::debug!(seq, session = session_id, "rpc response delivered");
        }
    }

    /// 0x20 from an SDK client: the first 128 bytes of the payload are the
    /// target node id in ascii hex; the rest rides along opaquely.
    async fn on_client_node_message(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        mut message: ChannelMessage,
    ) {
        if message.data.len() < 128 {
            tracing::warn!(
                session = session.id(),
                len = message.data.len(),
                "node message too short for a destination id"
            );
            return;
        }
        let node = std::str::from_utf8(&message.data[..128])
            .ok()
            .and_then(|s| s.parse::<NodeId>().ok());
        let Some(node) = node else {
            tracing::warn!(session = session.id(), "node message destination is not hex");
            return;
        };

        self.seq_to_session
            .lock()
            .insert(message.seq.clone(), session.id());

        let sent = match (self.mesh(), message.encode()) {
            (Some(mesh), Ok(frame)) => mesh.send_channel_data(node, frame).await,
            (None, _) => Err(NetError::NotReady),
            (_, Err(e)) => Err(e.into()),
        };

        if let Err(e) = sent {
            tracing::warn!(
                seq = %message.seq,
                node = %node.abridged(),
                error = %e,
                "node message undeliverable"
            );
            message.typ = msg_type::NODE_RESPONSE;
            message.result = result_code::REMOTE_PEER_UNAVAILABLE;
            message.data = Bytes::new();
            let _ = session.send(message).await;
        }
    }

    /// 0x30 from an SDK client: open a pending request and pick a peer.
    async fn on_client_topic_request(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        message: ChannelMessage,
    ) {
        let topic = match parse_topic(&message.data) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(session = session.id(), error = %e, "bad topic request");
                return;
            }
        };
        tracing::debug!(seq = %message.seq, %topic, "topic request from sdk");

        {
            let mut pending = self.pending.lock();
            pending.insert(
                message.seq.clone(),
                PendingRequest {
                    message: message.clone(),
                    topic: topic.clone(),
                    from: Origin::Session(session.id()),
                    to_session: None,
                    to_node: None,
                    failed_sessions: HashSet::new(),
                    failed_nodes: HashSet::new(),
                    created_at: Instant::now(),
                },
            );
        }

        self.try_next_node(&message.seq).await;
    }

    /// 0x31 from an SDK client: a local subscriber answered a peer-origin
    /// request.
    async fn on_client_topic_response(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        message: ChannelMessage,
    ) {
        let exists = self.pending.lock().contains_key(&message.seq);
        if !exists {
            tracing::warn!(seq = %message.seq, "topic response has no pending request, timed out?");
            return;
        }

        if message.result != result_code::SUCCESS {
            tracing::debug!(
                seq = %message.seq,
                session = session.id(),
                result = message.result,
                "subscriber failed, retrying another session"
            );
            {
                let mut pending = self.pending.lock();
                if let Some(req) = pending.get_mut(&message.seq) {
                    if let Some(failed) = req.to_session {
                        req.failed_sessions.insert(failed);
                    }
                }
            }
            self.try_next_session(&message.seq).await;
            return;
        }

        // Success: forward along the reverse hop and close.
        let req = self.pending.lock().remove(&message.seq);
        let Some(req) = req else { return };
        match req.from {
            Origin::Node(node) => {
                if let (Some(mesh), Ok(frame)) = (self.mesh(), message.encode()) {
                    if let Err(e) = mesh.send_channel_data(node, frame).await {
                        tracing::warn!(seq = %message.seq, error = %e, "response relay failed");
                    }
                }
            }
            Origin::Session(sid) => {
                // A local 0x30 answered by a local 0x31; unusual but legal.
                if let Some(origin) = self.sessions.get(&sid).map(|e| e.value().clone()) {
                    let _ = origin.send(message).await;
                }
            }
        }
    }

    /// 0x32: replace the session's subscription set and recompute the
    /// host's topic union.
    async fn on_topic_subscribe(
        &self,
        session: &Arc<crate::server::ChannelSession>,
        message: ChannelMessage,
    ) {
        let topics: Vec<String> = match serde_json::from_slice(&message.data) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(session = session.id(), error = %e, "bad topic subscription json");
                return;
            }
        };
        tracing::debug!(session = session.id(), count = topics.len(), "topics replaced");
        session.set_topics(topics.into_iter().collect());
        self.recompute_topics().await;
    }

    // ── Node-origin messages ─────────────────────────────────────────────

    /// 0x20/0x21 that arrived from a remote node: deliver to the
    /// originating session by seq, else to any active session, else
    /// report REMOTE_CLIENT_PEER_UNAVAILABLE back to the sender.
    async fn on_node_message(&self, from: NodeId, mut message: ChannelMessage) {
        let by_seq = self.seq_to_session.lock().get(&message.seq).copied();
        if let Some(sid) = by_seq {
            if let Some(session) = self.sessions.get(&sid).map(|e| e.value().clone()) {
                if session.is_active() && session.send(message.clone()).await.is_ok() {
                    tracing::debug!(seq = %message.seq, session = sid, "node message delivered by seq");
                    if message.typ == msg_type::NODE_RESPONSE {
                        self.seq_to_session.lock().remove(&message.seq);
                    }
                    return;
                }
            }
        }

        // No matching seq: push to any active session.
        let any = self
            .sessions
            .iter()
            .find(|e| e.value().is_active())
            .map(|e| e.value().clone());
        if let Some(session) = any {
            if session.send(message.clone()).await.is_ok() {
                tracing::debug!(seq = %message.seq, session = session.id(), "node message pushed");
                return;
            }
        }

        tracing::warn!(seq = %message.seq, "no sdk session for node message");
        if message.result == result_code::SUCCESS {
            message.typ = msg_type::NODE_RESPONSE;
            message.result = result_code::REMOTE_CLIENT_PEER_UNAVAILABLE;
            message.data = Bytes::new();
            if let (Some(mesh), Ok(frame)) = (self.mesh(), message.encode()) {
                let _ = mesh.send_channel_data(from, frame).await;
            }
        }
    }

    /// 0x30 from a remote node: pick a local subscriber.
    async fn on_node_topic_request(&self, from: NodeId, message: ChannelMessage) {
        let topic = match parse_topic(&message.data) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(node = %from.abridged(), error = %e, "bad topic request from node");
                return;
            }
        };
        tracing::debug!(seq = %message.seq, %topic, node = %from.abridged(), "topic request from node");

        {
            let mut pending = self.pending.lock();
            pending
                .entry(message.seq.clone())
                .or_insert_with(|| PendingRequest {
                    message: message.clone(),
                    topic: topic.clone(),
                    from: Origin::Node(from),
                    to_session: None,
                    to_node: None,
                    failed_sessions: HashSet::new(),
                    failed_nodes: HashSet::new(),
                    created_at: Instant::now(),
                });
        }

        self.try_next_session(&message.seq).await;
    }

    /// 0x31 from a remote node: the answer to an SDK-origin request.
    async fn on_node_topic_response(&self, _from: NodeId, message: ChannelMessage) {
        let exists = self.pending.lock().contains_key(&message.seq);
        if !exists {
            tracing::warn!(seq = %message.seq, "node response has no pending request, timed out?");
            return;
        }

        if message.result != result_code::SUCCESS {
            tracing::debug!(
                seq = %message.seq,
                result = message.result,
                "remote peer failed, retrying another"
            );
            {
                let mut pending = self.pending.lock();
                if let Some(req) = pending.get_mut(&message.seq) {
                    if let Some(failed) = req.to_node {
                        req.failed_nodes.insert(failed);
                    }
                }
            }
            self.try_next_node(&message.seq).await;
            return;
        }

        // Success: deliver to the originating SDK session and close.
        let req = self.pending.lock().remove(&message.seq);
        let Some(req) = req else { return };
        if let Origin::Session(sid) = req.from {
            if let Some(session) = self.sessions.get(&sid).map(|e| e.value().clone()) {
                let _ = session.send(message).await;
            }
        }
    }

    // ── Retry machinery ──────────────────────────────────────────────────

    /// Send (or re-send) a pending request to a random subscribed peer not
    /// yet excluded. Exhaustion answers the origin with
    /// REMOTE_PEER_UNAVAILABLE.
    async fn try_next_node(&self, seq: &str) {
        let attempt = {
            let mut pending = self.pending.lock();
            let Some(req) = pending.get_mut(seq) else { return };
            let mesh = self.mesh.read().clone();
            let candidates: Vec<NodeId> = mesh
                .as_ref()
                .map(|m| m.peers_by_topic(&req.topic))
                .unwrap_or_default()
                .into_iter()
                .filter(|n| !req.failed_nodes.contains(n))
                .collect();
            match self.pick(candidates) {
                Some(node) => {
                    req.to_node = Some(node);
                    Some((node, req.message.clone()))
                }
                None => None,
            }
        };

        match attempt {
            Some((node, message)) => {
                tracing::debug!(seq, node = %node.abridged(), "topic request routed to peer");
                let sent = match (self.mesh(), message.encode()) {
                    (Some(mesh), Ok(frame)) => mesh.send_channel_data(node, frame).await,
                    (None, _) => Err(NetError::NotReady),
                    (_, Err(e)) => Err(e.into()),
                };
                if let Err(e) = sent {
                    tracing::debug!(seq, node = %node.abridged(), error = %e, "peer send failed, excluding");
                    {
                        let mut pending = self.pending.lock();
                        if let Some(req) = pending.get_mut(seq) {
                            req.failed_nodes.insert(node);
                        }
                    }
                    Box::pin(self.try_next_node(seq)).await;
                }
            }
            None => {
                tracing::warn!(seq, "no peer left for topic request");
                self.fail_pending(seq, result_code::REMOTE_PEER_UNAVAILABLE).await;
            }
        }
    }

    /// Send (or re-send) a pending request to a random subscribed local
    /// session not yet excluded. Exhaustion answers the origin with
    /// REMOTE_CLIENT_PEER_UNAVAILABLE.
    async fn try_next_session(&self, seq: &str) {
        let attempt = {
            let mut pending = self.pending.lock();
            let Some(req) = pending.get_mut(seq) else { return };
            let candidates: Vec<Arc<crate::server::ChannelSession>> = self
                .sessions
                .iter()
                .filter(|e| {
                    e.value().is_active()
                        && e.value().subscribes(&req.topic)
                        && !req.failed_sessions.contains(&e.value().id())
                })
                .map(|e| e.value().clone())
                .collect();
            match self.pick(candidates) {
                Some(session) => {
                    req.to_session = Some(session.id());
                    Some((session, req.message.clone()))
                }
                None => None,
            }
        };

        match attempt {
            Some((session, message)) => {
                tracing::debug!(seq, session = session.id(), "topic request pushed to sdk session");
                if session.send(message).await.is_err() {
                    {
                        let mut pending = self.pending.lock();
                        if let Some(req) = pending.get_mut(seq) {
                            req.failed_sessions.insert(session.id());
                        }
                    }
                    Box::pin(self.try_next_session(seq)).await;
                }
            }
            None => {
                tracing::warn!(seq, "no sdk session left for topic request");
                self.fail_pending(seq, result_code::REMOTE_CLIENT_PEER_UNAVAILABLE)
                    .await;
            }
        }
    }

    /// Close a pending request with an unavailable result to its origin.
    async fn fail_pending(&self, seq: &str, code: u32) {
        let req = self.pending.lock().remove(seq);
        let Some(req) = req else { return };

        let mut reply = req.message.clone();
        reply.typ = msg_type::TOPIC_RESPONSE;
        reply.result = code;
        reply.data = Bytes::new();

        match req.from {
            Origin::Session(sid) => {
                if let Some(session) = self.sessions.get(&sid).map(|e| e.value().clone()) {
                    let _ = session.send(reply).await;
                }
            }
            Origin::Node(node) => {
                if let (Some(mesh), Ok(frame)) = (self.mesh(), reply.encode()) {
                    let _ = mesh.send_channel_data(node, frame).await;
                }
            }
        }
    }

    fn pick<T: Clone>(&self, candidates: Vec<T>) -> Option<T> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..candidates.len());
        Some(candidates[index].clone())
    }

    // ── Local push ───────────────────────────────────────────────────────

    /// Push a topic message to one random subscribed SDK session, for
    /// node-local publishers.
    pub async fn push_channel_message(
        &self,
        topic: &str,
        message: ChannelMessage,
    ) -> Result<(), NetError> {
        let candidates: Vec<Arc<crate::server::ChannelSession>> = self
            .sessions
            .iter()
            .filter(|e| e.value().is_active() && e.value().subscribes(topic))
            .map(|e| e.value().clone())
            .collect();
        let Some(session) = self.pick(candidates) else {
            return Err(NetError::RoutingUnavailable {
                topic: topic.to_string(),
                code: result_code::NO_SESSION_ON_TOPIC,
            });
        };
        session.send(message).await
    }

    // ── Expiry ───────────────────────────────────────────────────────────

    /// Sweep the pending table once a second; requests past
    /// [`REQUEST_TIMEOUT`] are answered unavailable.
    pub async fn expiry_task(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }
            let expired: Vec<(String, Origin)> = {
                let pending = self.pending.lock();
                pending
                    .iter()
                    .filter(|(_, req)| req.created_at.elapsed() > REQUEST_TIMEOUT)
                    .map(|(seq, req)| (seq.clone(), req.from))
                    .collect()
            };
            for (seq, from) in expired {
                tracing::warn!(seq = %seq, "topic request timed out");
                let code = match from {
                    Origin::Session(_) => result_code::REMOTE_PEER_UNAVAILABLE,
                    Origin::Node(_) => result_code::REMOTE_CLIENT_PEER_UNAVAILABLE,
                };
                self.fail_pending(&seq, code).await;
            }
        }
    }
}

// ── Overlay sink ──────────────────────────────────────────────────────────────

#[async_trait]
impl ChannelMessageSink for ChannelRouter {
    /// A channel frame arrived over the overlay from `from`.
    async fn on_node_channel_message(&self, from: NodeId, frame: Bytes) {
        let mut buf = bytes::BytesMut::from(&frame[..]);
        let message = match ChannelMessage::decode(&mut buf) {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::warn!(from = %from.abridged(), len = frame.len(), "truncated node channel frame");
                return;
            }
            Err(e) => {
                tracing::warn!(from = %from.abridged(), error = %e, "bad node channel frame");
                return;
            }
        };
        tracing::debug!(
            from = %from.abridged(),
            typ = format_args!("0x{:02x}", message.typ),
            seq = %message.seq,
            "node channel message"
        );
        match message.typ {
            msg_type::NODE_MESSAGE | msg_type::NODE_RESPONSE => {
                self.on_node_message(from, message).await
            }
            msg_type::TOPIC_REQUEST => self.on_node_topic_request(from, message).await,
            msg_type::TOPIC_RESPONSE => self.on_node_topic_response(from, message).await,
            other => {
                tracing::debug!(from = %from.abridged(), typ = other, "ignored node channel type")
            }
        }
    }
}

// ── Topic header ──────────────────────────────────────────────────────────────

/// Parse the length-prefixed topic of a 0x30/0x31 payload: the first byte
/// is `topic_len`, followed by `topic_len - 1` bytes of topic name.
fn parse_topic(data: &[u8]) -> Result<String, NetError> {
    let Some(&len) = data.first() else {
        return Err(NetError::Protocol("empty topic message".into()));
    };
    let len = len as usize;
    if len < 1 || data.len() < len {
        return Err(NetError::Protocol("truncated topic header".into()));
    }
    std::str::from_utf8(&data[1..len])
        .map(str::to_owned)
        .map_err(|_| NetError::Protocol("topic is not utf-8".into()))
}

/// Build a 0x30/0x31 payload from a topic and body.
pub fn encode_topic_payload(topic: &str, body: &[u8]) -> Bytes {
    let mut out = bytes::BytesMut::with_capacity(1 + topic.len() + body.len());
    use bytes::BufMut;
    out.put_u8((topic.len() + 1) as u8);
    out.put_slice(topic.as_bytes());
    out.put_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_header_round_trip() {
        let payload = encode_topic_payload("orders", b"body");
        assert_eq!(parse_topic(&payload).unwrap(), "orders");
        assert_eq!(&payload[7..], b"body");
    }

    #[test]
    fn truncated_topic_is_rejected() {
        assert!(parse_topic(&[]).is_err());
        assert!(parse_topic(&[0]).is_err());
        assert!(parse_topic(&[10, b'a', b'b']).is_err());
    }

    #[test]
    fn new_seq_is_32_hex_chars() {
        let seq = ChannelRouter::new_seq();
        assert_eq!(seq.len(), 32);
        assert!(seq.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
