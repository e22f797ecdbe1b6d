//! Mesh wire formats — on-wire types for peer and channel communication.
//!
//! Two distinct framings share this module:
//!
//! * **Peer frames**: a u32 length prefix followed by a packet-id byte and
//!   an RLP payload, exchanged between nodes over mutually-authenticated
//!   TLS. The application handshake (`HelloMessage`) travels as the first
//!   frame of every connection.
//! * **Channel frames**: a 42-byte fixed header (`length`, `type`, 32-byte
//!   ascii `seq`, `result`, all network order) followed by an opaque
//!   payload, exchanged with SDK clients and tunneled between nodes.
//!
//! Every field and constant here is part of the protocol. Changing anything
//! after a release is a breaking change.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use alloy_rlp::{RlpDecodable, RlpEncodable};

use crate::identity::NodeId;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current peer protocol version. Remotes more than one version behind are
/// rejected with `IncompatibleProtocol`.
pub const PROTOCOL_VERSION: u32 = 5;

/// Lowest protocol version that supports framed sub-protocols. Sessions
/// negotiated below this use packet-id offsets starting at `USER_PACKET`.
pub const FRAMING_MIN_VERSION: u32 = 5;

/// First packet id available to capabilities in offset mode.
pub const USER_PACKET: u8 = 0x10;

/// Hard ceiling on a single peer frame, length prefix excluded.
pub const MAX_PEER_FRAME: usize = 16 * 1024 * 1024;

// ── Base protocol packets ─────────────────────────────────────────────────────

/// Packet ids of the base peer protocol. Capabilities live at or above
/// `USER_PACKET` (offset mode) or behind a sub-protocol id (framed mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BasePacket {
    Hello = 0x00,
    Disconnect = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    /// Periodic digest of the sender's peer set plus a peer sample.
    Announcement = 0x04,
    /// The sender's channel topic set, with a monotonically increasing seq.
    TopicUpdate = 0x05,
    /// An encoded channel frame tunneled node-to-node.
    ChannelData = 0x06,
}

impl TryFrom<u8> for BasePacket {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Hello),
            0x01 => Ok(Self::Disconnect),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Pong),
            0x04 => Ok(Self::Announcement),
            0x05 => Ok(Self::TopicUpdate),
            0x06 => Ok(Self::ChannelData),
            other => Err(WireError::UnknownPacket(other)),
        }
    }
}

// ── Disconnect reasons ────────────────────────────────────────────────────────

/// Why a session was (or is being) torn down. Sent as the single-byte
/// payload of a `Disconnect` frame before the socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// The local node is shutting down.
    ClientQuit = 0x00,
    /// The remote presented our own identity.
    LocalIdentity = 0x01,
    IncompatibleProtocol = 0x02,
    /// No capability overlap after negotiation.
    UselessPeer = 0x03,
    /// Pinned mode and the remote is not on the required list.
    UnexpectedIdentity = 0x04,
    /// A live session already exists for this node id.
    DuplicatePeer = 0x05,
    TooManyPeers = 0x06,
    PingTimeout = 0x07,
    /// Operator-requested disconnect.
    UserReason = 0x08,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientQuit => "client quit",
            Self::LocalIdentity => "connected to self",
            Self::IncompatibleProtocol => "incompatible protocol",
            Self::UselessPeer => "no useful capabilities",
            Self::UnexpectedIdentity => "unexpected identity",
            Self::DuplicatePeer => "duplicate peer",
            Self::TooManyPeers => "too many peers",
            Self::PingTimeout => "ping timeout",
            Self::UserReason => "requested by user",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for DisconnectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::ClientQuit),
            0x01 => Ok(Self::LocalIdentity),
            0x02 => Ok(Self::IncompatibleProtocol),
            0x03 => Ok(Self::UselessPeer),
            0x04 => Ok(Self::UnexpectedIdentity),
            0x05 => Ok(Self::DuplicatePeer),
            0x06 => Ok(Self::TooManyPeers),
            0x07 => Ok(Self::PingTimeout),
            0x08 => Ok(Self::UserReason),
            other => Err(WireError::UnknownDisconnectReason(other)),
        }
    }
}

// ── Application handshake ─────────────────────────────────────────────────────

/// A capability a node offers: a short name and a version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, RlpEncodable, RlpDecodable)]
pub struct CapabilityDesc {
    pub name: String,
    pub version: u32,
}

impl CapabilityDesc {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for CapabilityDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// The post-TLS application handshake, sent by both sides as the first
/// peer frame. A single RLP list:
/// `[protocol_version, client_banner, capabilities, listen_port, node_id]`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub client_banner: String,
    pub capabilities: Vec<CapabilityDesc>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

// ── Announcement & topic update ───────────────────────────────────────────────

/// A peer entry carried inside an `Announcement` frame.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct AnnouncedNode {
    pub id: NodeId,
    /// Textual address — the announcement is informational and the
    /// receiver never dials from it directly.
    pub address: String,
    pub tcp_port: u16,
    pub udp_port: u16,
}

/// Order-independent digest of the sender's peer set plus a random sample
/// of at most [`MAX_ANNOUNCEMENT_NODES`] peers.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Announcement {
    pub digest: alloy_primitives::B256,
    pub nodes: Vec<AnnouncedNode>,
}

/// Cap on the peer sample inside an announcement.
pub const MAX_ANNOUNCEMENT_NODES: usize = 100;

/// The sender's channel topic set. Receivers keep the set from the
/// highest seq seen.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TopicUpdate {
    pub seq: u64,
    pub topics: Vec<String>,
}

// ── Channel frame ─────────────────────────────────────────────────────────────

/// Channel message types. SDK-facing unless noted.
pub mod msg_type {
    /// RPC request body, forwarded to the local dispatcher.
    pub const RPC_REQUEST: u16 = 0x12;
    /// Heartbeat: "0" asks, "1" answers.
    pub const HEARTBEAT: u16 = 0x13;
    /// Message to a specific remote node; first 128 bytes are the hex id.
    pub const NODE_MESSAGE: u16 = 0x20;
    /// Response to `NODE_MESSAGE`.
    pub const NODE_RESPONSE: u16 = 0x21;
    /// Topic-routed request; payload starts with a length-prefixed topic.
    pub const TOPIC_REQUEST: u16 = 0x30;
    /// Response to `TOPIC_REQUEST`.
    pub const TOPIC_RESPONSE: u16 = 0x31;
    /// Topic subscription update; payload is a JSON array of strings.
    pub const TOPIC_SUBSCRIBE: u16 = 0x32;
}

/// Channel result codes.
pub mod result_code {
    pub const SUCCESS: u32 = 0;
    /// No remote peer reachable for the request (exhausted retries).
    pub const REMOTE_PEER_UNAVAILABLE: u32 = 100;
    /// No SDK client reachable on the remote side (exhausted retries).
    pub const REMOTE_CLIENT_PEER_UNAVAILABLE: u32 = 101;
    /// No peer subscribes to the topic at all.
    pub const NO_PEER_ON_TOPIC: u32 = 103;
    /// No local session subscribes to the topic at all.
    pub const NO_SESSION_ON_TOPIC: u32 = 104;
}

/// Size of the fixed channel header: length(4) + type(2) + seq(32) + result(4).
pub const CHANNEL_HEADER_LEN: usize = 42;

/// Length of the ascii seq field: a uuid rendered as 32 hex chars.
pub const SEQ_LEN: usize = 32;

/// Hard ceiling on a channel frame, header included.
pub const MAX_CHANNEL_FRAME: usize = 32 * 1024 * 1024;

/// One framed channel message. The header's `length` field covers the
/// header itself plus the payload, so the header is also the framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub typ: u16,
    /// Opaque ascii request id, exactly [`SEQ_LEN`] bytes. Routing never
    /// parses its structure.
    pub seq: String,
    pub result: u32,
    pub data: Bytes,
}

impl ChannelMessage {
    pub fn new(typ: u16, seq: impl Into<String>, result: u32, data: impl Into<Bytes>) -> Self {
        Self {
            typ,
            seq: seq.into(),
            result,
            data: data.into(),
        }
    }

    /// Total encoded size, header included.
    pub fn length(&self) -> usize {
        CHANNEL_HEADER_LEN + self.data.len()
    }

    /// Encode to wire bytes. Fails when the seq is not exactly
    /// [`SEQ_LEN`] ascii bytes or the payload exceeds the frame ceiling.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.seq.len() != SEQ_LEN || !self.seq.is_ascii() {
            return Err(WireError::BadSeq(self.seq.len()));
        }
        let total = self.length();
        if total > MAX_CHANNEL_FRAME {
            return Err(WireError::FrameTooLarge(total));
        }
        let mut out = BytesMut::with_capacity(total);
        out.put_u32(total as u32);
        out.put_u16(self.typ);
        out.put_slice(self.seq.as_bytes());
        out.put_u32(self.result);
        out.put_slice(&self.data);
        Ok(out.freeze())
    }

    /// Try to decode one message from the front of `buf`, consuming it on
    /// success. Returns `Ok(None)` when more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, WireError> {
        if buf.len() < CHANNEL_HEADER_LEN {
            return Ok(None);
        }
        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total < CHANNEL_HEADER_LEN {
            return Err(WireError::BadLength(total));
        }
        if total > MAX_CHANNEL_FRAME {
            return Err(WireError::FrameTooLarge(total));
        }
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        frame.advance(4);
        let typ = frame.get_u16();
        let seq_bytes = frame.split_to(SEQ_LEN);
        let seq = std::str::from_utf8(&seq_bytes)
            .map_err(|_| WireError::BadSeq(SEQ_LEN))?
            .to_owned();
        let result = frame.get_u32();
        let data = frame.freeze();

        Ok(Some(Self {
            typ,
            seq,
            result,
            data,
        }))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown base packet id: 0x{0:02x}")]
    UnknownPacket(u8),

    #[error("unknown disconnect reason: 0x{0:02x}")]
    UnknownDisconnectReason(u8),

    #[error("channel frame length {0} is shorter than the header")]
    BadLength(usize),

    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    #[error("seq must be {SEQ_LEN} ascii bytes, got {0}")]
    BadSeq(usize),

    #[error("rlp: {0}")]
    Rlp(String),
}

impl From<alloy_rlp::Error> for WireError {
    fn from(e: alloy_rlp::Error) -> Self {
        Self::Rlp(e.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B512;
    use alloy_rlp::{Decodable, Encodable};

    fn seq(fill: char) -> String {
        std::iter::repeat(fill).take(SEQ_LEN).collect()
    }

    #[test]
    fn channel_frame_round_trip() {
        let original = ChannelMessage::new(
            msg_type::TOPIC_REQUEST,
            seq('a'),
            0,
            Bytes::from_static(b"\x06topicpayload"),
        );

        let encoded = original.encode().unwrap();
        assert_eq!(encoded.len(), CHANNEL_HEADER_LEN + 13);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = ChannelMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn channel_decode_waits_for_full_frame() {
        let msg = ChannelMessage::new(msg_type::HEARTBEAT, seq('0'), 0, Bytes::from_static(b"0"));
        let encoded = msg.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..CHANNEL_HEADER_LEN - 1]);
        assert_eq!(ChannelMessage::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[CHANNEL_HEADER_LEN - 1..encoded.len() - 1]);
        assert_eq!(ChannelMessage::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(ChannelMessage::decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn channel_decode_two_back_to_back() {
        let a = ChannelMessage::new(msg_type::HEARTBEAT, seq('0'), 0, Bytes::from_static(b"0"));
        let b = ChannelMessage::new(msg_type::HEARTBEAT, seq('1'), 0, Bytes::from_static(b"1"));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode().unwrap());
        buf.extend_from_slice(&b.encode().unwrap());

        assert_eq!(ChannelMessage::decode(&mut buf).unwrap(), Some(a));
        assert_eq!(ChannelMessage::decode(&mut buf).unwrap(), Some(b));
        assert_eq!(ChannelMessage::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn channel_decode_rejects_undersized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(10); // < CHANNEL_HEADER_LEN
        buf.put_slice(&[0u8; 60]);
        assert!(matches!(
            ChannelMessage::decode(&mut buf),
            Err(WireError::BadLength(10))
        ));
    }

    #[test]
    fn channel_encode_rejects_bad_seq() {
        let msg = ChannelMessage::new(msg_type::HEARTBEAT, "short", 0, Bytes::new());
        assert!(matches!(msg.encode(), Err(WireError::BadSeq(5))));
    }

    #[test]
    fn hello_rlp_round_trip() {
        let hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            client_banner: "meshd/0.3.0".into(),
            capabilities: vec![
                CapabilityDesc::new("eth", 62),
                CapabilityDesc::new("amop", 1),
            ],
            listen_port: 30300,
            node_id: NodeId(B512::repeat_byte(0x42)),
        };

        let mut out = Vec::new();
        hello.encode(&mut out);
        let decoded = HelloMessage::decode(&mut out.as_slice()).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn disconnect_reason_codes_round_trip() {
        for code in 0x00..=0x08u8 {
            let reason = DisconnectReason::try_from(code).unwrap();
            assert_eq!(reason as u8, code);
        }
        assert!(DisconnectReason::try_from(0x09).is_err());
    }

    #[test]
    fn topic_update_rlp_round_trip() {
        let update = TopicUpdate {
            seq: 7,
            topics: vec!["t1".into(), "t2".into()],
        };
        let mut out = Vec::new();
        update.encode(&mut out);
        assert_eq!(TopicUpdate::decode(&mut out.as_slice()).unwrap(), update);
    }
}
