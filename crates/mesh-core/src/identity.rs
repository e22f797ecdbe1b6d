//! Node identity — the 512-bit public key that names a peer on the overlay.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::B512;
use alloy_rlp::{Decodable, Encodable};

use crate::error::NetError;

/// A node's identity: its 512-bit public key. Equality is byte equality.
///
/// The key is opaque to the networking layer — it is never used for
/// signing here, only as the stable name a session is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub B512);

impl NodeId {
    pub const LEN: usize = 64;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() != Self::LEN {
            return Err(NetError::Protocol(format!(
                "node id must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(Self(B512::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Abbreviated display form: first four bytes as hex plus an ellipsis.
    /// Used in logs where the full 128-char hex would drown the line.
    pub fn abridged(&self) -> String {
        format!("{}…", hex::encode(&self.0[..4]))
    }

    /// Full lowercase hex, no prefix. The form `disconnect_by_node_id`
    /// and the wire-level 0x20 destination field use.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = NetError;

    /// Parse 128 hex chars, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)
            .map_err(|e| NetError::Protocol(format!("invalid node id hex: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl From<B512> for NodeId {
    fn from(v: B512) -> Self {
        Self(v)
    }
}

impl Encodable for NodeId {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for NodeId {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(B512::decode(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abridged_is_short() {
        let id = NodeId(B512::repeat_byte(0xab));
        assert_eq!(id.abridged(), "abababab…");
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId(B512::repeat_byte(0x1f));
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);

        let prefixed: NodeId = format!("0x{}", id.to_hex()).parse().unwrap();
        assert_eq!(prefixed, id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(NodeId::from_slice(&[0u8; 63]).is_err());
        assert!("abcd".parse::<NodeId>().is_err());
    }

    #[test]
    fn equality_is_byte_equality() {
        let a = NodeId(B512::repeat_byte(1));
        let b = NodeId(B512::repeat_byte(1));
        let c = NodeId(B512::repeat_byte(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
