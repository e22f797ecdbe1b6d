//! Error taxonomy shared across the networking crates.

use crate::wire::{DisconnectReason, WireError};

/// Errors surfaced by the overlay and the channel layer.
///
/// These stay inside the async callbacks that produce them: a failure is
/// logged with remote-endpoint context at the callback boundary and the
/// affected session is closed; nothing propagates into the reactor.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Socket read/write, connect, or TLS handshake failure.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// The application handshake completed but the peer was rejected.
    #[error("handshake rejected: {0}")]
    HandshakeReject(DisconnectReason),

    /// Malformed frame, truncated topic header, or a wire-format violation.
    #[error("protocol: {0}")]
    Protocol(String),

    /// No peer or session remained for a topic after retries.
    #[error("no route for topic {topic:?} (result {code})")]
    RoutingUnavailable { topic: String, code: u32 },

    /// No active session exists for the addressed node.
    #[error("no active session for node {0}")]
    NodeUnreachable(String),

    /// The peer certificate's serial is on the revocation list.
    #[error("certificate revoked (serial {0})")]
    CertRevoked(String),

    /// The peer certificate is outside its validity window.
    #[error("certificate expired")]
    CertExpired,

    /// The operation was cut short by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// The host is not running; callers that cannot wait get this
    /// instead of blocking on startup.
    #[error("host is not running")]
    NotReady,
}

impl From<WireError> for NetError {
    fn from(e: WireError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl NetError {
    /// True when the error should close the underlying socket.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::HandshakeReject(_)
                | Self::Protocol(_)
                | Self::CertRevoked(_)
                | Self::CertExpired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let e = NetError::RoutingUnavailable {
            topic: "orders".into(),
            code: 100,
        };
        assert_eq!(e.to_string(), "no route for topic \"orders\" (result 100)");

        let e = NetError::HandshakeReject(DisconnectReason::DuplicatePeer);
        assert!(e.to_string().contains("duplicate peer"));
    }

    #[test]
    fn fatality_split() {
        assert!(NetError::CertExpired.is_fatal_to_connection());
        assert!(!NetError::NotReady.is_fatal_to_connection());
        assert!(!NetError::Cancelled.is_fatal_to_connection());
    }
}
