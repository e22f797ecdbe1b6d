//! mesh-net — the mutually-authenticated TLS peer overlay.
//!
//! The [`host::PeerHost`] owns the acceptor, the peer and session maps,
//! and the keep-alive / reconnect / announcement control loop. Sessions
//! and capabilities hold only non-owning references back to it.

pub mod capability;
pub mod framed;
pub mod handshake;
pub mod host;
pub mod session;
pub mod tls;
pub mod verifier;

pub use capability::{Capability, CapabilityRegistry};
pub use host::PeerHost;
pub use session::{Peer, PeerSession, SessionInfo, SessionState};
