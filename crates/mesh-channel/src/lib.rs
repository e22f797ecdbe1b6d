//! mesh-channel — the TLS channel for external SDK clients.
//!
//! The [`server::ChannelServer`] accepts SDK connections; the
//! [`router::ChannelRouter`] owns the client sessions, correlates request
//! sequence numbers, and routes topic messages between local sessions and
//! remote peers with retry-with-exclusion.

pub mod router;
pub mod server;

pub use router::ChannelRouter;
pub use server::{ChannelServer, ChannelSession};
