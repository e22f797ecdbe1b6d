//! Collaborator interfaces consumed by the networking crates.
//!
//! The node-connection manager, the RPC dispatcher, and the routing seams
//! between host and channel layer are traits so the daemon wires real
//! implementations and tests inject fakes.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::identity::NodeId;

/// The node-connection manager: supplies the authorized peer list and
/// tracks revoked certificate serials.
pub trait NodeConnManager: Send + Sync {
    /// Authorized peers, keyed by canonical endpoint name.
    fn get_all_connect(&self) -> BTreeMap<String, Endpoint>;

    /// Publish the merged live-plus-authorized set back to the manager.
    fn update_all_connect(&self, merged: BTreeMap<String, Endpoint>);

    /// True when the certificate serial has been revoked.
    fn check_cert_out(&self, serial: &str) -> bool;
}

/// The local JSON-RPC request dispatcher. The body is opaque to the
/// channel layer; the response is returned on the originating session
/// keyed by the request seq.
#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn dispatch(&self, body: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Receives channel frames that arrived from a remote node over the
/// overlay. Implemented by the channel router.
#[async_trait]
pub trait ChannelMessageSink: Send + Sync {
    async fn on_node_channel_message(&self, from: NodeId, frame: Bytes);
}

/// What the channel router needs from the peer overlay. Implemented by
/// the peer host.
#[async_trait]
pub trait PeerMesh: Send + Sync {
    /// Tunnel an encoded channel frame to a specific node.
    async fn send_channel_data(&self, node: NodeId, frame: Bytes) -> Result<(), NetError>;

    /// Nodes whose published topic set contains `topic`.
    fn peers_by_topic(&self, topic: &str) -> Vec<NodeId>;

    /// Publish the union of all local SDK subscriptions to the overlay.
    async fn update_local_topics(&self, topics: HashSet<String>);
}
