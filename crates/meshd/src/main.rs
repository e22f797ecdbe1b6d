//! meshd — permissioned-chain mesh node daemon.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use bytes::Bytes;

use mesh_channel::{ChannelRouter, ChannelServer};
use mesh_core::config::MeshConfig;
use mesh_core::wire::CapabilityDesc;
use mesh_core::NodeId;
use mesh_net::capability::{Capability, CapabilityRegistry};
use mesh_net::session::PeerSession;
use mesh_net::tls::{channel_server_config, PeerTlsContext, TlsMaterial};
use mesh_net::verifier::CertPolicy;
use mesh_net::PeerHost;

mod conn_manager;
mod rpc;

use conn_manager::FileNodeConnManager;
use rpc::UnimplementedRpc;

/// The channel overlay surface announced to peers. Channel frames ride
/// the base protocol; the capability exists so negotiation has something
/// to agree on and logs show when a peer activates it.
struct AmopCapability;

impl Capability for AmopCapability {
    fn descriptor(&self) -> CapabilityDesc {
        CapabilityDesc::new("amop", 1)
    }

    fn message_count(&self) -> u8 {
        1
    }

    fn new_peer(
        &self,
        _session: Weak<PeerSession>,
        _cap: &CapabilityDesc,
        _offset: u8,
        _subproto_id: u8,
    ) {
        tracing::debug!("amop active on new peer session");
    }

    fn on_message(&self, from: NodeId, packet_id: u8, _payload: Bytes) {
        tracing::debug!(from = %from.abridged(), packet_id, "unexpected amop packet");
    }
}

/// The node id is the public key baked into the node certificate.
fn node_id_from_cert(cert_der: &[u8]) -> Result<NodeId> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| anyhow::anyhow!("cannot parse server.crt: {e}"))?;
    let spki = &cert.tbs_certificate.subject_pki.subject_public_key.data;

    // An uncompressed EC point is 0x04 followed by the 64-byte key.
    if spki.len() == 65 && spki[0] == 0x04 {
        return Ok(NodeId::from_slice(&spki[1..])?);
    }

    // Other key shapes still need a stable 64-byte identity.
    let first = alloy_primitives::keccak256(spki.as_ref());
    let second = alloy_primitives::keccak256(first.as_slice());
    let mut id = [0u8; 64];
    id[..32].copy_from_slice(first.as_slice());
    id[32..].copy_from_slice(second.as_slice());
    Ok(NodeId::from_slice(&id)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = MeshConfig::write_default_if_missing().context("writing default config")?;
    let config = MeshConfig::load().context("loading config")?;
    tracing::info!(config = %config_path.display(), "meshd starting");

    let data_dir = config.network.data_dir.clone();
    let material =
        TlsMaterial::load_from_dir(&data_dir).context("loading TLS material from data dir")?;
    let node_id = node_id_from_cert(material.chain[0].as_ref())?;
    tracing::info!(id = %node_id.abridged(), "node identity ready");

    let manager = Arc::new(FileNodeConnManager::load(&data_dir)?);
    let policy = Arc::new(CertPolicy::new(manager.clone()));
    let peer_tls = PeerTlsContext::build(&material, policy).context("building peer TLS")?;
    let channel_tls = channel_server_config(&material, config.network.ssl_mode)
        .context("building channel TLS")?;

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(AmopCapability));

    let host = PeerHost::new(
        config.network.clone(),
        node_id,
        manager.clone(),
        peer_tls,
        registry,
    );
    let router = ChannelRouter::new(Arc::new(UnimplementedRpc));
    host.set_channel_sink(router.clone());
    router.set_mesh(host.clone());

    let channel = ChannelServer::new(config.channel.clone(), channel_tls, router);

    host.start().await.context("starting peer host")?;
    channel.start().await.context("starting channel server")?;
    tracing::info!(
        peer_port = host.listen_port(),
        channel_port = channel.listen_port(),
        "meshd running"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    channel.stop().await;
    host.stop().await;
    Ok(())
}
