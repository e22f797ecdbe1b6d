//! TLS contexts for the two acceptors and the peer dialer.
//!
//! Material is read from the data directory: `ca.crt` (trust root),
//! `server.crt` (this node's chain), `server.key`. The peer contexts
//! require mutual authentication with the overlay's verifier policy;
//! the SDK channel context is server-authenticated only.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use mesh_core::config::SslMode;
use mesh_core::NetError;

use crate::verifier::{CertPolicy, PeerClientCertVerifier, PeerServerCertVerifier};

/// PEM material loaded from the data directory.
pub struct TlsMaterial {
    pub ca: Vec<CertificateDer<'static>>,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Read `ca.crt`, `server.crt`, `server.key` from `data_dir`.
    pub fn load_from_dir(data_dir: &Path) -> Result<Self, NetError> {
        let ca = read_certs(&data_dir.join("ca.crt"))?;
        let chain = read_certs(&data_dir.join("server.crt"))?;
        let key = read_key(&data_dir.join("server.key"))?;
        if ca.is_empty() {
            return Err(NetError::Protocol("ca.crt contains no certificates".into()));
        }
        if chain.is_empty() {
            return Err(NetError::Protocol(
                "server.crt contains no certificates".into(),
            ));
        }
        Ok(Self { ca, chain, key })
    }

    fn root_store(&self) -> Result<RootCertStore, NetError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.ca {
            roots
                .add(cert.clone())
                .map_err(|e| NetError::Protocol(format!("invalid CA certificate: {e}")))?;
        }
        Ok(roots)
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetError> {
    let file = std::fs::File::open(path).map_err(NetError::Transport)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(NetError::Transport)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, NetError> {
    let file = std::fs::File::open(path).map_err(NetError::Transport)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(NetError::Transport)?
        .ok_or_else(|| NetError::Protocol("server.key contains no private key".into()))
}

/// Both directions of the peer overlay's mutually-authenticated TLS.
pub struct PeerTlsContext {
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

impl PeerTlsContext {
    pub fn build(material: &TlsMaterial, policy: Arc<CertPolicy>) -> Result<Self, NetError> {
        let roots = Arc::new(material.root_store()?);

        let webpki_client = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| NetError::Protocol(format!("client verifier: {e}")))?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(PeerClientCertVerifier::new(
                webpki_client,
                policy.clone(),
            )))
            .with_single_cert(material.chain.clone(), material.key.clone_key())
            .map_err(|e| NetError::Protocol(format!("server tls config: {e}")))?;

        let webpki_server = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| NetError::Protocol(format!("server verifier: {e}")))?;
        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerServerCertVerifier::new(
                webpki_server,
                policy,
            )))
            .with_client_auth_cert(material.chain.clone(), material.key.clone_key())
            .map_err(|e| NetError::Protocol(format!("client tls config: {e}")))?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}

/// The SDK channel acceptor's TLS. Server-authenticated; in `v2` mode the
/// key exchange is pinned to the prime256v1 curve.
pub fn channel_server_config(
    material: &TlsMaterial,
    mode: SslMode,
) -> Result<Arc<ServerConfig>, NetError> {
    let builder = match mode {
        SslMode::V2 => {
            let mut provider = rustls::crypto::ring::default_provider();
            provider.kx_groups = vec![rustls::crypto::ring::kx_group::SECP256R1];
            ServerConfig::builder_with_provider(Arc::new(provider))
                .with_safe_default_protocol_versions()
                .map_err(|e| NetError::Protocol(format!("channel tls provider: {e}")))?
        }
        SslMode::Default => ServerConfig::builder(),
    };

    let config = builder
        .with_no_client_auth()
        .with_single_cert(material.chain.clone(), material.key.clone_key())
        .map_err(|e| NetError::Protocol(format!("channel tls config: {e}")))?;

    Ok(Arc::new(config))
}
