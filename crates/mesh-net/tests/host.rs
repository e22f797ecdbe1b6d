//! Host integration tests: admission rules, self-connect rejection, and a
//! real mutually-authenticated TLS pair over loopback.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;

use alloy_primitives::B512;
use bytes::Bytes;

use mesh_core::config::NetworkConfig;
use mesh_core::interfaces::NodeConnManager;
use mesh_core::wire::{CapabilityDesc, DisconnectReason, HelloMessage, PROTOCOL_VERSION};
use mesh_core::{Endpoint, NetError, NodeId};
use mesh_net::capability::{Capability, CapabilityRegistry};
use mesh_net::framed::FramedSocket;
use mesh_net::host::PeerHost;
use mesh_net::session::PeerSession;
use mesh_net::tls::{PeerTlsContext, TlsMaterial};
use mesh_net::verifier::CertPolicy;

// ── Fixtures ──────────────────────────────────────────────────────────────────

struct EmptyManager;

impl NodeConnManager for EmptyManager {
    fn get_all_connect(&self) -> BTreeMap<String, Endpoint> {
        BTreeMap::new()
    }
    fn update_all_connect(&self, _merged: BTreeMap<String, Endpoint>) {}
    fn check_cert_out(&self, _serial: &str) -> bool {
        false
    }
}

struct EchoCap;

impl Capability for EchoCap {
    fn descriptor(&self) -> CapabilityDesc {
        CapabilityDesc::new("echo", 1)
    }
    fn message_count(&self) -> u8 {
        2
    }
    fn new_peer(
        &self,
        _session: Weak<PeerSession>,
        _cap: &CapabilityDesc,
        _offset: u8,
        _subproto_id: u8,
    ) {
    }
    fn on_message(&self, _from: NodeId, _packet_id: u8, _payload: Bytes) {}
}

/// Write a shared CA plus one leaf per node into a temp dir per node.
fn write_two_node_material(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(vec![]).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut dirs = Vec::new();
    for node in ["a", "b"] {
        let dir = std::env::temp_dir().join(format!(
            "mesh-host-{tag}-{node}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec![format!("node-{node}")]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        std::fs::write(dir.join("ca.crt"), ca_cert.pem()).unwrap();
        std::fs::write(dir.join("server.crt"), leaf.pem()).unwrap();
        std::fs::write(dir.join("server.key"), leaf_key.serialize_pem()).unwrap();
        dirs.push(dir);
    }
    (dirs.remove(0), dirs.remove(0))
}

fn build_host(node_id: u8, data_dir: &std::path::Path, pin_mode: bool) -> Arc<PeerHost> {
    build_host_with(node_id, data_dir, pin_mode, Arc::new(EmptyManager))
}

fn build_host_with(
    node_id: u8,
    data_dir: &std::path::Path,
    pin_mode: bool,
    manager: Arc<dyn NodeConnManager>,
) -> Arc<PeerHost> {
    let cfg = NetworkConfig {
        listen_ip: "127.0.0.1".into(),
        listen_port: 0,
        pin_mode,
        ideal_peer_count: 4,
        data_dir: data_dir.to_path_buf(),
        ..NetworkConfig::default()
    };
    let material = TlsMaterial::load_from_dir(data_dir).unwrap();
    let policy = Arc::new(CertPolicy::new(manager.clone()));
    let tls = PeerTlsContext::build(&material, policy).unwrap();

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(EchoCap));

    PeerHost::new(
        cfg,
        NodeId(B512::repeat_byte(node_id)),
        manager,
        tls,
        registry,
    )
}

fn hello_from(node_id: u8, listen_port: u16) -> HelloMessage {
    HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        client_banner: "meshd/test".into(),
        capabilities: vec![CapabilityDesc::new("echo", 1)],
        listen_port,
        node_id: NodeId(B512::repeat_byte(node_id)),
    }
}

fn fake_remote(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), port))
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Admission rules ───────────────────────────────────────────────────────────

#[tokio::test]
async fn evaluate_hello_runs_rules_in_order() {
    let (dir_a, _) = write_two_node_material("rules");
    let host = build_host(0x01, &dir_a, false);

    // Rule 1: our own identity.
    assert_eq!(
        host.evaluate_hello(&hello_from(0x01, 30300)),
        Err(DisconnectReason::LocalIdentity)
    );

    // Rule 2: more than one version behind.
    let mut stale = hello_from(0x02, 30300);
    stale.protocol_version = PROTOCOL_VERSION - 2;
    assert_eq!(
        host.evaluate_hello(&stale),
        Err(DisconnectReason::IncompatibleProtocol)
    );

    // One version behind is still acceptable.
    let mut previous = hello_from(0x02, 30300);
    previous.protocol_version = PROTOCOL_VERSION - 1;
    assert!(host.evaluate_hello(&previous).is_ok());

    // Rule 3: no capability overlap.
    let mut useless = hello_from(0x02, 30300);
    useless.capabilities = vec![CapabilityDesc::new("shh", 2)];
    assert_eq!(
        host.evaluate_hello(&useless),
        Err(DisconnectReason::UselessPeer)
    );

    let ok = host.evaluate_hello(&hello_from(0x02, 30300)).unwrap();
    assert_eq!(ok, vec![CapabilityDesc::new("echo", 1)]);
}

#[tokio::test]
async fn pinned_mode_requires_the_identity() {
    let (dir_a, _) = write_two_node_material("pin");
    let host = build_host(0x01, &dir_a, true);

    assert_eq!(
        host.evaluate_hello(&hello_from(0x02, 30300)),
        Err(DisconnectReason::UnexpectedIdentity)
    );

    // Hosts that are not running reject require_peer instead of blocking.
    let err = host
        .require_peer(
            NodeId(B512::repeat_byte(0x02)),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 30300),
        )
        .await;
    assert!(matches!(err, Err(NetError::NotReady)));
}

#[tokio::test]
async fn duplicate_peer_keeps_exactly_one_session() {
    let (dir_a, _) = write_two_node_material("dup");
    let host = build_host(0x01, &dir_a, false);

    // First handshake for node 0xAB registers.
    let (near_1, _far_1) = tokio::io::duplex(4096);
    let socket_1 = FramedSocket::new(near_1, fake_remote(41000));
    host.admit(socket_1, hello_from(0xab, 41001)).await.unwrap();
    assert_eq!(host.session_count(), 1);

    // A second completed handshake for the same id loses.
    let (near_2, mut far_2) = tokio::io::duplex(4096);
    let socket_2 = FramedSocket::new(near_2, fake_remote(42000));
    let result = host.admit(socket_2, hello_from(0xab, 42001)).await;
    assert!(matches!(
        result,
        Err(NetError::HandshakeReject(DisconnectReason::DuplicatePeer))
    ));
    assert_eq!(host.session_count(), 1, "exactly one session must remain");

    // The loser was told why: a framed Disconnect carrying DuplicatePeer.
    let mut far = FramedSocket::new(&mut far_2, fake_remote(42000));
    let frame = far.read_frame().await.unwrap();
    assert_eq!(&frame[..], &[0x00, 0x01, DisconnectReason::DuplicatePeer as u8]);
}

#[tokio::test]
async fn admission_registers_peer_by_endpoint_name() {
    let (dir_a, _) = write_two_node_material("register");
    let host = build_host(0x01, &dir_a, false);

    let (near, _far) = tokio::io::duplex(4096);
    host.admit(FramedSocket::new(near, fake_remote(41000)), hello_from(0x02, 30555))
        .await
        .unwrap();

    let infos = host.peer_session_info();
    // peer_session_info answers empty while stopped, so read the session
    // map directly.
    assert!(infos.is_empty());
    assert!(host.have_session(NodeId(B512::repeat_byte(0x02))));
    assert_eq!(host.session_count(), 1);
}

// ── Self-connect rejection ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_to_own_endpoint_is_ignored() {
    let (dir_a, _) = write_two_node_material("selfconn");
    let host = build_host(0x01, &dir_a, false);
    host.start().await.unwrap();

    let own = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host.listen_port());
    host.add_peer(own).await.unwrap();

    // No dial task was ever scheduled: nothing pending, no session.
    assert_eq!(host.pending_connections(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.session_count(), 0);

    host.stop().await;
}

// ── Real TLS pair ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tls_pair_establishes_mutual_sessions() {
    let (dir_a, dir_b) = write_two_node_material("pair");
    let host_a = build_host(0x0a, &dir_a, false);
    let host_b = build_host(0x0b, &dir_b, false);

    host_a.start().await.unwrap();
    host_b.start().await.unwrap();

    let b_endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host_b.listen_port());
    host_a.add_peer(b_endpoint).await.unwrap();

    wait_for("both sides to register a session", || {
        host_a.have_session(host_b.id()) && host_b.have_session(host_a.id())
    })
    .await;

    // The connect cycle finished: nothing pending on the dialer.
    wait_for("pending set to drain", || {
        host_a.pending_connections() == 0
    })
    .await;

    let infos = host_a.peer_session_info();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, host_b.id());
    assert_eq!(
        infos[0].capabilities,
        vec![CapabilityDesc::new("echo", 1)]
    );

    // Operator disconnect by hex id, but never for ourselves.
    assert!(!host_a.disconnect_by_node_id(&host_a.id().to_hex()).await);
    assert!(host_a.disconnect_by_node_id(&host_b.id().to_hex()).await);

    host_a.stop().await;
    host_b.stop().await;

    // stop() is idempotent.
    host_a.stop().await;
    assert_eq!(host_a.session_count(), 0);
}

/// The issuing-tier certificate in the presented chain is revoked: the
/// TLS handshake terminates before the application handshake, so no
/// session ever appears on either side.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revoked_issuing_cert_blocks_the_handshake() {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, SerialNumber};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(vec![]).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.serial_number = Some(SerialNumber::from_slice(&[0x1e, 0xad]));
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut dirs = Vec::new();
    for node in ["a", "b"] {
        let dir = std::env::temp_dir().join(format!(
            "mesh-host-revoked-{node}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec![format!("node-{node}")]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();
        std::fs::write(dir.join("ca.crt"), ca_cert.pem()).unwrap();
        // Nodes present their issuing certificate in the chain.
        std::fs::write(
            dir.join("server.crt"),
            format!("{}{}", leaf.pem(), ca_cert.pem()),
        )
        .unwrap();
        std::fs::write(dir.join("server.key"), leaf_key.serialize_pem()).unwrap();
        dirs.push(dir);
    }

    struct Revoking;
    impl NodeConnManager for Revoking {
        fn get_all_connect(&self) -> BTreeMap<String, Endpoint> {
            BTreeMap::new()
        }
        fn update_all_connect(&self, _merged: BTreeMap<String, Endpoint>) {}
        fn check_cert_out(&self, serial: &str) -> bool {
            serial == "1ead"
        }
    }

    let host_a = build_host(0x2a, &dirs[0], false);
    let host_b = build_host_with(0x2b, &dirs[1], false, Arc::new(Revoking));

    host_a.start().await.unwrap();
    host_b.start().await.unwrap();

    let b_endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host_b.listen_port());
    host_a.add_peer(b_endpoint).await.unwrap();

    // Give the dial time to fail; no session may exist anywhere.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(host_a.session_count(), 0);
    assert_eq!(host_b.session_count(), 0);
    wait_for("pending to clear after the failed dial", || {
        host_a.pending_connections() == 0
    })
    .await;

    host_a.stop().await;
    host_b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn topic_updates_propagate_between_hosts() {
    use mesh_core::interfaces::PeerMesh;

    let (dir_a, dir_b) = write_two_node_material("topics");
    let host_a = build_host(0x1a, &dir_a, false);
    let host_b = build_host(0x1b, &dir_b, false);

    host_a.start().await.unwrap();
    host_b.start().await.unwrap();

    let b_endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host_b.listen_port());
    host_a.add_peer(b_endpoint).await.unwrap();

    wait_for("sessions", || {
        host_a.have_session(host_b.id()) && host_b.have_session(host_a.id())
    })
    .await;

    // B publishes a topic; A learns it and can route by it.
    let topics: std::collections::HashSet<String> = ["orders".to_string()].into();
    host_b.update_local_topics(topics).await;

    wait_for("topic to reach A", || {
        host_a.peers_by_topic("orders") == vec![host_b.id()]
    })
    .await;
    assert!(host_a.peers_by_topic("other").is_empty());

    host_a.stop().await;
    host_b.stop().await;
}
