//! Post-TLS application handshake.
//!
//! Both sides write their `HelloMessage` as the first frame and read the
//! peer's, under a timeout. Admission policy (version, capabilities,
//! duplicates, slots) is the host's job — see `host::PeerHost::admit`.

use std::time::Duration;

use alloy_rlp::{Decodable, Encodable};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use mesh_core::wire::HelloMessage;
use mesh_core::NetError;

use crate::framed::FramedSocket;

/// Incomplete handshakes are abandoned after this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Exchange hellos on a fresh TLS connection. Returns the socket (ready
/// to split into session halves) and the remote's hello.
pub async fn exchange_hello<S>(
    mut socket: FramedSocket<S>,
    ours: &HelloMessage,
) -> Result<(FramedSocket<S>, HelloMessage), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut encoded = Vec::new();
    ours.encode(&mut encoded);

    let remote = socket.remote();
    timeout(HANDSHAKE_TIMEOUT, socket.write_frame(&encoded))
        .await
        .map_err(|_| {
            tracing::debug!(%remote, "hello write timed out");
            NetError::Cancelled
        })??;

    let frame = timeout(HANDSHAKE_TIMEOUT, socket.read_frame())
        .await
        .map_err(|_| {
            tracing::debug!(%remote, "hello read timed out");
            NetError::Cancelled
        })??;

    let theirs = HelloMessage::decode(&mut frame.as_ref())
        .map_err(|e| NetError::Protocol(format!("malformed hello: {e}")))?;

    tracing::debug!(
        %remote,
        peer = %theirs.node_id.abridged(),
        version = theirs.protocol_version,
        banner = %theirs.client_banner,
        caps = theirs.capabilities.len(),
        "hello exchanged"
    );

    Ok((socket, theirs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B512;
    use mesh_core::wire::{CapabilityDesc, PROTOCOL_VERSION};
    use mesh_core::NodeId;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9))
    }

    fn hello(fill: u8, port: u16) -> HelloMessage {
        HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            client_banner: "meshd/test".into(),
            capabilities: vec![CapabilityDesc::new("amop", 1)],
            listen_port: port,
            node_id: NodeId(B512::repeat_byte(fill)),
        }
    }

    #[tokio::test]
    async fn symmetric_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let left = FramedSocket::new(a, addr());
        let right = FramedSocket::new(b, addr());

        let ha = hello(0x01, 30301);
        let hb = hello(0x02, 30302);

        let (left_done, right_done) = tokio::join!(
            exchange_hello(left, &ha),
            exchange_hello(right, &hb),
        );

        let (_, got_on_left) = left_done.unwrap();
        let (_, got_on_right) = right_done.unwrap();
        assert_eq!(got_on_left, hb);
        assert_eq!(got_on_right, ha);
    }

    #[tokio::test]
    async fn garbage_hello_is_a_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        let mut raw = FramedSocket::new(a, addr());
        let right = FramedSocket::new(b, addr());

        let sender = tokio::spawn(async move {
            raw.write_frame(b"\xff\xff\xff not rlp").await.unwrap();
            // Drain the peer's hello so its write completes.
            let _ = raw.read_frame().await;
        });

        let result = exchange_hello(right, &hello(0x02, 30302)).await;
        assert!(matches!(result, Err(NetError::Protocol(_))));
        sender.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (a, b) = tokio::io::duplex(4096);
        let right = FramedSocket::new(b, addr());

        let result = exchange_hello(right, &hello(0x02, 30302)).await;
        drop(a);
        assert!(matches!(result, Err(NetError::Cancelled)));
    }
}
