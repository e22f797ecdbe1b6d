//! Network endpoints — the (address, port) triple a peer is reached at.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Where a peer listens. The canonical `address:tcp_port` string is the
/// key the host tracks peers under.
///
/// Two endpoints are equal iff address and TCP port are equal; the UDP
/// port and hostname are carried along but never compared.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    /// Optional DNS name the endpoint was configured with. Informational.
    pub host: String,
}

impl Endpoint {
    pub fn new(address: IpAddr, tcp_port: u16) -> Self {
        Self {
            address,
            tcp_port,
            udp_port: tcp_port,
            host: String::new(),
        }
    }

    /// Canonical peer key: `address:tcp_port`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.address, self.tcp_port)
    }

    /// An endpoint with no usable address. Connect attempts reject these.
    pub fn is_unspecified(&self) -> bool {
        self.address.is_unspecified()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.tcp_port == other.tcp_port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.tcp_port.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_address_and_tcp_port() {
        let ep = Endpoint::new("10.0.0.7".parse().unwrap(), 30300);
        assert_eq!(ep.name(), "10.0.0.7:30300");
    }

    #[test]
    fn equality_ignores_udp_port_and_host() {
        let mut a = Endpoint::new("10.0.0.7".parse().unwrap(), 30300);
        let mut b = a.clone();
        a.udp_port = 1;
        b.udp_port = 2;
        b.host = "node7.example".into();
        assert_eq!(a, b);

        let c = Endpoint::new("10.0.0.7".parse().unwrap(), 30301);
        assert_ne!(a, c);
    }

    #[test]
    fn unspecified_address_is_flagged() {
        assert!(Endpoint::default().is_unspecified());
        assert!(!Endpoint::new("127.0.0.1".parse().unwrap(), 1).is_unspecified());
    }
}
