//! File-backed node-connection manager.
//!
//! Reads the authorized peer list and the revoked certificate serials
//! from `nodes.toml` in the data directory. The merged live+authorized
//! set published by the host is kept in memory and logged; persisting it
//! is the fleet tooling's job, not the node's.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use parking_lot::RwLock;
use serde::Deserialize;

use mesh_core::interfaces::NodeConnManager;
use mesh_core::Endpoint;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodesFile {
    revoked_serials: Vec<String>,
    node: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    address: String,
    port: u16,
    #[serde(default)]
    host: String,
}

pub struct FileNodeConnManager {
    authorized: RwLock<BTreeMap<String, Endpoint>>,
    revoked: RwLock<HashSet<String>>,
}

impl FileNodeConnManager {
    /// Load `nodes.toml` from the data directory; a missing file means an
    /// empty authorized set.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join("nodes.toml");
        let parsed: NodesFile = if path.exists() {
            toml::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            tracing::info!(path = %path.display(), "no nodes.toml, starting with an empty peer list");
            NodesFile::default()
        };

        let mut authorized = BTreeMap::new();
        for entry in parsed.node {
            let Ok(address) = entry.address.parse::<IpAddr>() else {
                tracing::warn!(address = %entry.address, "skipping unparseable node address");
                continue;
            };
            let mut endpoint = Endpoint::new(address, entry.port);
            endpoint.host = entry.host;
            authorized.insert(endpoint.name(), endpoint);
        }
        tracing::info!(
            nodes = authorized.len(),
            revoked = parsed.revoked_serials.len(),
            "node connection manager loaded"
        );

        Ok(Self {
            authorized: RwLock::new(authorized),
            revoked: RwLock::new(parsed.revoked_serials.into_iter().collect()),
        })
    }

    pub fn revoke(&self, serial: impl Into<String>) {
        self.revoked.write().insert(serial.into());
    }
}

impl NodeConnManager for FileNodeConnManager {
    fn get_all_connect(&self) -> BTreeMap<String, Endpoint> {
        self.authorized.read().clone()
    }

    fn update_all_connect(&self, merged: BTreeMap<String, Endpoint>) {
        tracing::debug!(nodes = merged.len(), "merged connect set published");
        *self.authorized.write() = merged;
    }

    fn check_cert_out(&self, serial: &str) -> bool {
        self.revoked.read().contains(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nodes_file() {
        let dir = std::env::temp_dir().join(format!("meshd-nodes-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("nodes.toml"),
            r#"
revoked_serials = ["abcd"]

[[node]]
address = "10.0.0.2"
port = 30300

[[node]]
address = "not-an-ip"
port = 30300
"#,
        )
        .unwrap();

        let manager = FileNodeConnManager::load(&dir).unwrap();
        let all = manager.get_all_connect();
        assert_eq!(all.len(), 1, "unparseable entries are skipped");
        assert!(all.contains_key("10.0.0.2:30300"));
        assert!(manager.check_cert_out("abcd"));
        assert!(!manager.check_cert_out("ffff"));

        manager.revoke("ffff");
        assert!(manager.check_cert_out("ffff"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = std::env::temp_dir().join(format!("meshd-nonodes-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let manager = FileNodeConnManager::load(&dir).unwrap();
        assert!(manager.get_all_connect().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
