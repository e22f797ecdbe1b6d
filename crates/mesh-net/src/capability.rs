//! Capability registry — named sub-protocols negotiated at handshake.
//!
//! A capability owns a message-id range within a session. On protocol
//! versions with framed sub-protocols each negotiated capability gets a
//! contiguous sub-protocol id starting at 1; on older versions each gets
//! a packet-id offset starting at `USER_PACKET`, advanced by the previous
//! capability's message count.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use mesh_core::wire::{CapabilityDesc, FRAMING_MIN_VERSION, USER_PACKET};
use mesh_core::NodeId;

use crate::session::PeerSession;

/// A named sub-protocol. Registered with the host before `start()`.
pub trait Capability: Send + Sync {
    /// Name and version announced in the handshake.
    fn descriptor(&self) -> CapabilityDesc;

    /// Number of packet ids this capability uses in offset mode.
    fn message_count(&self) -> u8;

    /// The host is starting.
    fn on_starting(&self) {}

    /// The host is stopping.
    fn on_stopping(&self) {}

    /// A session negotiated this capability. `offset` is the packet-id
    /// base in offset mode (0 in framed mode); `subproto_id` is the
    /// framed sub-protocol id (0 in offset mode). The session reference
    /// is non-owning; look the session up through the host when acting on
    /// it later.
    fn new_peer(&self, session: Weak<PeerSession>, cap: &CapabilityDesc, offset: u8, subproto_id: u8);

    /// A frame for this capability arrived. `packet_id` is relative to
    /// the capability's range.
    fn on_message(&self, from: NodeId, packet_id: u8, payload: Bytes);
}

/// Registry of local capabilities, keyed by (name, version).
#[derive(Default)]
pub struct CapabilityRegistry {
    caps: BTreeMap<CapabilityDesc, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cap: Arc<dyn Capability>) {
        self.caps.insert(cap.descriptor(), cap);
    }

    pub fn have(&self, desc: &CapabilityDesc) -> bool {
        self.caps.contains_key(desc)
    }

    pub fn get(&self, desc: &CapabilityDesc) -> Option<Arc<dyn Capability>> {
        self.caps.get(desc).cloned()
    }

    pub fn descriptors(&self) -> Vec<CapabilityDesc> {
        self.caps.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Capability>> {
        self.caps.values()
    }

    /// Intersect the remote's announced capabilities with the registry,
    /// keeping only the highest supported version per name.
    pub fn negotiate(&self, remote: &[CapabilityDesc]) -> Vec<CapabilityDesc> {
        let mut kept: Vec<CapabilityDesc> = Vec::new();
        for cap in remote {
            if !self.have(cap) {
                continue;
            }
            let shadowed = remote.iter().any(|other| {
                other.name == cap.name && other.version > cap.version && self.have(other)
            });
            if !shadowed {
                kept.push(cap.clone());
            }
        }
        kept.sort();
        kept.dedup();
        kept
    }
}

/// A capability's negotiated slot within one session.
#[derive(Debug, Clone)]
pub struct CapabilitySlot {
    pub desc: CapabilityDesc,
    /// First packet id (offset mode); 0 in framed mode.
    pub offset: u8,
    /// Number of packet ids (offset mode).
    pub count: u8,
    /// Sub-protocol id (framed mode); 0 in offset mode.
    pub subproto_id: u8,
}

/// Assign framing identifiers for a session's negotiated capabilities.
///
/// Returns the slots in capability order plus whether framed mode was
/// chosen. Framed mode applies when both sides speak at least
/// `FRAMING_MIN_VERSION`.
pub fn assign_slots(
    registry: &CapabilityRegistry,
    negotiated: &[CapabilityDesc],
    remote_version: u32,
    local_version: u32,
) -> (Vec<CapabilitySlot>, bool) {
    let framed = remote_version.min(local_version) >= FRAMING_MIN_VERSION;
    let mut slots = Vec::with_capacity(negotiated.len());

    let mut offset = USER_PACKET;
    let mut subproto = 1u8;

    for desc in negotiated {
        let count = registry
            .get(desc)
            .map(|c| c.message_count())
            .unwrap_or_default();
        if framed {
            slots.push(CapabilitySlot {
                desc: desc.clone(),
                offset: 0,
                count,
                subproto_id: subproto,
            });
            subproto += 1;
        } else {
            slots.push(CapabilitySlot {
                desc: desc.clone(),
                offset,
                count,
                subproto_id: 0,
            });
            offset = offset.saturating_add(count);
        }
    }

    (slots, framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        desc: CapabilityDesc,
        count: u8,
    }

    impl Capability for Dummy {
        fn descriptor(&self) -> CapabilityDesc {
            self.desc.clone()
        }
        fn message_count(&self) -> u8 {
            self.count
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

    fn registry_with(caps: &[(&str, u32, u8)]) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        for (name, version, count) in caps {
            registry.register(Arc::new(Dummy {
                desc: CapabilityDesc::new(*name, *version),
                count: *count,
            }));
        }
        registry
    }

    #[test]
    fn negotiate_keeps_highest_supported_version_per_name() {
        let registry = registry_with(&[("eth", 62, 8), ("eth", 63, 17), ("amop", 1, 4)]);
        let remote = vec![
            CapabilityDesc::new("eth", 62),
            CapabilityDesc::new("eth", 63),
            CapabilityDesc::new("amop", 1),
            CapabilityDesc::new("shh", 2),
        ];

        let kept = registry.negotiate(&remote);
        assert_eq!(
            kept,
            vec![CapabilityDesc::new("amop", 1), CapabilityDesc::new("eth", 63)]
        );
    }

    #[test]
    fn negotiate_keeps_lower_version_when_higher_is_unsupported() {
        let registry = registry_with(&[("eth", 62, 8)]);
        let remote = vec![CapabilityDesc::new("eth", 62), CapabilityDesc::new("eth", 63)];
        assert_eq!(registry.negotiate(&remote), vec![CapabilityDesc::new("eth", 62)]);
    }

    #[test]
    fn negotiate_empty_when_no_overlap() {
        let registry = registry_with(&[("eth", 62, 8)]);
        let remote = vec![CapabilityDesc::new("shh", 2)];
        assert!(registry.negotiate(&remote).is_empty());
    }

    #[test]
    fn offset_mode_packs_ranges_from_user_packet() {
        let registry = registry_with(&[("amop", 1, 4), ("eth", 62, 8)]);
        let negotiated = registry.negotiate(&[
            CapabilityDesc::new("amop", 1),
            CapabilityDesc::new("eth", 62),
        ]);

        let (slots, framed) = assign_slots(&registry, &negotiated, 4, 5);
        assert!(!framed);
        assert_eq!(slots[0].offset, USER_PACKET);
        assert_eq!(slots[0].count, 4);
        assert_eq!(slots[1].offset, USER_PACKET + 4);
        assert_eq!(slots[1].count, 8);
        assert!(slots.iter().all(|s| s.subproto_id == 0));
    }

    #[test]
    fn framed_mode_numbers_subprotocols_from_one() {
        let registry = registry_with(&[("amop", 1, 4), ("eth", 62, 8)]);
        let negotiated = registry.negotiate(&[
            CapabilityDesc::new("amop", 1),
            CapabilityDesc::new("eth", 62),
        ]);

        let (slots, framed) = assign_slots(&registry, &negotiated, 5, 5);
        assert!(framed);
        assert_eq!(slots[0].subproto_id, 1);
        assert_eq!(slots[1].subproto_id, 2);
        assert!(slots.iter().all(|s| s.offset == 0));
    }
}
