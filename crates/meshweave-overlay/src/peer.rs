//! Peer, local identity and peer-set snapshot types

use crate::codec;
use crate::membership::Member;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::warn;

/// Metadata a node publishes to the rest of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMeta {
    /// Overlay address derived from the node name
    pub overlay_addr: IpAddr,
    /// Tunnel public key (base64)
    pub public_key: String,
    /// Networks the node announces as reachable through it
    pub routes: Vec<IpNet>,
}

/// Decode status of a peer's metadata blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MetaState {
    /// Not decoded yet (freshly loaded from disk)
    #[default]
    Undecoded,
    /// Valid metadata
    Decoded(PeerMeta),
    /// Metadata failed to decode; the peer is left out of reconciliation
    Malformed(String),
}

/// A remote cluster member
///
/// Composed from the transport-level identity (`name`, `transport_addr`) and
/// the metadata decoded from `raw_meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique node name
    pub name: String,

    /// Address the membership transport reaches this node on
    pub transport_addr: IpAddr,

    /// Last metadata blob received for this node
    #[serde(with = "crate::state::base64_bytes", default)]
    pub raw_meta: Vec<u8>,

    #[serde(skip)]
    meta: MetaState,
}

impl Peer {
    /// Build a peer and decode its metadata
    pub fn new(name: impl Into<String>, transport_addr: IpAddr, raw_meta: Vec<u8>) -> Self {
        let mut peer = Self {
            name: name.into(),
            transport_addr,
            raw_meta,
            meta: MetaState::Undecoded,
        };
        peer.decode_meta();
        peer
    }

    /// Build a peer from a transport member record
    pub fn from_member(member: &Member) -> Self {
        Self::new(member.name.clone(), member.addr, member.meta.clone())
    }

    /// Decode `raw_meta`, recording failure on the peer
    pub fn decode_meta(&mut self) {
        self.meta = match codec::decode(&self.raw_meta) {
            Ok(meta) => MetaState::Decoded(meta),
            Err(e) => {
                warn!(peer = %self.name, error = %e, "Ignoring peer with unreadable metadata");
                MetaState::Malformed(e.to_string())
            }
        };
    }

    /// Decoded metadata, if valid
    pub fn meta(&self) -> Option<&PeerMeta> {
        match &self.meta {
            MetaState::Decoded(meta) => Some(meta),
            _ => None,
        }
    }

    /// Decode status
    pub fn meta_state(&self) -> &MetaState {
        &self.meta
    }
}

/// This node's identity, computed once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: String,
    pub overlay_addr: IpAddr,
    pub public_key: String,
    pub listen_port: u16,
    pub routes: Vec<IpNet>,
}

impl LocalIdentity {
    /// Metadata published for this node
    pub fn meta(&self) -> PeerMeta {
        PeerMeta {
            overlay_addr: self.overlay_addr,
            public_key: self.public_key.clone(),
            routes: self.routes.clone(),
        }
    }
}

/// Full view of the remote peers at one point in time
///
/// Sorted by name, one entry per name, never contains the local node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSetSnapshot {
    peers: Vec<Peer>,
}

impl PeerSetSnapshot {
    /// Build a snapshot, dropping the local node and duplicate names
    ///
    /// When two records share a name the later one wins and a warning is
    /// logged; conflicts never block the snapshot.
    pub fn new(local_name: &str, peers: impl IntoIterator<Item = Peer>) -> Self {
        let mut by_name: BTreeMap<String, Peer> = BTreeMap::new();
        for peer in peers {
            if peer.name == local_name {
                continue;
            }
            if let Some(previous) = by_name.get(&peer.name) {
                if previous.transport_addr != peer.transport_addr {
                    warn!(
                        peer = %peer.name,
                        first = %previous.transport_addr,
                        second = %peer.transport_addr,
                        "Two members claim the same name"
                    );
                }
            }
            by_name.insert(peer.name.clone(), peer);
        }
        Self {
            peers: by_name.into_values().collect(),
        }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Peers whose metadata decoded
    pub fn usable(&self) -> impl Iterator<Item = (&Peer, &PeerMeta)> {
        self.peers.iter().filter_map(|p| p.meta().map(|m| (p, m)))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn into_peers(self) -> Vec<Peer> {
        self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(addr: &str) -> Vec<u8> {
        codec::encode(
            &PeerMeta {
                overlay_addr: addr.parse().unwrap(),
                public_key: "key".to_string(),
                routes: vec![],
            },
            512,
        )
        .unwrap()
    }

    #[test]
    fn test_peer_decodes_metadata() {
        let peer = Peer::new("a", "192.168.1.1".parse().unwrap(), meta("10.0.0.1"));
        assert_eq!(
            peer.meta().unwrap().overlay_addr,
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_peer_records_malformed_metadata() {
        let peer = Peer::new("a", "192.168.1.1".parse().unwrap(), vec![9, 9, 9]);
        assert!(peer.meta().is_none());
        assert!(matches!(peer.meta_state(), MetaState::Malformed(_)));
    }

    #[test]
    fn test_snapshot_sorted_dedup_excludes_local() {
        let addr: IpAddr = "192.168.1.1".parse().unwrap();
        let snapshot = PeerSetSnapshot::new(
            "self",
            vec![
                Peer::new("c", addr, meta("10.0.0.3")),
                Peer::new("self", addr, meta("10.0.0.9")),
                Peer::new("a", addr, meta("10.0.0.1")),
                Peer::new("c", "192.168.1.2".parse().unwrap(), meta("10.0.0.4")),
            ],
        );
        let names: Vec<_> = snapshot.peers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(
            snapshot.peers()[1].transport_addr,
            "192.168.1.2".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_snapshot_usable_skips_malformed() {
        let addr: IpAddr = "192.168.1.1".parse().unwrap();
        let snapshot = PeerSetSnapshot::new(
            "self",
            vec![
                Peer::new("good", addr, meta("10.0.0.1")),
                Peer::new("bad", addr, vec![0xff]),
            ],
        );
        assert_eq!(snapshot.len(), 2);
        let usable: Vec<_> = snapshot.usable().map(|(p, _)| p.name.clone()).collect();
        assert_eq!(usable, vec!["good".to_string()]);
    }

    #[test]
    fn test_peer_serde_reencodes_meta() {
        let peer = Peer::new("a", "192.168.1.1".parse().unwrap(), meta("10.0.0.1"));
        let json = serde_json::to_string(&peer).unwrap();
        let mut back: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.meta_state(), &MetaState::Undecoded);
        back.decode_meta();
        assert_eq!(back, peer);
    }
}
