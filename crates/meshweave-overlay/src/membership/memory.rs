//! In-process membership network
//!
//! All nodes created from one [`MemoryNetwork`] share a single cluster. Join
//! targets are matched against node addresses. Used to drive directories and
//! the agent in tests without sockets.

use super::{
    Delivery, Member, MemberEvent, MemberEventKind, MembershipTransport, MetadataProvider,
    PubSubNetwork,
};
use crate::error::{OverlayError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_MEMORY_METADATA_LIMIT: usize = 512;

#[derive(Default)]
struct NodeEntry {
    addr: Option<IpAddr>,
    provider: Option<MetadataProvider>,
    sink: Option<mpsc::Sender<MemberEvent>>,
    meta: Vec<u8>,
    joined: bool,
    connected: bool,
    subscriptions: HashMap<String, mpsc::Sender<Delivery>>,
}

impl NodeEntry {
    fn member(&self, name: &str) -> Option<Member> {
        Some(Member {
            name: name.to_string(),
            addr: self.addr?,
            meta: self.meta.clone(),
        })
    }
}

#[derive(Default)]
struct Hub {
    nodes: BTreeMap<String, NodeEntry>,
}

impl Hub {
    fn find_by_addr(&self, target: &str) -> Option<&str> {
        let ip = parse_host(target)?;
        self.nodes
            .iter()
            .find(|(_, n)| n.addr == Some(ip))
            .map(|(name, _)| name.as_str())
    }

    /// Queue `event` for every joined node except `except`
    fn broadcast(
        &self,
        except: &str,
        event: &MemberEvent,
        out: &mut Vec<(mpsc::Sender<MemberEvent>, MemberEvent)>,
    ) {
        for (name, node) in &self.nodes {
            if name == except || !node.joined {
                continue;
            }
            if let Some(sink) = &node.sink {
                out.push((sink.clone(), event.clone()));
            }
        }
    }
}

/// Shared in-process cluster
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    metadata_limit: usize,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_metadata_limit(DEFAULT_MEMORY_METADATA_LIMIT)
    }

    pub fn with_metadata_limit(metadata_limit: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            metadata_limit,
        }
    }

    /// Register a node on the network
    pub fn node(&self, name: &str, addr: IpAddr) -> Arc<MemoryNode> {
        self.hub.lock().nodes.insert(
            name.to_string(),
            NodeEntry {
                addr: Some(addr),
                ..NodeEntry::default()
            },
        );
        Arc::new(MemoryNode {
            name: name.to_string(),
            addr,
            metadata_limit: self.metadata_limit,
            hub: Arc::clone(&self.hub),
        })
    }

    /// Drop a node without a graceful leave, as if it crashed
    pub async fn fail(&self, name: &str) {
        let pending = {
            let mut hub = self.hub.lock();
            let Some(node) = hub.nodes.remove(name) else {
                return;
            };
            let mut pending = Vec::new();
            if let (true, Some(member)) = (node.joined, node.member(name)) {
                let event = MemberEvent {
                    kind: MemberEventKind::Leave,
                    member,
                };
                hub.broadcast(name, &event, &mut pending);
            }
            pending
        };
        deliver(pending).await;
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One node of a [`MemoryNetwork`]
pub struct MemoryNode {
    name: String,
    addr: IpAddr,
    metadata_limit: usize,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNode {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    fn refresh_meta(&self, hub: &mut Hub) {
        if let Some(node) = hub.nodes.get_mut(&self.name) {
            if let Some(provider) = &node.provider {
                node.meta = provider(self.metadata_limit);
            }
        }
    }
}

async fn deliver<T>(pending: Vec<(mpsc::Sender<T>, T)>) {
    for (sink, item) in pending {
        let _ = sink.send(item).await;
    }
}

fn parse_host(target: &str) -> Option<IpAddr> {
    target
        .parse::<IpAddr>()
        .ok()
        .or_else(|| target.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

#[async_trait::async_trait]
impl MembershipTransport for MemoryNode {
    fn local_name(&self) -> &str {
        &self.name
    }

    fn metadata_limit(&self) -> usize {
        self.metadata_limit
    }

    fn set_metadata_provider(&self, provider: MetadataProvider) {
        if let Some(node) = self.hub.lock().nodes.get_mut(&self.name) {
            node.provider = Some(provider);
        }
    }

    fn set_event_sink(&self, sink: mpsc::Sender<MemberEvent>) {
        if let Some(node) = self.hub.lock().nodes.get_mut(&self.name) {
            node.sink = Some(sink);
        }
    }

    async fn join(&self, addrs: &[String]) -> Result<usize> {
        let (contacted, pending) = {
            let mut hub = self.hub.lock();
            let contacted = addrs
                .iter()
                .filter_map(|a| hub.find_by_addr(a))
                .filter(|name| *name != self.name && hub.nodes[*name].joined)
                .count();
            if !addrs.is_empty() && contacted == 0 {
                return Err(OverlayError::Transport(format!(
                    "no response from any of {} addresses",
                    addrs.len()
                )));
            }

            self.refresh_meta(&mut hub);
            let node = hub
                .nodes
                .get_mut(&self.name)
                .ok_or_else(|| OverlayError::Transport("node shut down".to_string()))?;
            let already_joined = std::mem::replace(&mut node.joined, true);
            let own_sink = node.sink.clone();

            let mut pending = Vec::new();
            if !already_joined {
                if let Some(me) = hub.nodes[&self.name].member(&self.name) {
                    let event = MemberEvent {
                        kind: MemberEventKind::Join,
                        member: me,
                    };
                    hub.broadcast(&self.name, &event, &mut pending);
                }
                if let Some(sink) = own_sink {
                    for (name, node) in &hub.nodes {
                        if !node.joined {
                            continue;
                        }
                        if let Some(member) = node.member(name) {
                            pending.push((
                                sink.clone(),
                                MemberEvent {
                                    kind: MemberEventKind::Join,
                                    member,
                                },
                            ));
                        }
                    }
                }
            }
            (contacted, pending)
        };
        deliver(pending).await;
        Ok(contacted)
    }

    fn members(&self) -> Vec<Member> {
        let hub = self.hub.lock();
        let joined = hub.nodes.get(&self.name).map(|n| n.joined).unwrap_or(false);
        hub.nodes
            .iter()
            .filter(|(name, node)| {
                if joined {
                    node.joined
                } else {
                    *name == &self.name
                }
            })
            .filter_map(|(name, node)| node.member(name))
            .collect()
    }

    async fn update_node(&self, _timeout: Duration) -> Result<()> {
        let pending = {
            let mut hub = self.hub.lock();
            self.refresh_meta(&mut hub);
            let mut pending = Vec::new();
            let Some(node) = hub.nodes.get(&self.name) else {
                return Ok(());
            };
            if let (true, Some(member)) = (node.joined, node.member(&self.name)) {
                let event = MemberEvent {
                    kind: MemberEventKind::Update,
                    member,
                };
                if let Some(sink) = &node.sink {
                    pending.push((sink.clone(), event.clone()));
                }
                hub.broadcast(&self.name, &event, &mut pending);
            }
            pending
        };
        deliver(pending).await;
        Ok(())
    }

    async fn leave(&self, _timeout: Duration) -> Result<()> {
        let pending = {
            let mut hub = self.hub.lock();
            let mut pending = Vec::new();
            let Some(node) = hub.nodes.get_mut(&self.name) else {
                return Ok(());
            };
            if std::mem::replace(&mut node.joined, false) {
                if let Some(member) = node.member(&self.name) {
                    let event = MemberEvent {
                        kind: MemberEventKind::Leave,
                        member,
                    };
                    hub.broadcast(&self.name, &event, &mut pending);
                }
            }
            pending
        };
        deliver(pending).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(node) = self.hub.lock().nodes.get_mut(&self.name) {
            node.joined = false;
            node.connected = false;
            node.sink = None;
            node.provider = None;
            node.subscriptions.clear();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PubSubNetwork for MemoryNode {
    fn local_id(&self) -> &str {
        &self.name
    }

    async fn connect(&self, addrs: &[String]) -> Result<usize> {
        let mut hub = self.hub.lock();
        let contacted = addrs
            .iter()
            .filter_map(|a| hub.find_by_addr(a))
            .filter(|name| *name != self.name && hub.nodes[*name].connected)
            .count();
        if !addrs.is_empty() && contacted == 0 {
            return Err(OverlayError::Transport(format!(
                "no response from any of {} addresses",
                addrs.len()
            )));
        }
        if let Some(node) = hub.nodes.get_mut(&self.name) {
            node.connected = true;
        }
        Ok(contacted)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let pending = {
            let hub = self.hub.lock();
            let connected = hub
                .nodes
                .get(&self.name)
                .map(|n| n.connected)
                .unwrap_or(false);
            if !connected {
                return Err(OverlayError::Transport("not connected".to_string()));
            }
            hub.nodes
                .iter()
                .filter(|(name, node)| *name != &self.name && node.connected)
                .filter_map(|(_, node)| node.subscriptions.get(topic))
                .map(|sink| {
                    (
                        sink.clone(),
                        Delivery {
                            from: self.name.clone(),
                            transport_addr: self.addr,
                            payload: payload.clone(),
                        },
                    )
                })
                .collect::<Vec<_>>()
        };
        deliver(pending).await;
        Ok(())
    }

    fn subscribe(&self, topic: &str, sink: mpsc::Sender<Delivery>) -> Result<()> {
        let mut hub = self.hub.lock();
        let node = hub
            .nodes
            .get_mut(&self.name)
            .ok_or_else(|| OverlayError::Transport("node shut down".to_string()))?;
        node.subscriptions.insert(topic.to_string(), sink);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        MembershipTransport::shutdown(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_delivers_events_both_ways() {
        let net = MemoryNetwork::new();
        let a = net.node("a", "192.168.1.1".parse().unwrap());
        let b = net.node("b", "192.168.1.2".parse().unwrap());
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a.set_event_sink(a_tx);
        b.set_event_sink(b_tx);

        assert_eq!(a.join(&[]).await.unwrap(), 0);
        assert_eq!(a_rx.recv().await.unwrap().member.name, "a");

        assert_eq!(b.join(&["192.168.1.1:7946".to_string()]).await.unwrap(), 1);
        let event = a_rx.recv().await.unwrap();
        assert_eq!(event.kind, MemberEventKind::Join);
        assert_eq!(event.member.name, "b");

        let mut seen = vec![
            b_rx.recv().await.unwrap().member.name,
            b_rx.recv().await.unwrap().member.name,
        ];
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(a.members().len(), 2);
    }

    #[tokio::test]
    async fn test_members_before_join_is_self_only() {
        let net = MemoryNetwork::new();
        let a = net.node("a", "192.168.1.1".parse().unwrap());
        let _b = net.node("b", "192.168.1.2".parse().unwrap());
        let members = a.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "a");
    }

    #[tokio::test]
    async fn test_fail_reports_leave() {
        let net = MemoryNetwork::new();
        let a = net.node("a", "192.168.1.1".parse().unwrap());
        let b = net.node("b", "192.168.1.2".parse().unwrap());
        let (a_tx, mut a_rx) = mpsc::channel(16);
        a.set_event_sink(a_tx);
        a.join(&[]).await.unwrap();
        b.join(&["192.168.1.1".to_string()]).await.unwrap();

        net.fail("b").await;
        let mut last = None;
        while let Ok(event) = a_rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().kind, MemberEventKind::Leave);
        assert_eq!(a.members().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers_only() {
        let net = MemoryNetwork::new();
        let a = net.node("a", "192.168.1.1".parse().unwrap());
        let b = net.node("b", "192.168.1.2".parse().unwrap());
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a.subscribe("t", a_tx).unwrap();
        b.subscribe("t", b_tx).unwrap();
        a.connect(&[]).await.unwrap();
        b.connect(&["192.168.1.1".to_string()]).await.unwrap();

        a.publish("t", b"hello".to_vec()).await.unwrap();
        let delivery = b_rx.recv().await.unwrap();
        assert_eq!(delivery.from, "a");
        assert_eq!(delivery.payload, b"hello");
        assert!(a_rx.try_recv().is_err());
    }
}
