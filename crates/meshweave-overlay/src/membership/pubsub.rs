//! Directory over a topic broadcast network
//!
//! Every node periodically announces its metadata on a shared topic. The
//! directory keeps the most recent announcement per node name and expires
//! nodes that stay silent for longer than `announce_timeout`. Leaving
//! publishes an explicit leave announcement so peers drop the node at once.
//!
//! Announcement format:
//! ```text
//! +--------+---------+------------+-----------+------------------+
//! | Ver(1) | Kind(1) | NameLen(1) | Name      | Metadata (rest)  |
//! +--------+---------+------------+-----------+------------------+
//! ```

use super::{
    invalid_phase, join_targets, Delivery, DirectoryConfig, DirectoryPhase, MembershipDirectory,
    PubSubNetwork,
};
use crate::codec::{self, Reader};
use crate::error::{OverlayError, Result};
use crate::peer::{LocalIdentity, Peer, PeerSetSnapshot};
use crate::state::{ClusterState, StateStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const ANNOUNCE_VERSION: u8 = 1;
const KIND_ANNOUNCE: u8 = 1;
const KIND_LEAVE: u8 = 2;

/// Default announcement topic
pub const DEFAULT_ANNOUNCE_TOPIC: &str = "meshweave:announces";

/// Announcement settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubConfig {
    #[serde(default = "default_topic")]
    pub topic: String,

    /// How often the local metadata is announced
    #[serde(default = "default_announce_interval", with = "humantime_serde")]
    pub announce_interval: Duration,

    /// Silence after which a peer is dropped
    #[serde(default = "default_announce_timeout", with = "humantime_serde")]
    pub announce_timeout: Duration,

    /// Bound on a single publish
    #[serde(default = "default_publish_timeout", with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// Largest metadata blob announced
    #[serde(default = "default_metadata_limit")]
    pub metadata_limit: usize,
}

fn default_topic() -> String {
    DEFAULT_ANNOUNCE_TOPIC.to_string()
}

fn default_announce_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_announce_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(16)
}

fn default_metadata_limit() -> usize {
    512
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            announce_interval: default_announce_interval(),
            announce_timeout: default_announce_timeout(),
            publish_timeout: default_publish_timeout(),
            metadata_limit: default_metadata_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Announcement {
    Alive { name: String, meta: Vec<u8> },
    Leave { name: String },
}

impl Announcement {
    fn encode(&self) -> Result<Vec<u8>> {
        let (kind, name, meta) = match self {
            Self::Alive { name, meta } => (KIND_ANNOUNCE, name, meta.as_slice()),
            Self::Leave { name } => (KIND_LEAVE, name, &[][..]),
        };
        let name_len = u8::try_from(name.len())
            .map_err(|_| OverlayError::Config(format!("node name '{name}' is too long")))?;
        let mut buf = Vec::with_capacity(3 + name.len() + meta.len());
        buf.push(ANNOUNCE_VERSION);
        buf.push(kind);
        buf.push(name_len);
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(meta);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != ANNOUNCE_VERSION {
            return Err(OverlayError::MalformedMetadata(format!(
                "unsupported announcement version {version}"
            )));
        }
        let kind = r.u8()?;
        let name_len = usize::from(r.u8()?);
        let name = r.string(name_len)?;
        match kind {
            KIND_ANNOUNCE => Ok(Self::Alive {
                name,
                meta: r.rest().to_vec(),
            }),
            KIND_LEAVE => {
                r.finish()?;
                Ok(Self::Leave { name })
            }
            other => Err(OverlayError::MalformedMetadata(format!(
                "unknown announcement kind {other}"
            ))),
        }
    }
}

struct Entry {
    from: String,
    peer: Peer,
    last_seen: Instant,
}

/// Peers heard on the topic, keyed by node name
#[derive(Default)]
struct PeerTable {
    entries: HashMap<String, Entry>,
}

impl PeerTable {
    /// Apply an announcement; returns whether the peer set changed
    fn apply(&mut self, local_name: &str, delivery: Delivery, now: Instant) -> bool {
        let announcement = match Announcement::decode(&delivery.payload) {
            Ok(a) => a,
            Err(e) => {
                warn!(from = %delivery.from, error = %e, "Dropping unreadable announcement");
                return false;
            }
        };
        match announcement {
            Announcement::Alive { name, .. } | Announcement::Leave { name }
                if name == local_name =>
            {
                if delivery.from != local_name {
                    warn!(
                        peer = %name,
                        from = %delivery.from,
                        "Node name conflict with local node"
                    );
                }
                false
            }
            Announcement::Alive { name, meta } => {
                let changed = match self.entries.get(&name) {
                    None => {
                        info!(peer = %name, addr = %delivery.transport_addr, "Node joined");
                        true
                    }
                    Some(entry) => {
                        if entry.from != delivery.from {
                            warn!(
                                peer = %name,
                                first = %entry.from,
                                second = %delivery.from,
                                "Node name conflict"
                            );
                        }
                        entry.peer.raw_meta != meta
                            || entry.peer.transport_addr != delivery.transport_addr
                    }
                };
                let peer = if changed {
                    Peer::new(name.clone(), delivery.transport_addr, meta)
                } else {
                    match self.entries.remove(&name) {
                        Some(entry) => entry.peer,
                        None => Peer::new(name.clone(), delivery.transport_addr, meta),
                    }
                };
                self.entries.insert(
                    name,
                    Entry {
                        from: delivery.from,
                        peer,
                        last_seen: now,
                    },
                );
                changed
            }
            Announcement::Leave { name } => {
                let removed = self.entries.remove(&name).is_some();
                if removed {
                    info!(peer = %name, "Node left");
                }
                removed
            }
        }
    }

    /// Drop peers silent for longer than `timeout`
    fn expire(&mut self, now: Instant, timeout: Duration) -> bool {
        let before = self.entries.len();
        self.entries.retain(|name, entry| {
            let alive = now.duration_since(entry.last_seen) <= timeout;
            if !alive {
                info!(peer = %name, "Node expired");
            }
            alive
        });
        before != self.entries.len()
    }

    fn snapshot(&self, local_name: &str) -> PeerSetSnapshot {
        PeerSetSnapshot::new(local_name, self.entries.values().map(|e| e.peer.clone()))
    }
}

/// [`MembershipDirectory`] backed by a [`PubSubNetwork`]
pub struct PubSubDirectory {
    network: Arc<dyn PubSubNetwork>,
    store: StateStore,
    config: DirectoryConfig,
    pubsub: PubSubConfig,
    local_name: String,
    local_meta: Arc<RwLock<Vec<u8>>>,
    announcing: Arc<AtomicBool>,
    state: Arc<Mutex<ClusterState>>,
    inner: Mutex<Inner>,
}

struct Inner {
    phase: DirectoryPhase,
    identity: Option<LocalIdentity>,
    events: Option<mpsc::UnboundedReceiver<PeerSetSnapshot>>,
    worker: Option<WorkerHandle>,
}

/// Stop signal and task of the announcement worker
type WorkerHandle = (watch::Sender<bool>, JoinHandle<()>);

impl PubSubDirectory {
    pub fn new(
        network: Arc<dyn PubSubNetwork>,
        local_name: impl Into<String>,
        store: StateStore,
        state: ClusterState,
        config: DirectoryConfig,
        pubsub: PubSubConfig,
    ) -> Self {
        Self {
            network,
            store,
            config,
            pubsub,
            local_name: local_name.into(),
            local_meta: Arc::new(RwLock::new(Vec::new())),
            announcing: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(state)),
            inner: Mutex::new(Inner {
                phase: DirectoryPhase::Unconfigured,
                identity: None,
                events: None,
                worker: None,
            }),
        }
    }

    async fn announce(&self) -> Result<()> {
        publish_alive(
            &*self.network,
            &self.pubsub,
            &self.local_name,
            &self.local_meta,
        )
        .await
    }

    fn start_worker(&self) -> Result<(mpsc::UnboundedReceiver<PeerSetSnapshot>, WorkerHandle)> {
        let (delivery_tx, delivery_rx) = mpsc::channel(self.config.event_backlog.max(1));
        self.network.subscribe(&self.pubsub.topic, delivery_tx)?;

        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            network: Arc::clone(&self.network),
            store: self.store.clone(),
            pubsub: self.pubsub.clone(),
            local_name: self.local_name.clone(),
            local_meta: Arc::clone(&self.local_meta),
            announcing: Arc::clone(&self.announcing),
            state: Arc::clone(&self.state),
            table: PeerTable::default(),
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(worker.run(delivery_rx, stop_rx));
        Ok((snapshot_rx, (stop_tx, task)))
    }
}

#[async_trait::async_trait]
impl MembershipDirectory for PubSubDirectory {
    fn local_name(&self) -> &str {
        &self.local_name
    }

    async fn configure(&self, identity: &LocalIdentity) -> Result<()> {
        let encoded = codec::encode(&identity.meta(), self.pubsub.metadata_limit)?;

        let republish = {
            let mut inner = self.inner.lock();
            match inner.phase {
                DirectoryPhase::Left => return Err(invalid_phase("configure", inner.phase)),
                _ if inner.identity.as_ref() == Some(identity) => return Ok(()),
                _ => {}
            }
            if inner.phase == DirectoryPhase::Unconfigured {
                let (events, worker) = self.start_worker()?;
                inner.events = Some(events);
                inner.worker = Some(worker);
                inner.phase = DirectoryPhase::Configured;
                debug!(
                    node = %self.local_name,
                    topic = %self.pubsub.topic,
                    "Membership directory configured"
                );
            }
            *self.local_meta.write() = encoded;
            inner.identity = Some(identity.clone());
            inner.phase == DirectoryPhase::Joined
        };

        if republish {
            info!(node = %self.local_name, "Republishing local metadata");
            self.announce().await?;
        }
        Ok(())
    }

    async fn join(&self, seeds: &[String]) -> Result<usize> {
        let phase = self.phase();
        if matches!(phase, DirectoryPhase::Unconfigured | DirectoryPhase::Left) {
            return Err(invalid_phase("join", phase));
        }

        let targets = join_targets(seeds, self.state.lock().peer_addrs());
        let contacted = self.network.connect(&targets).await?;
        if !targets.is_empty() && contacted == 0 {
            return Err(OverlayError::NoReachablePeers(targets.len()));
        }

        {
            let mut inner = self.inner.lock();
            if inner.phase == DirectoryPhase::Configured {
                inner.phase = DirectoryPhase::Joined;
            }
        }
        self.announcing.store(true, Ordering::SeqCst);
        if let Err(e) = self.announce().await {
            warn!(error = %e, "Initial announcement failed");
        }
        info!(
            node = %self.local_name,
            contacted,
            topic = %self.pubsub.topic,
            "Joined announcement topic"
        );
        Ok(contacted)
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<PeerSetSnapshot>> {
        let mut inner = self.inner.lock();
        if inner.phase == DirectoryPhase::Unconfigured {
            return Err(invalid_phase("take events", inner.phase));
        }
        inner.events.take().ok_or(OverlayError::EventsTaken)
    }

    async fn leave(&self) -> Result<()> {
        let (previous, worker) = {
            let mut inner = self.inner.lock();
            let previous = std::mem::replace(&mut inner.phase, DirectoryPhase::Left);
            (previous, inner.worker.take())
        };
        if previous == DirectoryPhase::Left {
            return Ok(());
        }
        self.announcing.store(false, Ordering::SeqCst);

        // the final save must not race a snapshot save
        if let Some((stop, task)) = worker {
            let _ = stop.send(true);
            if let Err(e) = task.await {
                warn!(error = %e, "Announcement worker failed");
            }
        }

        let state = self.state.lock().clone();
        if let Err(e) = self.store.save(&state).await {
            warn!(
                path = %self.store.path().display(),
                error = %e,
                "Failed to persist cluster state on leave"
            );
        }

        if previous == DirectoryPhase::Joined {
            let payload = Announcement::Leave {
                name: self.local_name.clone(),
            }
            .encode()?;
            let publish = self.network.publish(&self.pubsub.topic, payload);
            match tokio::time::timeout(self.config.leave_timeout, publish).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Leave announcement failed"),
                Err(_) => warn!("Leave announcement timed out"),
            }
        }
        self.network.shutdown().await?;
        info!(node = %self.local_name, "Left cluster");
        Ok(())
    }

    fn phase(&self) -> DirectoryPhase {
        self.inner.lock().phase
    }
}

async fn publish_alive(
    network: &dyn PubSubNetwork,
    pubsub: &PubSubConfig,
    local_name: &str,
    local_meta: &RwLock<Vec<u8>>,
) -> Result<()> {
    let payload = Announcement::Alive {
        name: local_name.to_string(),
        meta: local_meta.read().clone(),
    }
    .encode()?;
    let publish = network.publish(&pubsub.topic, payload);
    match tokio::time::timeout(pubsub.publish_timeout, publish).await {
        Ok(result) => result,
        Err(_) => Err(OverlayError::Transport("announcement timed out".to_string())),
    }
}

/// Single task owning the peer table
struct Worker {
    network: Arc<dyn PubSubNetwork>,
    store: StateStore,
    pubsub: PubSubConfig,
    local_name: String,
    local_meta: Arc<RwLock<Vec<u8>>>,
    announcing: Arc<AtomicBool>,
    state: Arc<Mutex<ClusterState>>,
    table: PeerTable,
    snapshots: mpsc::UnboundedSender<PeerSetSnapshot>,
}

impl Worker {
    async fn run(
        mut self,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut announce = tokio::time::interval(self.pubsub.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expiry_period = (self.pubsub.announce_timeout / 2).max(Duration::from_millis(100));
        let mut expiry = tokio::time::interval(expiry_period);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        if self.table.apply(&self.local_name, delivery, Instant::now()) {
                            self.emit().await;
                        }
                    }
                    None => break,
                },
                _ = announce.tick() => {
                    if self.announcing.load(Ordering::SeqCst) {
                        let published = publish_alive(
                            &*self.network,
                            &self.pubsub,
                            &self.local_name,
                            &self.local_meta,
                        )
                        .await;
                        if let Err(e) = published {
                            warn!(error = %e, "Periodic announcement failed");
                        }
                    }
                }
                _ = expiry.tick() => {
                    if self.table.expire(Instant::now(), self.pubsub.announce_timeout) {
                        self.emit().await;
                    }
                }
            }
        }
        debug!(node = %self.local_name, "Announcement worker stopped");
    }

    async fn emit(&self) {
        let snapshot = self.table.snapshot(&self.local_name);
        let to_save = {
            let mut state = self.state.lock();
            state.peers = snapshot.peers().to_vec();
            state.clone()
        };
        if let Err(e) = self.store.save(&to_save).await {
            warn!(
                path = %self.store.path().display(),
                error = %e,
                "Failed to persist cluster state"
            );
        }
        if self.snapshots.send(snapshot).is_err() {
            debug!("Snapshot receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemoryNetwork;

    fn identity(name: &str, overlay: &str) -> LocalIdentity {
        LocalIdentity {
            name: name.to_string(),
            overlay_addr: overlay.parse().unwrap(),
            public_key: format!("{name}-key"),
            listen_port: 51820,
            routes: vec![],
        }
    }

    fn directory(
        net: &MemoryNetwork,
        name: &str,
        addr: &str,
        dir: &std::path::Path,
    ) -> PubSubDirectory {
        PubSubDirectory::new(
            net.node(name, addr.parse().unwrap()),
            name,
            StateStore::new(dir, name),
            ClusterState::default(),
            DirectoryConfig::default(),
            PubSubConfig::default(),
        )
    }

    #[test]
    fn test_announcement_roundtrip() {
        let alive = Announcement::Alive {
            name: "node-a".to_string(),
            meta: vec![1, 2, 3],
        };
        assert_eq!(Announcement::decode(&alive.encode().unwrap()).unwrap(), alive);

        let leave = Announcement::Leave {
            name: "node-a".to_string(),
        };
        assert_eq!(Announcement::decode(&leave.encode().unwrap()).unwrap(), leave);
        assert!(Announcement::decode(&[1, 9, 0]).is_err());
    }

    #[test]
    fn test_table_apply_and_expire() {
        let mut table = PeerTable::default();
        let now = Instant::now();
        let delivery = |payload: Vec<u8>| Delivery {
            from: "id-b".to_string(),
            transport_addr: "192.168.1.2".parse().unwrap(),
            payload,
        };
        let alive = Announcement::Alive {
            name: "b".to_string(),
            meta: vec![1],
        }
        .encode()
        .unwrap();

        assert!(table.apply("a", delivery(alive.clone()), now));
        assert!(!table.apply("a", delivery(alive), now));
        assert!(!table.expire(now + Duration::from_secs(5), Duration::from_secs(10)));
        assert!(table.expire(now + Duration::from_secs(11), Duration::from_secs(10)));
        assert!(table.snapshot("a").is_empty());
    }

    #[test]
    fn test_table_ignores_local_name() {
        let mut table = PeerTable::default();
        let payload = Announcement::Alive {
            name: "a".to_string(),
            meta: vec![],
        }
        .encode()
        .unwrap();
        let delivery = Delivery {
            from: "other".to_string(),
            transport_addr: "192.168.1.9".parse().unwrap(),
            payload,
        };
        assert!(!table.apply("a", delivery, Instant::now()));
    }

    #[tokio::test]
    async fn test_announce_and_leave() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        let b = directory(&net, "b", "192.168.1.2", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        b.configure(&identity("b", "10.0.0.2")).await.unwrap();
        let mut a_events = a.events().unwrap();

        a.join(&[]).await.unwrap();
        b.join(&["192.168.1.1".to_string()]).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        let (peer, meta) = snapshot.usable().next().unwrap();
        assert_eq!(peer.name, "b");
        assert_eq!(meta.public_key, "b-key");

        b.leave().await.unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        let b = directory(&net, "b", "192.168.1.2", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        b.configure(&identity("b", "10.0.0.2")).await.unwrap();
        let mut a_events = a.events().unwrap();
        a.join(&[]).await.unwrap();
        b.join(&["192.168.1.1".to_string()]).await.unwrap();

        assert_eq!(a_events.recv().await.unwrap().len(), 1);

        net.fail("b").await;
        let snapshot = tokio::time::timeout(Duration::from_secs(120), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.is_empty());
    }
}
