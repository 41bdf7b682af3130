//! Directory over a memberlist-style gossip transport

use super::{
    invalid_phase, join_targets, DirectoryConfig, DirectoryPhase, MemberEvent, MemberEventKind,
    MembershipDirectory, MembershipTransport, MetadataProvider,
};
use crate::codec;
use crate::error::{OverlayError, Result};
use crate::peer::{LocalIdentity, Peer, PeerSetSnapshot};
use crate::state::{ClusterState, StateStore};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// [`MembershipDirectory`] backed by a [`MembershipTransport`]
pub struct GossipDirectory {
    transport: Arc<dyn MembershipTransport>,
    store: StateStore,
    config: DirectoryConfig,
    local_name: String,
    local_meta: Arc<RwLock<Vec<u8>>>,
    state: Arc<Mutex<ClusterState>>,
    inner: Mutex<Inner>,
}

struct Inner {
    phase: DirectoryPhase,
    identity: Option<LocalIdentity>,
    events: Option<mpsc::UnboundedReceiver<PeerSetSnapshot>>,
    forwarder: Option<Forwarder>,
}

/// Handle on the forwarding task
struct Forwarder {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GossipDirectory {
    /// Create a directory; `state` is the loaded cluster state
    pub fn new(
        transport: Arc<dyn MembershipTransport>,
        store: StateStore,
        state: ClusterState,
        config: DirectoryConfig,
    ) -> Self {
        let local_name = transport.local_name().to_string();
        Self {
            transport,
            store,
            config,
            local_name,
            local_meta: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(Mutex::new(state)),
            inner: Mutex::new(Inner {
                phase: DirectoryPhase::Unconfigured,
                identity: None,
                events: None,
                forwarder: None,
            }),
        }
    }

    fn start_forwarding(&self) -> (mpsc::UnboundedReceiver<PeerSetSnapshot>, Forwarder) {
        let meta = Arc::clone(&self.local_meta);
        let provider: MetadataProvider = Arc::new(move |limit| {
            let meta = meta.read();
            if meta.len() > limit {
                warn!(size = meta.len(), limit, "Local metadata exceeds transport limit");
                return Vec::new();
            }
            meta.clone()
        });
        self.transport.set_metadata_provider(provider);

        let (event_tx, event_rx) = mpsc::channel(self.config.event_backlog.max(1));
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        self.transport.set_event_sink(event_tx);

        let task = tokio::spawn(forward_events(
            Arc::clone(&self.transport),
            self.store.clone(),
            Arc::clone(&self.state),
            self.local_name.clone(),
            event_rx,
            stop_rx,
            snapshot_tx,
        ));
        let forwarder = Forwarder {
            stop: stop_tx,
            task,
        };
        (snapshot_rx, forwarder)
    }
}

#[async_trait::async_trait]
impl MembershipDirectory for GossipDirectory {
    fn local_name(&self) -> &str {
        &self.local_name
    }

    async fn configure(&self, identity: &LocalIdentity) -> Result<()> {
        let encoded = codec::encode(&identity.meta(), self.transport.metadata_limit())?;

        let republish = {
            let mut inner = self.inner.lock();
            match inner.phase {
                DirectoryPhase::Left => return Err(invalid_phase("configure", inner.phase)),
                _ if inner.identity.as_ref() == Some(identity) => return Ok(()),
                _ => {}
            }
            *self.local_meta.write() = encoded;
            inner.identity = Some(identity.clone());

            if inner.phase == DirectoryPhase::Unconfigured {
                let (events, forwarder) = self.start_forwarding();
                inner.events = Some(events);
                inner.forwarder = Some(forwarder);
                inner.phase = DirectoryPhase::Configured;
                debug!(node = %self.local_name, "Membership directory configured");
            }
            inner.phase == DirectoryPhase::Joined
        };

        if republish {
            info!(node = %self.local_name, "Republishing local metadata");
            self.transport.update_node(self.config.update_timeout).await?;
        }
        Ok(())
    }

    async fn join(&self, seeds: &[String]) -> Result<usize> {
        let phase = self.phase();
        if matches!(phase, DirectoryPhase::Unconfigured | DirectoryPhase::Left) {
            return Err(invalid_phase("join", phase));
        }

        let targets = join_targets(seeds, self.state.lock().peer_addrs());
        let contacted = self.transport.join(&targets).await?;
        let members = self.transport.members().len();
        if !targets.is_empty() && members < 2 {
            return Err(OverlayError::NoReachablePeers(targets.len()));
        }

        let mut inner = self.inner.lock();
        if inner.phase == DirectoryPhase::Configured {
            inner.phase = DirectoryPhase::Joined;
        }
        info!(node = %self.local_name, contacted, members, "Joined cluster");
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
        let (previous, forwarder) = {
            let mut inner = self.inner.lock();
            let previous = std::mem::replace(&mut inner.phase, DirectoryPhase::Left);
            (previous, inner.forwarder.take())
        };
        if previous == DirectoryPhase::Left {
            return Ok(());
        }

        // the final save must not race a snapshot save
        if let Some(forwarder) = forwarder {
            let _ = forwarder.stop.send(true);
            if let Err(e) = forwarder.task.await {
                warn!(error = %e, "Forwarding task failed");
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
            if let Err(e) = self.transport.leave(self.config.leave_timeout).await {
                warn!(error = %e, "Graceful leave failed");
            }
        }
        self.transport.shutdown().await?;
        info!(node = %self.local_name, "Left cluster");
        Ok(())
    }

    fn phase(&self) -> DirectoryPhase {
        self.inner.lock().phase
    }
}

/// Turn transport events into persisted snapshots
///
/// Events about the local node produce no snapshot, except name conflicts.
/// Runs until stopped or until the transport drops its event sink.
async fn forward_events(
    transport: Arc<dyn MembershipTransport>,
    store: StateStore,
    state: Arc<Mutex<ClusterState>>,
    local_name: String,
    mut events: mpsc::Receiver<MemberEvent>,
    mut stop: watch::Receiver<bool>,
    snapshots: mpsc::UnboundedSender<PeerSetSnapshot>,
) {
    loop {
        let event = tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        log_event(&local_name, &event);
        if event.member.name == local_name && event.kind != MemberEventKind::Conflict {
            continue;
        }

        let snapshot = PeerSetSnapshot::new(
            &local_name,
            transport.members().iter().map(Peer::from_member),
        );
        let to_save = {
            let mut state = state.lock();
            state.peers = snapshot.peers().to_vec();
            state.clone()
        };
        if let Err(e) = store.save(&to_save).await {
            warn!(path = %store.path().display(), error = %e, "Failed to persist cluster state");
        }
        if snapshots.send(snapshot).is_err() {
            debug!("Snapshot receiver dropped");
        }
    }
    debug!(node = %local_name, "Membership forwarding stopped");
}

fn log_event(local_name: &str, event: &MemberEvent) {
    let member = &event.member;
    if member.name == local_name && event.kind != MemberEventKind::Conflict {
        return;
    }
    match event.kind {
        MemberEventKind::Join => info!(peer = %member.name, addr = %member.addr, "Node joined"),
        MemberEventKind::Update => debug!(peer = %member.name, addr = %member.addr, "Node updated"),
        MemberEventKind::Leave => info!(peer = %member.name, addr = %member.addr, "Node left"),
        MemberEventKind::Conflict => {
            warn!(peer = %member.name, addr = %member.addr, "Node name conflict")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Member, MemoryNetwork};
    use std::time::Duration;

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
    ) -> GossipDirectory {
        GossipDirectory::new(
            net.node(name, addr.parse().unwrap()),
            StateStore::new(dir, name),
            ClusterState::default(),
            DirectoryConfig::default(),
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<PeerSetSnapshot>) -> PeerSetSnapshot {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot stream closed")
    }

    #[tokio::test]
    async fn test_lifecycle_and_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        let b = directory(&net, "b", "192.168.1.2", tmp.path());

        assert_eq!(a.phase(), DirectoryPhase::Unconfigured);
        assert!(a.events().is_err());
        assert!(a.join(&[]).await.is_err());

        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        b.configure(&identity("b", "10.0.0.2")).await.unwrap();
        assert_eq!(a.phase(), DirectoryPhase::Configured);

        let mut a_events = a.events().unwrap();
        assert!(matches!(a.events(), Err(OverlayError::EventsTaken)));

        a.join(&[]).await.unwrap();
        b.join(&["192.168.1.1".to_string()]).await.unwrap();
        assert_eq!(b.phase(), DirectoryPhase::Joined);

        let snapshot = loop {
            let snapshot = next(&mut a_events).await;
            if !snapshot.is_empty() {
                break snapshot;
            }
        };
        assert_eq!(snapshot.len(), 1);
        let (peer, meta) = snapshot.usable().next().unwrap();
        assert_eq!(peer.name, "b");
        assert_eq!(meta.public_key, "b-key");

        b.leave().await.unwrap();
        assert_eq!(b.phase(), DirectoryPhase::Left);
        while !next(&mut a_events).await.is_empty() {}
        assert!(a.transport.members().iter().all(|m| m.name != "b"));

        // leave is idempotent, configure after leave is refused
        b.leave().await.unwrap();
        assert!(b.configure(&identity("b", "10.0.0.2")).await.is_err());
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();

        let err = a.join(&["192.168.1.99".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            OverlayError::Transport(_) | OverlayError::NoReachablePeers(_)
        ));
        assert_eq!(a.phase(), DirectoryPhase::Configured);
    }

    #[tokio::test]
    async fn test_join_falls_back_to_remembered_peers() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        a.join(&[]).await.unwrap();

        let remembered = ClusterState {
            cluster_key: vec![],
            peers: vec![Peer::new("a", "192.168.1.1".parse().unwrap(), vec![])],
        };
        let b = GossipDirectory::new(
            net.node("b", "192.168.1.2".parse().unwrap()),
            StateStore::new(tmp.path(), "b"),
            remembered,
            DirectoryConfig::default(),
        );
        b.configure(&identity("b", "10.0.0.2")).await.unwrap();
        assert_eq!(b.join(&[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshots_are_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        let b = directory(&net, "b", "192.168.1.2", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        b.configure(&identity("b", "10.0.0.2")).await.unwrap();
        let mut a_events = a.events().unwrap();
        a.join(&[]).await.unwrap();
        b.join(&["192.168.1.1".to_string()]).await.unwrap();

        loop {
            if !next(&mut a_events).await.is_empty() {
                break;
            }
        }
        let stored = StateStore::new(tmp.path(), "a").load().await;
        assert_eq!(stored.peers.len(), 1);
        assert_eq!(stored.peers[0].name, "b");
    }

    #[tokio::test]
    async fn test_configure_rejects_oversize_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::with_metadata_limit(8);
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        let err = a
            .configure(&identity("a", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::MetadataOversize { .. }));
        assert_eq!(a.phase(), DirectoryPhase::Unconfigured);
    }

    #[tokio::test]
    async fn test_reconfigure_republishes() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        let b = directory(&net, "b", "192.168.1.2", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        b.configure(&identity("b", "10.0.0.2")).await.unwrap();
        let mut a_events = a.events().unwrap();
        a.join(&[]).await.unwrap();
        b.join(&["192.168.1.1".to_string()]).await.unwrap();

        let mut changed = identity("b", "10.0.0.2");
        changed.routes = vec!["192.168.50.0/24".parse().unwrap()];
        b.configure(&changed).await.unwrap();

        loop {
            let snapshot = next(&mut a_events).await;
            if let Some((_, meta)) = snapshot.usable().next() {
                if !meta.routes.is_empty() {
                    assert_eq!(meta.routes, changed.routes);
                    break;
                }
            };
        }
    }

    #[tokio::test]
    async fn test_local_only_join_emits_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = directory(&net, "a", "192.168.1.1", tmp.path());
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        let mut a_events = a.events().unwrap();

        a.join(&[]).await.unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(200), a_events.recv()).await;
        assert!(quiet.is_err(), "local join produced a snapshot");
    }

    /// Transport whose events are injected by the test
    struct ScriptedTransport {
        members: Vec<Member>,
        sink: Mutex<Option<mpsc::Sender<MemberEvent>>>,
    }

    #[async_trait::async_trait]
    impl MembershipTransport for ScriptedTransport {
        fn local_name(&self) -> &str {
            "a"
        }

        fn metadata_limit(&self) -> usize {
            512
        }

        fn set_metadata_provider(&self, _provider: MetadataProvider) {}

        fn set_event_sink(&self, sink: mpsc::Sender<MemberEvent>) {
            *self.sink.lock() = Some(sink);
        }

        async fn join(&self, _addrs: &[String]) -> Result<usize> {
            Ok(0)
        }

        fn members(&self) -> Vec<Member> {
            self.members.clone()
        }

        async fn update_node(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn leave(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_name_conflict_still_emits_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let member = |name: &str, addr: &str| Member {
            name: name.to_string(),
            addr: addr.parse().unwrap(),
            meta: Vec::new(),
        };
        let transport = Arc::new(ScriptedTransport {
            members: vec![
                member("a", "192.168.1.1"),
                member("b", "192.168.1.2"),
                member("c", "192.168.1.3"),
            ],
            sink: Mutex::new(None),
        });
        let a = GossipDirectory::new(
            Arc::clone(&transport) as Arc<dyn MembershipTransport>,
            StateStore::new(tmp.path(), "a"),
            ClusterState::default(),
            DirectoryConfig::default(),
        );
        a.configure(&identity("a", "10.0.0.1")).await.unwrap();
        let mut a_events = a.events().unwrap();

        let sink = transport.sink.lock().clone().unwrap();
        sink.send(MemberEvent {
            kind: MemberEventKind::Conflict,
            member: member("a", "192.168.1.9"),
        })
        .await
        .unwrap();

        let snapshot = next(&mut a_events).await;
        let mut names: Vec<_> = snapshot.peers().iter().map(|p| p.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["b", "c"]);
    }
}
