//! UDP heartbeat gossip transport
//!
//! Each node periodically sends its own record and every record it knows to
//! all known members. A member not heard from directly within
//! `dead_timeout` is declared dead. Departed names are tombstoned for the
//! same period so relayed records cannot bring them back.
//!
//! Datagram format:
//! ```text
//! +--------+---------+-------------------+------------------------+
//! | Ver(1) | Kind(1) | Body (variable)   | HMAC-SHA256(32)        |
//! +--------+---------+-------------------+------------------------+
//! ```
//!
//! The tag covers everything before it and is keyed with the cluster
//! secret. Datagrams that fail verification are dropped.

use super::{
    Delivery, Member, MemberEvent, MemberEventKind, MembershipTransport, MetadataProvider,
    PubSubNetwork,
};
use crate::codec::{put_addr, Reader};
use crate::error::{OverlayError, Result};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Default membership port
pub const DEFAULT_CLUSTER_PORT: u16 = 7946;

/// Largest metadata blob a UDP record carries
pub const UDP_METADATA_LIMIT: usize = 512;

const FRAME_VERSION: u8 = 1;
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 2;
/// Largest datagram the transport sends
const MAX_DATAGRAM: usize = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    State = 0x01,
    Leave = 0x02,
    Publish = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = OverlayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::State),
            0x02 => Ok(Self::Leave),
            0x03 => Ok(Self::Publish),
            _ => Err(OverlayError::Transport(format!(
                "unknown frame kind: 0x{value:02x}"
            ))),
        }
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct UdpGossipConfig {
    /// Node name
    pub name: String,
    /// Address to bind
    pub bind_addr: IpAddr,
    /// Port to bind; also the default port of join targets
    pub port: u16,
    /// Cluster key authenticating every datagram
    pub secret: Vec<u8>,
    /// Address advertised to peers; receivers use the source address when
    /// this is unspecified
    pub advertise_addr: Option<IpAddr>,
    pub gossip_interval: Duration,
    pub dead_timeout: Duration,
    /// How long `join` waits for answers
    pub join_timeout: Duration,
}

impl UdpGossipConfig {
    pub fn new(name: impl Into<String>, bind_addr: IpAddr, port: u16, secret: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            port,
            secret,
            advertise_addr: None,
            gossip_interval: Duration::from_secs(1),
            dead_timeout: Duration::from_secs(15),
            join_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    name: String,
    addr: SocketAddr,
    incarnation: u64,
    meta: Vec<u8>,
}

impl Record {
    fn encoded_len(&self) -> usize {
        let addr_len = if self.addr.is_ipv4() { 4 } else { 16 };
        1 + self.name.len() + 1 + addr_len + 2 + 8 + 2 + self.meta.len()
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        put_name(buf, &self.name)?;
        put_addr(buf, &self.addr.ip());
        buf.extend_from_slice(&self.addr.port().to_be_bytes());
        buf.extend_from_slice(&self.incarnation.to_be_bytes());
        let meta_len = u16::try_from(self.meta.len())
            .map_err(|_| OverlayError::Transport("metadata too large".to_string()))?;
        buf.extend_from_slice(&meta_len.to_be_bytes());
        buf.extend_from_slice(&self.meta);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let name = read_name(r)?;
        let ip = r.addr()?;
        let port = r.u16()?;
        let incarnation = r.u64()?;
        let meta_len = usize::from(r.u16()?);
        let meta = r.take(meta_len)?.to_vec();
        Ok(Self {
            name,
            addr: SocketAddr::new(ip, port),
            incarnation,
            meta,
        })
    }

    fn member(&self) -> Member {
        Member {
            name: self.name.clone(),
            addr: self.addr.ip(),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    /// Sender's own record plus the records it knows
    State {
        /// Receiver should answer with its own state
        ack: bool,
        sender: Record,
        known: Vec<Record>,
    },
    Leave {
        name: String,
        incarnation: u64,
    },
    Publish {
        from: String,
        topic: String,
        payload: Vec<u8>,
    },
}

impl Frame {
    fn kind(&self) -> FrameKind {
        match self {
            Self::State { .. } => FrameKind::State,
            Self::Leave { .. } => FrameKind::Leave,
            Self::Publish { .. } => FrameKind::Publish,
        }
    }

    fn encode(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![FRAME_VERSION, self.kind() as u8];
        match self {
            Self::State { ack, sender, known } => {
                buf.push(u8::from(*ack));
                sender.put(&mut buf)?;
                let count = u16::try_from(known.len())
                    .map_err(|_| OverlayError::Transport("too many records".to_string()))?;
                buf.extend_from_slice(&count.to_be_bytes());
                for record in known {
                    record.put(&mut buf)?;
                }
            }
            Self::Leave { name, incarnation } => {
                put_name(&mut buf, name)?;
                buf.extend_from_slice(&incarnation.to_be_bytes());
            }
            Self::Publish {
                from,
                topic,
                payload,
            } => {
                put_name(&mut buf, from)?;
                put_name(&mut buf, topic)?;
                buf.extend_from_slice(payload);
            }
        }
        if buf.len() + MAC_LEN > MAX_DATAGRAM {
            return Err(OverlayError::Transport(format!(
                "frame of {} bytes exceeds datagram limit",
                buf.len() + MAC_LEN
            )));
        }
        let tag = sign(key, &buf)?;
        buf.extend_from_slice(&tag);
        Ok(buf)
    }

    fn decode(bytes: &[u8], key: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + MAC_LEN {
            return Err(OverlayError::Transport("datagram too short".to_string()));
        }
        let (body, tag) = bytes.split_at(bytes.len() - MAC_LEN);
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| OverlayError::Transport(format!("invalid cluster key: {e}")))?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| OverlayError::Transport("datagram failed authentication".to_string()))?;

        let mut r = Reader::new(body);
        let version = r.u8()?;
        if version != FRAME_VERSION {
            return Err(OverlayError::Transport(format!(
                "unsupported frame version {version}"
            )));
        }
        let frame = match FrameKind::try_from(r.u8()?)? {
            FrameKind::State => {
                let ack = r.u8()? != 0;
                let sender = Record::read(&mut r)?;
                let count = r.u16()?;
                let mut known = Vec::with_capacity(usize::from(count).min(64));
                for _ in 0..count {
                    known.push(Record::read(&mut r)?);
                }
                r.finish()?;
                Self::State { ack, sender, known }
            }
            FrameKind::Leave => {
                let name = read_name(&mut r)?;
                let incarnation = r.u64()?;
                r.finish()?;
                Self::Leave { name, incarnation }
            }
            FrameKind::Publish => {
                let from = read_name(&mut r)?;
                let topic = read_name(&mut r)?;
                Self::Publish {
                    from,
                    topic,
                    payload: r.rest().to_vec(),
                }
            }
        };
        Ok(frame)
    }
}

fn sign(key: &[u8], data: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| OverlayError::Transport(format!("invalid cluster key: {e}")))?;
    mac.update(data);
    let mut tag = [0u8; MAC_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

fn put_name(buf: &mut Vec<u8>, name: &str) -> Result<()> {
    let len = u8::try_from(name.len())
        .map_err(|_| OverlayError::Transport(format!("name '{name}' is too long")))?;
    buf.push(len);
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

fn read_name(r: &mut Reader<'_>) -> Result<String> {
    let len = usize::from(r.u8()?);
    r.string(len)
}

struct Remote {
    record: Record,
    last_heard: Instant,
}

struct Tombstone {
    incarnation: u64,
    expires: Instant,
    /// Set for graceful leaves; those also block direct records
    left: bool,
}

struct Inner {
    incarnation: u64,
    meta: Vec<u8>,
    provider: Option<MetadataProvider>,
    sink: Option<mpsc::Sender<MemberEvent>>,
    members: HashMap<String, Remote>,
    tombstones: HashMap<String, Tombstone>,
    subscriptions: HashMap<String, mpsc::Sender<Delivery>>,
    joined: bool,
}

impl Inner {
    fn refresh_meta(&mut self) {
        if let Some(provider) = &self.provider {
            self.meta = provider(UDP_METADATA_LIMIT);
        }
    }

    /// Merge one record; `direct` is set for the sender's own record
    fn merge(
        &mut self,
        local_name: &str,
        record: Record,
        direct: bool,
        now: Instant,
        events: &mut Vec<MemberEvent>,
    ) {
        if record.name == local_name {
            if direct {
                events.push(MemberEvent {
                    kind: MemberEventKind::Conflict,
                    member: record.member(),
                });
            }
            return;
        }

        if let Some(tomb) = self.tombstones.get(&record.name) {
            let blocked = record.incarnation <= tomb.incarnation && (tomb.left || !direct);
            if blocked && now < tomb.expires {
                return;
            }
            self.tombstones.remove(&record.name);
        }

        match self.members.get_mut(&record.name) {
            None => {
                events.push(MemberEvent {
                    kind: MemberEventKind::Join,
                    member: record.member(),
                });
                self.members.insert(
                    record.name.clone(),
                    Remote {
                        record,
                        last_heard: now,
                    },
                );
            }
            Some(remote) => {
                if direct {
                    remote.last_heard = now;
                }
                if record.incarnation > remote.record.incarnation {
                    let changed =
                        record.meta != remote.record.meta || record.addr != remote.record.addr;
                    remote.record = record;
                    if changed {
                        events.push(MemberEvent {
                            kind: MemberEventKind::Update,
                            member: remote.record.member(),
                        });
                    }
                }
            }
        }
    }

    fn remove(
        &mut self,
        name: &str,
        incarnation: u64,
        left: bool,
        expires: Instant,
        events: &mut Vec<MemberEvent>,
    ) {
        if let Some(remote) = self.members.remove(name) {
            events.push(MemberEvent {
                kind: MemberEventKind::Leave,
                member: remote.record.member(),
            });
        }
        self.tombstones.insert(
            name.to_string(),
            Tombstone {
                incarnation,
                expires,
                left,
            },
        );
    }
}

struct Shared {
    config: UdpGossipConfig,
    socket: UdpSocket,
    advertise: SocketAddr,
    inner: Mutex<Inner>,
    stop: watch::Sender<bool>,
}

impl Shared {
    fn local_record(&self, inner: &Inner) -> Record {
        Record {
            name: self.config.name.clone(),
            addr: self.advertise,
            incarnation: inner.incarnation,
            meta: inner.meta.clone(),
        }
    }

    /// State frame carrying as many known records as fit in one datagram
    fn state_frame(&self, inner: &Inner, ack: bool) -> Frame {
        let sender = self.local_record(inner);
        let mut budget = MAX_DATAGRAM - MAC_LEN - HEADER_LEN - 3 - sender.encoded_len();
        let mut known = Vec::new();
        for remote in inner.members.values() {
            let len = remote.record.encoded_len();
            if len > budget {
                break;
            }
            budget -= len;
            known.push(remote.record.clone());
        }
        Frame::State { ack, sender, known }
    }

    fn peer_addrs(inner: &Inner) -> Vec<SocketAddr> {
        inner.members.values().map(|r| r.record.addr).collect()
    }

    async fn send_all(&self, frame: &Frame, targets: &[SocketAddr]) -> Result<()> {
        let bytes = frame.encode(&self.config.secret)?;
        for target in targets {
            if let Err(e) = self.socket.send_to(&bytes, target).await {
                debug!(target = %target, error = %e, "Failed to send gossip datagram");
            }
        }
        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], src: SocketAddr) {
        let frame = match Frame::decode(bytes, &self.config.secret) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(src = %src, error = %e, "Dropping datagram");
                return;
            }
        };
        let now = Instant::now();

        match frame {
            Frame::State {
                ack,
                mut sender,
                known,
            } => {
                if sender.addr.ip().is_unspecified() {
                    sender.addr = SocketAddr::new(src.ip(), sender.addr.port());
                }
                let (events, sink, reply) = {
                    let mut inner = self.inner.lock();
                    let mut events = Vec::new();
                    inner.merge(&self.config.name, sender, true, now, &mut events);
                    for record in known {
                        inner.merge(&self.config.name, record, false, now, &mut events);
                    }
                    let reply = (ack && inner.joined).then(|| self.state_frame(&inner, false));
                    (events, inner.sink.clone(), reply)
                };
                if let Some(reply) = reply {
                    if let Err(e) = self.send_all(&reply, &[src]).await {
                        debug!(error = %e, "Failed to answer join");
                    }
                }
                deliver(sink, events).await;
            }
            Frame::Leave { name, incarnation } => {
                let (events, sink) = {
                    let mut inner = self.inner.lock();
                    let mut events = Vec::new();
                    inner.remove(
                        &name,
                        incarnation,
                        true,
                        now + self.config.dead_timeout,
                        &mut events,
                    );
                    (events, inner.sink.clone())
                };
                deliver(sink, events).await;
            }
            Frame::Publish {
                from,
                topic,
                payload,
            } => {
                let sink = self.inner.lock().subscriptions.get(&topic).cloned();
                if let Some(sink) = sink {
                    let delivery = Delivery {
                        from,
                        transport_addr: src.ip(),
                        payload,
                    };
                    let _ = sink.send(delivery).await;
                }
            }
        }
    }

    /// Expire silent members and spread local state
    async fn gossip_round(&self) {
        let now = Instant::now();
        let (events, sink, frame, targets) = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            let dead: Vec<(String, u64)> = inner
                .members
                .iter()
                .filter(|(_, r)| now.duration_since(r.last_heard) > self.config.dead_timeout)
                .map(|(name, r)| (name.clone(), r.record.incarnation))
                .collect();
            for (name, incarnation) in dead {
                warn!(peer = %name, "Member stopped responding");
                inner.remove(
                    &name,
                    incarnation,
                    false,
                    now + self.config.dead_timeout,
                    &mut events,
                );
            }
            inner.tombstones.retain(|_, t| t.expires > now);

            let frame = inner.joined.then(|| self.state_frame(&inner, false));
            (events, inner.sink.clone(), frame, Self::peer_addrs(&inner))
        };
        if let Some(frame) = frame {
            if let Err(e) = self.send_all(&frame, &targets).await {
                warn!(error = %e, "Failed to send gossip");
            }
        }
        deliver(sink, events).await;
    }

    fn answered(&self, targets: &[SocketAddr]) -> usize {
        let inner = self.inner.lock();
        targets
            .iter()
            .filter(|t| {
                inner
                    .members
                    .values()
                    .any(|r| r.record.addr.ip() == t.ip())
            })
            .count()
    }
}

async fn deliver(sink: Option<mpsc::Sender<MemberEvent>>, events: Vec<MemberEvent>) {
    let Some(sink) = sink else {
        return;
    };
    for event in events {
        if sink.send(event).await.is_err() {
            break;
        }
    }
}

async fn recv_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((n, src)) => shared.handle_datagram(&buf[..n], src).await,
                Err(e) => debug!(error = %e, "UDP receive failed"),
            },
        }
    }
}

async fn gossip_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.gossip_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => shared.gossip_round().await,
        }
    }
}

/// UDP gossip transport implementing both membership traits
pub struct UdpGossip {
    shared: Arc<Shared>,
}

impl UdpGossip {
    /// Bind the socket and start the receive and gossip tasks
    pub async fn bind(config: UdpGossipConfig) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(OverlayError::InvalidKey(
                "gossip transport needs a cluster key".to_string(),
            ));
        }
        let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr, config.port))
            .await
            .map_err(|e| {
                OverlayError::Transport(format!(
                    "failed to bind {}:{}: {e}",
                    config.bind_addr, config.port
                ))
            })?;
        let bound = socket.local_addr()?;
        let advertise = SocketAddr::new(config.advertise_addr.unwrap_or(bound.ip()), bound.port());

        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            socket,
            advertise,
            inner: Mutex::new(Inner {
                incarnation: initial_incarnation(),
                meta: Vec::new(),
                provider: None,
                sink: None,
                members: HashMap::new(),
                tombstones: HashMap::new(),
                subscriptions: HashMap::new(),
                joined: false,
            }),
            stop,
            config,
        });

        tokio::spawn(recv_loop(Arc::clone(&shared), shared.stop.subscribe()));
        tokio::spawn(gossip_loop(Arc::clone(&shared), shared.stop.subscribe()));
        info!(node = %shared.config.name, addr = %bound, "Gossip transport listening");
        Ok(Self { shared })
    }

    /// Bound socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    async fn resolve(&self, target: &str) -> Option<SocketAddr> {
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Some(addr);
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, self.shared.config.port));
        }
        let lookup = if target.contains(':') {
            tokio::net::lookup_host(target)
                .await
                .map(|mut addrs| addrs.next())
        } else {
            tokio::net::lookup_host((target, self.shared.config.port))
                .await
                .map(|mut addrs| addrs.next())
        };
        match lookup {
            Ok(addr) => addr,
            Err(e) => {
                warn!(target = %target, error = %e, "Failed to resolve join target");
                None
            }
        }
    }
}

impl Drop for UdpGossip {
    fn drop(&mut self) {
        let _ = self.shared.stop.send(true);
    }
}

fn initial_incarnation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(1)
}

#[async_trait::async_trait]
impl MembershipTransport for UdpGossip {
    fn local_name(&self) -> &str {
        &self.shared.config.name
    }

    fn metadata_limit(&self) -> usize {
        UDP_METADATA_LIMIT
    }

    fn set_metadata_provider(&self, provider: MetadataProvider) {
        let mut inner = self.shared.inner.lock();
        inner.provider = Some(provider);
        inner.refresh_meta();
    }

    fn set_event_sink(&self, sink: mpsc::Sender<MemberEvent>) {
        self.shared.inner.lock().sink = Some(sink);
    }

    async fn join(&self, addrs: &[String]) -> Result<usize> {
        let (first_join, sink, local) = {
            let mut inner = self.shared.inner.lock();
            inner.refresh_meta();
            let first_join = !std::mem::replace(&mut inner.joined, true);
            (
                first_join,
                inner.sink.clone(),
                self.shared.local_record(&inner).member(),
            )
        };
        if first_join {
            let event = MemberEvent {
                kind: MemberEventKind::Join,
                member: local,
            };
            deliver(sink, vec![event]).await;
        }
        if addrs.is_empty() {
            return Ok(0);
        }

        let mut targets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if let Some(resolved) = self.resolve(addr).await {
                targets.push(resolved);
            }
        }
        let frame = {
            let inner = self.shared.inner.lock();
            self.shared.state_frame(&inner, true)
        };
        self.shared.send_all(&frame, &targets).await?;

        let deadline = Instant::now() + self.shared.config.join_timeout;
        let mut answered = self.shared.answered(&targets);
        while answered < targets.len() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            answered = self.shared.answered(&targets);
        }
        if answered == 0 {
            return Err(OverlayError::Transport(format!(
                "no response from any of {} addresses",
                addrs.len()
            )));
        }
        Ok(answered)
    }

    fn members(&self) -> Vec<Member> {
        let inner = self.shared.inner.lock();
        let mut members = Vec::with_capacity(inner.members.len() + 1);
        members.push(self.shared.local_record(&inner).member());
        members.extend(inner.members.values().map(|r| r.record.member()));
        members
    }

    async fn update_node(&self, timeout: Duration) -> Result<()> {
        let (frame, targets) = {
            let mut inner = self.shared.inner.lock();
            inner.refresh_meta();
            inner.incarnation += 1;
            (
                self.shared.state_frame(&inner, false),
                Shared::peer_addrs(&inner),
            )
        };
        tokio::time::timeout(timeout, self.shared.send_all(&frame, &targets))
            .await
            .map_err(|_| OverlayError::Transport("metadata update timed out".to_string()))?
    }

    async fn leave(&self, timeout: Duration) -> Result<()> {
        let (frame, targets) = {
            let mut inner = self.shared.inner.lock();
            inner.joined = false;
            let frame = Frame::Leave {
                name: self.shared.config.name.clone(),
                incarnation: inner.incarnation,
            };
            (frame, Shared::peer_addrs(&inner))
        };
        debug!(peers = targets.len(), "Broadcasting leave");
        tokio::time::timeout(timeout, self.shared.send_all(&frame, &targets))
            .await
            .map_err(|_| OverlayError::Transport("leave broadcast timed out".to_string()))?
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.shared.stop.send(true);
        let mut inner = self.shared.inner.lock();
        inner.joined = false;
        inner.sink = None;
        inner.provider = None;
        inner.subscriptions.clear();
        Ok(())
    }
}

#[async_trait::async_trait]
impl PubSubNetwork for UdpGossip {
    fn local_id(&self) -> &str {
        &self.shared.config.name
    }

    async fn connect(&self, addrs: &[String]) -> Result<usize> {
        MembershipTransport::join(self, addrs).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let targets = Shared::peer_addrs(&self.shared.inner.lock());
        let frame = Frame::Publish {
            from: self.shared.config.name.clone(),
            topic: topic.to_string(),
            payload,
        };
        self.shared.send_all(&frame, &targets).await
    }

    fn subscribe(&self, topic: &str, sink: mpsc::Sender<Delivery>) -> Result<()> {
        self.shared
            .inner
            .lock()
            .subscriptions
            .insert(topic.to_string(), sink);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        MembershipTransport::shutdown(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn record(name: &str, incarnation: u64) -> Record {
        Record {
            name: name.to_string(),
            addr: "192.168.1.5:7946".parse().unwrap(),
            incarnation,
            meta: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_frame_roundtrip_and_auth() {
        let frame = Frame::State {
            ack: true,
            sender: record("a", 7),
            known: vec![record("b", 3)],
        };
        let bytes = frame.encode(KEY).unwrap();
        assert_eq!(Frame::decode(&bytes, KEY).unwrap(), frame);

        assert!(Frame::decode(&bytes, b"another key").is_err());
        let mut tampered = bytes.clone();
        tampered[4] ^= 0xff;
        assert!(Frame::decode(&tampered, KEY).is_err());
        assert!(Frame::decode(&bytes[..10], KEY).is_err());
    }

    #[test]
    fn test_merge_join_update_and_tombstone() {
        let mut inner = Inner {
            incarnation: 1,
            meta: vec![],
            provider: None,
            sink: None,
            members: HashMap::new(),
            tombstones: HashMap::new(),
            subscriptions: HashMap::new(),
            joined: true,
        };
        let now = Instant::now();
        let mut events = Vec::new();

        inner.merge("self", record("b", 1), false, now, &mut events);
        assert_eq!(events.pop().unwrap().kind, MemberEventKind::Join);

        let mut newer = record("b", 2);
        newer.meta = vec![9];
        inner.merge("self", newer, true, now, &mut events);
        assert_eq!(events.pop().unwrap().kind, MemberEventKind::Update);

        // an older incarnation is ignored
        inner.merge("self", record("b", 1), true, now, &mut events);
        assert!(events.is_empty());

        inner.remove("b", 2, true, now + Duration::from_secs(15), &mut events);
        assert_eq!(events.pop().unwrap().kind, MemberEventKind::Leave);

        // relayed stale record does not resurrect the node
        inner.merge("self", record("b", 2), false, now, &mut events);
        assert!(events.is_empty());
        assert!(inner.members.is_empty());

        // a restarted node with a higher incarnation comes back
        inner.merge("self", record("b", 3), true, now, &mut events);
        assert_eq!(events.pop().unwrap().kind, MemberEventKind::Join);
    }

    #[test]
    fn test_merge_flags_name_conflict() {
        let mut inner = Inner {
            incarnation: 1,
            meta: vec![],
            provider: None,
            sink: None,
            members: HashMap::new(),
            tombstones: HashMap::new(),
            subscriptions: HashMap::new(),
            joined: true,
        };
        let mut events = Vec::new();
        inner.merge("b", record("b", 1), true, Instant::now(), &mut events);
        assert_eq!(events.pop().unwrap().kind, MemberEventKind::Conflict);
        assert!(inner.members.is_empty());
    }

    async fn node(name: &str) -> UdpGossip {
        let mut config = UdpGossipConfig::new(name, "127.0.0.1".parse().unwrap(), 0, KEY.to_vec());
        config.gossip_interval = Duration::from_millis(50);
        config.dead_timeout = Duration::from_millis(500);
        UdpGossip::bind(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_two_nodes_join_and_leave() {
        let a = node("a").await;
        let b = node("b").await;
        let (a_tx, mut a_rx) = mpsc::channel(100);
        a.set_event_sink(a_tx);
        a.set_metadata_provider(Arc::new(|_| b"meta-a".to_vec()));
        b.set_metadata_provider(Arc::new(|_| b"meta-b".to_vec()));

        a.join(&[]).await.unwrap();
        let target = a.local_addr().unwrap().to_string();
        assert_eq!(b.join(&[target]).await.unwrap(), 1);

        let event = loop {
            let event = a_rx.recv().await.unwrap();
            if event.member.name == "b" {
                break event;
            }
        };
        assert_eq!(event.kind, MemberEventKind::Join);
        assert_eq!(event.member.meta, b"meta-b");
        assert_eq!(b.members().len(), 2);

        b.leave(Duration::from_secs(1)).await.unwrap();
        let event = a_rx.recv().await.unwrap();
        assert_eq!(event.kind, MemberEventKind::Leave);
        assert_eq!(event.member.name, "b");
        MembershipTransport::shutdown(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_join_targets() {
        let a = node("a").await;
        let port = a.shared.config.port;

        let addr = a.resolve("192.168.1.7").await.unwrap();
        assert_eq!(addr, SocketAddr::new("192.168.1.7".parse().unwrap(), port));

        let addr = a.resolve("localhost").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), port);

        let addr = a.resolve("localhost:7000").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 7000);
    }

    #[tokio::test]
    async fn test_wrong_key_cannot_join() {
        let a = node("a").await;
        a.join(&[]).await.unwrap();
        let mut config =
            UdpGossipConfig::new("b", "127.0.0.1".parse().unwrap(), 0, b"wrong".to_vec());
        config.join_timeout = Duration::from_millis(200);
        let b = UdpGossip::bind(config).await.unwrap();
        let target = a.local_addr().unwrap().to_string();
        assert!(b.join(&[target]).await.is_err());
        assert_eq!(a.members().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_member_is_declared_dead() {
        let a = node("a").await;
        let (a_tx, mut a_rx) = mpsc::channel(100);
        a.set_event_sink(a_tx);
        a.join(&[]).await.unwrap();
        {
            let b = node("b").await;
            b.join(&[a.local_addr().unwrap().to_string()]).await.unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = a_rx.recv().await.unwrap();
                if event.kind == MemberEventKind::Leave {
                    break event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.member.name, "b");
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let a = node("a").await;
        let b = node("b").await;
        let (tx, mut rx) = mpsc::channel(10);
        b.subscribe("announces", tx).unwrap();
        a.connect(&[]).await.unwrap();
        b.connect(&[a.local_addr().unwrap().to_string()]).await.unwrap();

        a.publish("announces", b"hello".to_vec()).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.from, "a");
        assert_eq!(delivery.payload, b"hello");
    }
}
