//! Traits for the membership collaborators
//!
//! [`MembershipTransport`] is a memberlist-style gossip layer: it carries a
//! small metadata blob per node and reports join, update and leave events.
//! [`PubSubNetwork`] is a topic broadcast layer used by the announcement
//! based directory.

use crate::error::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport-level view of a cluster member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub meta: Vec<u8>,
}

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Update,
    Leave,
    /// Two nodes claim the same name
    Conflict,
}

/// Membership change reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub member: Member,
}

/// Produces the local metadata blob; the argument is the size limit
pub type MetadataProvider = Arc<dyn Fn(usize) -> Vec<u8> + Send + Sync>;

/// Gossip membership transport
///
/// Events are delivered with `send().await` on the sink, so a consumer that
/// stops draining the sink stalls the transport's delivery task.
#[async_trait::async_trait]
pub trait MembershipTransport: Send + Sync {
    /// Name this node is known by
    fn local_name(&self) -> &str;

    /// Largest metadata blob the transport can carry
    fn metadata_limit(&self) -> usize;

    /// Install the callback that supplies this node's metadata
    fn set_metadata_provider(&self, provider: MetadataProvider);

    /// Install the sink membership events are delivered to
    fn set_event_sink(&self, sink: mpsc::Sender<MemberEvent>);

    /// Contact the given addresses, returning how many answered
    async fn join(&self, addrs: &[String]) -> Result<usize>;

    /// All live members, including the local node
    fn members(&self) -> Vec<Member>;

    /// Re-read local metadata and spread it to the cluster
    async fn update_node(&self, timeout: Duration) -> Result<()>;

    /// Announce departure, waiting at most `timeout`
    async fn leave(&self, timeout: Duration) -> Result<()>;

    /// Stop all background work
    async fn shutdown(&self) -> Result<()>;
}

/// Message received on a pub/sub topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Network identity of the publisher
    pub from: String,
    /// Address the message arrived from
    pub transport_addr: IpAddr,
    pub payload: Vec<u8>,
}

/// Topic broadcast network
#[async_trait::async_trait]
pub trait PubSubNetwork: Send + Sync {
    fn local_id(&self) -> &str;

    /// Connect to bootstrap addresses, returning how many answered
    async fn connect(&self, addrs: &[String]) -> Result<usize>;

    /// Publish to the subscribers of `topic` on other nodes
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Deliver messages published on `topic` by other nodes to `sink`
    fn subscribe(&self, topic: &str, sink: mpsc::Sender<Delivery>) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}
