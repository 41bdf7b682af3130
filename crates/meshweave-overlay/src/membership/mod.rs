//! Membership directory
//!
//! A directory wraps a membership backend, publishes the local node's
//! metadata and turns membership changes into full [`PeerSetSnapshot`]s.
//! Every emitted snapshot is also persisted through the [`StateStore`].
//!
//! Two backends share the [`MembershipDirectory`] contract:
//!
//! - [`GossipDirectory`] over a [`MembershipTransport`]
//! - [`PubSubDirectory`] over a [`PubSubNetwork`]
//!
//! # Event backlog
//!
//! Transport events are queued into a bounded channel of `event_backlog`
//! entries before the directory's forwarding task turns them into snapshots.
//! The transport blocks while that queue is full, so the forwarding task must
//! keep draining it. Snapshots leave the directory on an unbounded channel,
//! which keeps the forwarding task live even while the agent is busy
//! reconciling. A backlog that is too small only slows delivery; a forwarding
//! task that stops draining stalls the transport.
//!
//! [`StateStore`]: crate::state::StateStore

mod gossip;
mod memory;
mod pubsub;
mod transport;
mod udp;

pub use gossip::GossipDirectory;
pub use memory::{MemoryNetwork, MemoryNode};
pub use pubsub::{PubSubConfig, PubSubDirectory, DEFAULT_ANNOUNCE_TOPIC};
pub use transport::{
    Delivery, Member, MemberEvent, MemberEventKind, MembershipTransport, MetadataProvider,
    PubSubNetwork,
};
pub use udp::{UdpGossip, UdpGossipConfig, DEFAULT_CLUSTER_PORT, UDP_METADATA_LIMIT};

use crate::error::{OverlayError, Result};
use crate::peer::{LocalIdentity, PeerSetSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default capacity of the transport-to-directory event queue
pub const DEFAULT_EVENT_BACKLOG: usize = 100;

/// Lifecycle of a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryPhase {
    Unconfigured,
    Configured,
    Joined,
    Left,
}

impl fmt::Display for DirectoryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Joined => "joined",
            Self::Left => "left",
        };
        f.write_str(phase)
    }
}

/// Settings shared by both directory backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Capacity of the transport-to-directory event queue
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,

    /// Bound on the graceful leave broadcast
    #[serde(default = "default_leave_timeout", with = "humantime_serde")]
    pub leave_timeout: Duration,

    /// Bound on spreading updated local metadata
    #[serde(default = "default_update_timeout", with = "humantime_serde")]
    pub update_timeout: Duration,
}

fn default_event_backlog() -> usize {
    DEFAULT_EVENT_BACKLOG
}

fn default_leave_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_update_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            event_backlog: DEFAULT_EVENT_BACKLOG,
            leave_timeout: default_leave_timeout(),
            update_timeout: default_update_timeout(),
        }
    }
}

/// Live peer set of the cluster
///
/// Lifecycle is `Unconfigured -> Configured -> Joined -> Left`. The snapshot
/// stream returned by [`events`](Self::events) may be consumed before
/// [`join`](Self::join) returns.
#[async_trait::async_trait]
pub trait MembershipDirectory: Send + Sync {
    fn local_name(&self) -> &str;

    /// Publish `identity` as the local metadata
    ///
    /// The first call installs the metadata provider and the event sink and
    /// starts the forwarding task. Later calls republish changed metadata.
    async fn configure(&self, identity: &LocalIdentity) -> Result<()>;

    /// Join the cluster through `seeds`, or through the remembered peers if
    /// `seeds` is empty
    async fn join(&self, seeds: &[String]) -> Result<usize>;

    /// Take the snapshot stream; can only be taken once
    fn events(&self) -> Result<mpsc::UnboundedReceiver<PeerSetSnapshot>>;

    /// Persist state, leave gracefully and shut the backend down
    async fn leave(&self) -> Result<()>;

    fn phase(&self) -> DirectoryPhase;
}

/// Join targets: explicit seeds, else remembered peer addresses
pub(crate) fn join_targets(seeds: &[String], remembered: Vec<String>) -> Vec<String> {
    if seeds.is_empty() {
        remembered
    } else {
        seeds.to_vec()
    }
}

pub(crate) fn invalid_phase(op: &str, phase: DirectoryPhase) -> OverlayError {
    OverlayError::InvalidState(format!("cannot {op} while {phase}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_targets_fallback() {
        let remembered = vec!["192.168.1.1".to_string()];
        assert_eq!(join_targets(&[], remembered.clone()), remembered);
        assert_eq!(
            join_targets(&["10.1.1.1".to_string()], remembered),
            vec!["10.1.1.1".to_string()]
        );
    }

    #[test]
    fn test_directory_config_defaults_fill_missing() {
        let config: DirectoryConfig = serde_json::from_str("{\"event_backlog\": 5}").unwrap();
        assert_eq!(config.event_backlog, 5);
        assert_eq!(config.leave_timeout, Duration::from_secs(10));
    }
}
