//! meshweave overlay - membership-driven WireGuard mesh
//!
//! Each node discovers its peers through a membership backend, derives its
//! overlay address from its name, publishes a small metadata blob (overlay
//! address, tunnel public key, announced routes) and keeps a local WireGuard
//! interface configured so every peer is a routable neighbor.
//!
//! # Modules
//!
//! - [`allocator`] - deterministic overlay address allocation
//! - [`codec`] - peer metadata wire format
//! - [`state`] - on-disk cluster key and last known peers
//! - [`membership`] - membership directory and its transports
//! - [`join`] - join with backoff
//! - [`wireguard`] - tunnel driver
//! - [`host`] - interface addresses, MTU and routes
//! - [`reconciler`] - snapshot to interface reconciliation
//! - [`agent`] - the loop tying it all together
//!
//! # Example
//!
//! ```ignore
//! use meshweave_overlay::*;
//! use std::sync::Arc;
//!
//! let config = OverlayConfig::default();
//! let store = StateStore::new("/var/lib/meshweave", DEFAULT_CLUSTER_NAME);
//! let mut state = store.load().await;
//! state.ensure_cluster_key(None)?;
//!
//! let gossip = UdpGossip::bind(UdpGossipConfig::new(
//!     "node-a",
//!     "0.0.0.0".parse()?,
//!     DEFAULT_CLUSTER_PORT,
//!     state.cluster_key.clone(),
//! ))
//! .await?;
//! let directory =
//!     GossipDirectory::new(Arc::new(gossip), store, state, DirectoryConfig::default());
//!
//! let keys = generate_keys();
//! let identity = local_identity("node-a", &keys.public_key, &config)?;
//! let reconciler = Reconciler::new(
//!     config.clone(),
//!     keys.private_key,
//!     Arc::new(WgCommandDriver::default()),
//!     Arc::new(IpCommandNetwork::new()),
//! );
//!
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! Agent::new(Arc::new(directory), reconciler, identity, seeds, config)
//!     .run(rx)
//!     .await?;
//! ```

pub mod agent;
pub mod allocator;
mod cmd;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod join;
pub mod membership;
pub mod peer;
pub mod reconciler;
pub mod state;
pub mod wireguard;

pub use agent::{local_identity, Agent};
pub use allocator::{allocate, host_net, validate_overlay_net};
pub use config::OverlayConfig;
pub use error::{OverlayError, ReconcileStep, Result};
pub use host::{HostNetwork, IpCommandNetwork, MockHostNetwork, Route, RouteScope};
pub use join::{run_join, JoinBackoff};
pub use membership::{
    DirectoryConfig, DirectoryPhase, GossipDirectory, MembershipDirectory, MembershipTransport,
    MemoryNetwork, PubSubConfig, PubSubDirectory, PubSubNetwork, UdpGossip, UdpGossipConfig,
    DEFAULT_CLUSTER_PORT, DEFAULT_EVENT_BACKLOG,
};
pub use peer::{LocalIdentity, Peer, PeerMeta, PeerSetSnapshot};
pub use reconciler::{ReconcileReport, Reconciler};
pub use state::{ClusterState, StateStore, DEFAULT_CLUSTER_NAME};
pub use wireguard::{
    derive_public_key, generate_keys, DeviceConfig, DeviceState, KeyPair, MockTunnelDriver,
    PeerConfig, TunnelDriver, WgCommandDriver,
};
