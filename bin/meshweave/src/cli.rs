use clap::{ArgAction, Parser, ValueEnum};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Membership backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Backend {
    /// Membership gossip; peers are members of the gossip cluster
    #[default]
    Gossip,
    /// Periodic announcements on a broadcast topic
    Pubsub,
}

/// Self-healing WireGuard mesh driven by cluster membership
///
/// Every option can also be given in the YAML config file (same name with
/// underscores) or as a `MESHWEAVE_*` environment variable. Command line and
/// environment win over the file.
#[derive(Debug, Parser)]
#[command(name = "meshweave")]
#[command(version, about)]
pub(crate) struct Cli {
    /// YAML config file
    #[arg(short, long, env = "MESHWEAVE_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Shared cluster key, 32 bytes base64 encoded; generated when absent
    #[arg(long, env = "MESHWEAVE_CLUSTER_KEY", hide_env_values = true)]
    pub(crate) cluster_key: Option<String>,

    /// Comma separated addresses of existing members; remembered peers are
    /// used when empty
    #[arg(long, env = "MESHWEAVE_JOIN", value_delimiter = ',')]
    pub(crate) join: Vec<String>,

    /// Forget stored cluster state and start a fresh cluster
    #[arg(long, env = "MESHWEAVE_INIT")]
    pub(crate) init: bool,

    /// Address for membership traffic (conflicts with --bind-iface)
    #[arg(long, env = "MESHWEAVE_BIND_ADDR", conflicts_with = "bind_iface")]
    pub(crate) bind_addr: Option<IpAddr>,

    /// Interface whose first address is used for membership traffic
    #[arg(long, env = "MESHWEAVE_BIND_IFACE")]
    pub(crate) bind_iface: Option<String>,

    /// Membership port, identical across the cluster
    #[arg(long, env = "MESHWEAVE_CLUSTER_PORT")]
    pub(crate) cluster_port: Option<u16>,

    /// WireGuard port, identical across the cluster
    #[arg(long, env = "MESHWEAVE_WIREGUARD_PORT")]
    pub(crate) wireguard_port: Option<u16>,

    /// Network to allocate overlay addresses in
    #[arg(long, env = "MESHWEAVE_OVERLAY_NET")]
    pub(crate) overlay_net: Option<IpNet>,

    /// Networks peers may announce routes within (repeatable)
    #[arg(long = "routed-net", env = "MESHWEAVE_ROUTED_NETS", value_delimiter = ',')]
    pub(crate) routed_nets: Vec<IpNet>,

    /// Networks to announce as reachable through this node (repeatable)
    #[arg(long = "announce-route", env = "MESHWEAVE_ANNOUNCE_ROUTES", value_delimiter = ',')]
    pub(crate) announced_routes: Vec<IpNet>,

    /// WireGuard interface to manage
    #[arg(long, env = "MESHWEAVE_INTERFACE")]
    pub(crate) interface: Option<String>,

    #[arg(long, env = "MESHWEAVE_MTU")]
    pub(crate) mtu: Option<u32>,

    /// Keepalive sent to peers, e.g. `25s`; `0s` disables it
    #[arg(long, env = "MESHWEAVE_PERSISTENT_KEEPALIVE", value_parser = parse_duration)]
    pub(crate) persistent_keepalive: Option<Duration>,

    /// Period of the refresh reconciliation, e.g. `60s`
    #[arg(long, env = "MESHWEAVE_RECONCILE_INTERVAL", value_parser = parse_duration)]
    pub(crate) reconcile_interval: Option<Duration>,

    /// Capacity of the membership event queue
    #[arg(long, env = "MESHWEAVE_EVENT_BACKLOG")]
    pub(crate) event_backlog: Option<usize>,

    /// Directory holding the cluster state file
    #[arg(long, env = "MESHWEAVE_STATE_DIR")]
    pub(crate) state_dir: Option<PathBuf>,

    /// Cluster name, used as the state file name
    #[arg(long, env = "MESHWEAVE_CLUSTER_NAME")]
    pub(crate) cluster_name: Option<String>,

    #[arg(long, env = "MESHWEAVE_BACKEND", value_enum)]
    pub(crate) backend: Option<Backend>,

    /// How often pub/sub announcements are sent, e.g. `10s`
    #[arg(long, env = "MESHWEAVE_ANNOUNCE_INTERVAL", value_parser = parse_duration)]
    pub(crate) announce_interval: Option<Duration>,

    /// Node name; defaults to the hostname
    #[arg(long, env = "MESHWEAVE_NAME")]
    pub(crate) name: Option<String>,

    /// Use the bind address as node name
    #[arg(long, env = "MESHWEAVE_IP_AS_NAME", hide = true)]
    pub(crate) ip_as_name: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "MESHWEAVE_LOG_LEVEL")]
    pub(crate) log_level: Option<String>,

    /// Log format (pretty, json, compact)
    #[arg(long, env = "MESHWEAVE_LOG_FORMAT")]
    pub(crate) log_format: Option<String>,

    /// Raise verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub(crate) verbose: u8,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}
