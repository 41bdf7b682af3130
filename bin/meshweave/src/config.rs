//! Agent configuration: YAML file plus command line and environment overrides

use crate::cli::{Backend, Cli};
use anyhow::{bail, ensure, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use meshweave_observability::LoggingConfig;
use meshweave_overlay::state::CLUSTER_KEY_LEN;
use meshweave_overlay::{
    DirectoryConfig, OverlayConfig, PubSubConfig, DEFAULT_CLUSTER_NAME, DEFAULT_CLUSTER_PORT,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// UDP transport timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GossipSettings {
    /// Address advertised to peers instead of the bind address
    #[serde(default)]
    pub(crate) advertise_addr: Option<IpAddr>,

    #[serde(default = "default_gossip_interval", with = "humantime_serde")]
    pub(crate) gossip_interval: Duration,

    #[serde(default = "default_dead_timeout", with = "humantime_serde")]
    pub(crate) dead_timeout: Duration,

    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub(crate) join_timeout: Duration,
}

fn default_gossip_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_dead_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            advertise_addr: None,
            gossip_interval: default_gossip_interval(),
            dead_timeout: default_dead_timeout(),
            join_timeout: default_join_timeout(),
        }
    }
}

/// Full agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Config {
    /// Base64 cluster key
    #[serde(default)]
    pub(crate) cluster_key: Option<String>,

    #[serde(default)]
    pub(crate) join: Vec<String>,

    #[serde(default)]
    pub(crate) init: bool,

    #[serde(default)]
    pub(crate) bind_addr: Option<IpAddr>,

    #[serde(default)]
    pub(crate) bind_iface: Option<String>,

    #[serde(default = "default_cluster_port")]
    pub(crate) cluster_port: u16,

    #[serde(default)]
    pub(crate) name: Option<String>,

    #[serde(default)]
    pub(crate) ip_as_name: bool,

    #[serde(default = "default_state_dir")]
    pub(crate) state_dir: PathBuf,

    #[serde(default = "default_cluster_name")]
    pub(crate) cluster_name: String,

    #[serde(default)]
    pub(crate) backend: Backend,

    /// Interface, addressing and agent loop settings
    #[serde(flatten)]
    pub(crate) overlay: OverlayConfig,

    /// Event backlog and leave/update timeouts
    #[serde(flatten)]
    pub(crate) directory: DirectoryConfig,

    #[serde(default)]
    pub(crate) gossip: GossipSettings,

    #[serde(default)]
    pub(crate) pubsub: PubSubConfig,

    #[serde(default)]
    pub(crate) log: LoggingConfig,
}

fn default_cluster_port() -> u16 {
    DEFAULT_CLUSTER_PORT
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshweave")
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_key: None,
            join: Vec::new(),
            init: false,
            bind_addr: None,
            bind_iface: None,
            cluster_port: default_cluster_port(),
            name: None,
            ip_as_name: false,
            state_dir: default_state_dir(),
            cluster_name: default_cluster_name(),
            backend: Backend::default(),
            overlay: OverlayConfig::default(),
            directory: DirectoryConfig::default(),
            gossip: GossipSettings::default(),
            pubsub: PubSubConfig::default(),
            log: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load the file named by `--config` (if any) and apply the overrides
    pub(crate) fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(cli)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Command line and environment values replace file values
    fn apply(&mut self, cli: &Cli) -> Result<()> {
        if cli.cluster_key.is_some() {
            self.cluster_key.clone_from(&cli.cluster_key);
        }
        if !cli.join.is_empty() {
            self.join.clone_from(&cli.join);
        }
        self.init |= cli.init;
        if let Some(addr) = cli.bind_addr {
            self.bind_addr = Some(addr);
            self.bind_iface = None;
        }
        if let Some(iface) = &cli.bind_iface {
            self.bind_iface = Some(iface.clone());
            self.bind_addr = None;
        }
        if let Some(port) = cli.cluster_port {
            self.cluster_port = port;
        }
        if let Some(port) = cli.wireguard_port {
            self.overlay.listen_port = port;
        }
        if let Some(net) = cli.overlay_net {
            self.overlay.overlay_net = net;
        }
        if !cli.routed_nets.is_empty() {
            self.overlay.routed_nets.clone_from(&cli.routed_nets);
        }
        if !cli.announced_routes.is_empty() {
            self.overlay.announced_routes.clone_from(&cli.announced_routes);
        }
        if let Some(interface) = &cli.interface {
            self.overlay.interface.clone_from(interface);
        }
        if let Some(mtu) = cli.mtu {
            self.overlay.mtu = mtu;
        }
        if let Some(keepalive) = cli.persistent_keepalive {
            self.overlay.persistent_keepalive = (!keepalive.is_zero()).then_some(keepalive);
        }
        if let Some(interval) = cli.reconcile_interval {
            self.overlay.reconcile_interval = interval;
        }
        if let Some(backlog) = cli.event_backlog {
            self.directory.event_backlog = backlog;
        }
        if let Some(dir) = &cli.state_dir {
            self.state_dir.clone_from(dir);
        }
        if let Some(name) = &cli.cluster_name {
            self.cluster_name.clone_from(name);
        }
        if let Some(backend) = cli.backend {
            self.backend = backend;
        }
        if let Some(interval) = cli.announce_interval {
            self.pubsub.announce_interval = interval;
        }
        if cli.name.is_some() {
            self.name.clone_from(&cli.name);
        }
        self.ip_as_name |= cli.ip_as_name;
        if let Some(level) = &cli.log_level {
            self.log.level = level.parse()?;
        }
        if let Some(format) = &cli.log_format {
            self.log.format = format.parse()?;
        }
        self.log.level = self.log.level.raised(cli.verbose);
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.cluster_key_bytes()?;
        self.overlay.validate()?;
        if self.bind_addr.is_some() && self.bind_iface.is_some() {
            bail!("bind_addr and bind_iface cannot both be set");
        }
        ensure!(self.directory.event_backlog >= 1, "event_backlog must be at least 1");
        ensure!(
            !self.cluster_name.is_empty() && !self.cluster_name.contains('/'),
            "cluster_name {:?} is not a valid file name",
            self.cluster_name
        );
        ensure!(
            self.gossip.dead_timeout > self.gossip.gossip_interval,
            "gossip dead_timeout must exceed gossip_interval"
        );
        ensure!(
            self.pubsub.announce_timeout > self.pubsub.announce_interval,
            "pubsub announce_timeout must exceed announce_interval"
        );
        Ok(())
    }

    /// Decoded cluster key, if one is configured
    pub(crate) fn cluster_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = &self.cluster_key else {
            return Ok(None);
        };
        let key = STANDARD
            .decode(encoded.trim())
            .context("cluster_key is not valid base64")?;
        ensure!(
            key.len() == CLUSTER_KEY_LEN,
            "cluster_key must be {CLUSTER_KEY_LEN} bytes, got {}",
            key.len()
        );
        Ok(Some(key))
    }

    /// Bind address without interface lookup
    pub(crate) fn static_bind_addr(&self) -> IpAddr {
        self.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Node name: explicit, the bind address with `ip_as_name`, else the hostname
    pub(crate) fn node_name(&self, bind_addr: IpAddr) -> Result<String> {
        if let Some(name) = &self.name {
            ensure!(!name.is_empty(), "name must not be empty");
            return Ok(name.clone());
        }
        if self.ip_as_name {
            ensure!(
                !bind_addr.is_unspecified(),
                "ip_as_name needs a concrete bind address"
            );
            return Ok(bind_addr.to_string());
        }
        let host = hostname::get().context("Failed to read hostname")?;
        Ok(host.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use meshweave_observability::LogLevel;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["meshweave"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cluster_port, 7946);
        assert_eq!(config.overlay.listen_port, 51820);
        assert_eq!(config.overlay.interface, "wgoverlay");
        assert_eq!(config.overlay.mtu, 1420);
        assert_eq!(config.overlay.reconcile_interval, Duration::from_secs(60));
        assert_eq!(config.directory.event_backlog, 100);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/meshweave"));
        assert_eq!(config.cluster_name, "state");
        assert_eq!(config.backend, Backend::Gossip);
        assert_eq!(config.pubsub.announce_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshweave.yaml");
        std::fs::write(
            &path,
            "join: [192.168.1.1]\n\
             overlay_net: 10.221.0.0/16\n\
             interface: wgmesh\n\
             event_backlog: 10\n\
             backend: pubsub\n\
             gossip:\n  dead_timeout: 30s\n\
             log:\n  level: warn\n",
        )
        .unwrap();

        let path = path.to_string_lossy().into_owned();
        let args = cli(&["--config", &path, "--interface", "wg7", "-v"]);
        let config = Config::load(&args).unwrap();
        assert_eq!(config.join, vec!["192.168.1.1"]);
        assert_eq!(config.overlay.overlay_net.to_string(), "10.221.0.0/16");
        assert_eq!(config.overlay.interface, "wg7");
        assert_eq!(config.directory.event_backlog, 10);
        assert_eq!(config.backend, Backend::Pubsub);
        assert_eq!(config.gossip.dead_timeout, Duration::from_secs(30));
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_cluster_key_validation() {
        let mut config = Config {
            cluster_key: Some(STANDARD.encode([7u8; CLUSTER_KEY_LEN])),
            ..Config::default()
        };
        assert_eq!(config.cluster_key_bytes().unwrap(), Some(vec![7u8; CLUSTER_KEY_LEN]));

        config.cluster_key = Some(STANDARD.encode([7u8; 16]));
        assert!(config.validate().is_err());

        config.cluster_key = Some("not base64!".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_settings() {
        let config = Config {
            overlay: OverlayConfig {
                overlay_net: "10.0.0.0/12".parse().unwrap(),
                ..OverlayConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.directory.event_backlog = 0;
        assert!(config.validate().is_err());

        let config = Config {
            bind_addr: Some("10.1.1.1".parse().unwrap()),
            bind_iface: Some("eth0".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_keepalive_disables_it() {
        let config = Config::load(&cli(&["--persistent-keepalive", "0s"])).unwrap();
        assert_eq!(config.overlay.persistent_keepalive, None);
    }

    #[test]
    fn test_node_name() {
        let config = Config {
            name: Some("node-a".to_string()),
            ..Config::default()
        };
        assert_eq!(config.node_name(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).unwrap(), "node-a");

        let config = Config {
            ip_as_name: true,
            ..Config::default()
        };
        assert_eq!(
            config.node_name("192.168.1.5".parse().unwrap()).unwrap(),
            "192.168.1.5"
        );
        assert!(config.node_name(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).is_err());
    }
}
