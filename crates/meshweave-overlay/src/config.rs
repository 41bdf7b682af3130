//! Overlay configuration

use crate::allocator::validate_overlay_net;
use crate::error::{OverlayError, Result};
use crate::join::JoinBackoff;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the tunnel interface and the agent loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    /// Tunnel interface name
    #[serde(default = "OverlayConfig::default_interface")]
    pub interface: String,

    /// WireGuard listen port, also used as every peer's endpoint port
    #[serde(default = "OverlayConfig::default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "OverlayConfig::default_mtu")]
    pub mtu: u32,

    /// Keepalive sent to every peer; `None` disables it
    #[serde(default = "OverlayConfig::default_keepalive", with = "humantime_serde")]
    pub persistent_keepalive: Option<Duration>,

    /// Network overlay addresses are allocated from
    #[serde(default = "OverlayConfig::default_overlay_net")]
    pub overlay_net: IpNet,

    /// Networks peers may announce routes within; empty disables announced routes
    #[serde(default)]
    pub routed_nets: Vec<IpNet>,

    /// Networks this node announces
    #[serde(default)]
    pub announced_routes: Vec<IpNet>,

    /// Period of the refresh reconciliation
    #[serde(default = "OverlayConfig::default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,

    #[serde(default)]
    pub join_backoff: JoinBackoff,
}

impl OverlayConfig {
    fn default_interface() -> String {
        "wgoverlay".to_string()
    }

    fn default_listen_port() -> u16 {
        51820
    }

    fn default_mtu() -> u32 {
        1420
    }

    fn default_keepalive() -> Option<Duration> {
        Some(Duration::from_secs(25))
    }

    fn default_overlay_net() -> IpNet {
        IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 8).unwrap_or_default())
    }

    fn default_reconcile_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        validate_overlay_net(&self.overlay_net)?;
        if self.interface.is_empty() || self.interface.len() > 15 {
            return Err(OverlayError::Config(format!(
                "interface name {:?} must be 1 to 15 bytes",
                self.interface
            )));
        }
        if self.mtu < 576 {
            return Err(OverlayError::Config(format!("mtu {} is below 576", self.mtu)));
        }
        if self.reconcile_interval.is_zero() {
            return Err(OverlayError::Config("reconcile interval must be positive".to_string()));
        }
        self.join_backoff.validate()
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            interface: Self::default_interface(),
            listen_port: Self::default_listen_port(),
            mtu: Self::default_mtu(),
            persistent_keepalive: Self::default_keepalive(),
            overlay_net: Self::default_overlay_net(),
            routed_nets: Vec::new(),
            announced_routes: Vec::new(),
            reconcile_interval: Self::default_reconcile_interval(),
            join_backoff: JoinBackoff::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_config_default() {
        let config = OverlayConfig::default();
        assert_eq!(config.listen_port, 51820);
        assert_eq!(config.overlay_net.to_string(), "10.0.0.0/8");
        assert_eq!(config.interface, "wgoverlay");
        assert_eq!(config.persistent_keepalive, Some(Duration::from_secs(25)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay_config_from_partial_document() {
        let config: OverlayConfig = serde_json::from_str(
            r#"{"overlay_net": "10.221.0.0/16", "reconcile_interval": "5s", "persistent_keepalive": null}"#,
        )
        .unwrap();
        assert_eq!(config.overlay_net.prefix_len(), 16);
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.persistent_keepalive, None);
        assert_eq!(config.mtu, 1420);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let config = OverlayConfig {
            overlay_net: "10.0.0.0/12".parse().unwrap(),
            ..OverlayConfig::default()
        };
        assert!(matches!(config.validate(), Err(OverlayError::InvalidCidr(_))));

        let config = OverlayConfig {
            interface: "a-much-too-long-name".to_string(),
            ..OverlayConfig::default()
        };
        assert!(matches!(config.validate(), Err(OverlayError::Config(_))));
    }
}
