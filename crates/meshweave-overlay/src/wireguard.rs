//! WireGuard tunnel driver
//!
//! [`TunnelDriver`] is the seam the reconciler drives. [`WgCommandDriver`]
//! implements it with the `ip` and `wg` tools; [`MockTunnelDriver`] keeps
//! device state in memory for tests.

use crate::cmd;
use crate::error::{OverlayError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Directory the generated `wg` configuration files are written to
pub const DEFAULT_WG_CONFIG_DIR: &str = "/run/meshweave";

/// Tunnel key pair, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Desired configuration of one tunnel peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
}

impl PeerConfig {
    /// `[Peer]` section in `wg` configuration syntax
    pub fn to_wg_config(&self) -> String {
        let allowed: Vec<String> = self.allowed_ips.iter().map(ToString::to_string).collect();
        let mut section = format!(
            "[Peer]\nPublicKey = {}\nEndpoint = {}\nAllowedIPs = {}\n",
            self.public_key,
            self.endpoint,
            allowed.join(", "),
        );
        if let Some(keepalive) = self.persistent_keepalive {
            section.push_str(&format!("PersistentKeepalive = {}\n", keepalive.as_secs()));
        }
        section
    }
}

/// Desired configuration of a tunnel device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: String,
    pub listen_port: u16,
    /// Drop peers that are not in `peers`
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

impl DeviceConfig {
    /// Full configuration in `wg setconf` syntax
    pub fn to_wg_config(&self) -> String {
        let mut config = format!(
            "[Interface]\nPrivateKey = {}\nListenPort = {}\n",
            self.private_key, self.listen_port,
        );
        for peer in &self.peers {
            config.push('\n');
            config.push_str(&peer.to_wg_config());
        }
        config
    }
}

/// Peer as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
}

/// Current configuration of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub public_key: String,
    pub listen_port: u16,
    pub peers: Vec<PeerState>,
}

impl DeviceState {
    /// Device already runs exactly `config`'s listen port and peer set
    pub fn matches(&self, config: &DeviceConfig) -> bool {
        if self.listen_port != config.listen_port || self.peers.len() != config.peers.len() {
            return false;
        }
        let current: HashMap<&str, &PeerState> = self
            .peers
            .iter()
            .map(|p| (p.public_key.as_str(), p))
            .collect();
        config.peers.iter().all(|want| {
            current.get(want.public_key.as_str()).is_some_and(|have| {
                have.endpoint == Some(want.endpoint)
                    && have.persistent_keepalive == want.persistent_keepalive
                    && sorted(&have.allowed_ips) == sorted(&want.allowed_ips)
            })
        })
    }
}

fn sorted(nets: &[IpNet]) -> Vec<IpNet> {
    let mut nets = nets.to_vec();
    nets.sort();
    nets
}

/// Tunnel device operations
#[async_trait::async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Generate a fresh key pair
    fn generate_key_pair(&self) -> Result<KeyPair>;

    /// Create the device; an existing device is not an error
    async fn ensure_device(&self, name: &str) -> Result<()>;

    /// Apply `config` to the device
    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()>;

    /// Current device configuration, `None` if the device does not exist
    async fn device(&self, name: &str) -> Result<Option<DeviceState>>;

    /// Delete the device; a missing device is not an error
    async fn delete_device(&self, name: &str) -> Result<()>;
}

/// Generate an x25519 key pair with native crypto
pub fn generate_keys() -> KeyPair {
    use rand::rngs::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Tracks whether the `wg` binary was found.
static WG_TOOLS_CHECKED: OnceLock<bool> = OnceLock::new();

async fn ensure_wireguard_tools() -> Result<()> {
    let available = match WG_TOOLS_CHECKED.get() {
        Some(available) => *available,
        None => {
            let found = cmd::run("wg", &["--version"])
                .await
                .map(|out| out.success)
                .unwrap_or(false);
            *WG_TOOLS_CHECKED.get_or_init(|| found)
        }
    };
    if available {
        Ok(())
    } else {
        Err(OverlayError::TunnelDriver(
            "wireguard-tools not found; install the `wg` binary (apt install wireguard-tools, \
             dnf install wireguard-tools, apk add wireguard-tools)"
                .to_string(),
        ))
    }
}

/// [`TunnelDriver`] backed by the kernel module through `ip` and `wg`
pub struct WgCommandDriver {
    config_dir: PathBuf,
}

impl WgCommandDriver {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    async fn write_config(&self, name: &str, contents: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_dir.join(format!("{name}.conf"));
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(path)
    }
}

impl Default for WgCommandDriver {
    fn default() -> Self {
        Self::new(DEFAULT_WG_CONFIG_DIR)
    }
}

#[async_trait::async_trait]
impl TunnelDriver for WgCommandDriver {
    fn generate_key_pair(&self) -> Result<KeyPair> {
        Ok(generate_keys())
    }

    async fn ensure_device(&self, name: &str) -> Result<()> {
        let out = cmd::run("ip", &["link", "add", "dev", name, "type", "wireguard"]).await?;
        if out.success {
            info!(interface = %name, "Created WireGuard interface");
            return Ok(());
        }
        if out.failed_with(&["File exists"]) {
            return Ok(());
        }
        Err(OverlayError::TunnelDriver(format!(
            "failed to create {name}: {}",
            out.stderr
        )))
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        ensure_wireguard_tools().await?;

        let path = self.write_config(name, &config.to_wg_config()).await?;
        let path_str = path.to_string_lossy().into_owned();
        let verb = if config.replace_peers {
            "setconf"
        } else {
            "addconf"
        };
        let result = cmd::run("wg", &[verb, name, &path_str]).await;
        // the file holds the private key
        let _ = tokio::fs::remove_file(&path).await;

        let out = result?;
        if !out.success {
            return Err(OverlayError::TunnelDriver(format!(
                "wg {verb} {name} failed: {}",
                out.stderr
            )));
        }
        debug!(
            interface = %name,
            peers = config.peers.len(),
            verb,
            "Applied WireGuard configuration"
        );
        Ok(())
    }

    async fn device(&self, name: &str) -> Result<Option<DeviceState>> {
        ensure_wireguard_tools().await?;

        let out = cmd::run("wg", &["show", name, "dump"]).await?;
        if out.failed_with(&["No such device", "Unable to access interface", "does not exist"]) {
            return Ok(None);
        }
        if !out.success {
            return Err(OverlayError::TunnelDriver(format!(
                "wg show {name} failed: {}",
                out.stderr
            )));
        }
        parse_dump(&out.stdout).map(Some)
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let out = cmd::run("ip", &["link", "delete", "dev", name]).await?;
        if out.success {
            info!(interface = %name, "Deleted WireGuard interface");
            return Ok(());
        }
        if out.failed_with(&["Cannot find device", "does not exist"]) {
            return Ok(());
        }
        Err(OverlayError::TunnelDriver(format!(
            "failed to delete {name}: {}",
            out.stderr
        )))
    }
}

/// Parse `wg show <dev> dump`
///
/// The first line describes the interface (private key, public key, listen
/// port, fwmark). Each further line is a peer: public key, preshared key,
/// endpoint, allowed ips, latest handshake, rx, tx, persistent keepalive.
fn parse_dump(dump: &str) -> Result<DeviceState> {
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());
    let interface = lines
        .next()
        .ok_or_else(|| OverlayError::TunnelDriver("empty wg dump".to_string()))?;
    let fields: Vec<&str> = interface.split('\t').collect();
    if fields.len() < 3 {
        return Err(OverlayError::TunnelDriver(format!(
            "unexpected interface line in wg dump: {interface}"
        )));
    }
    let listen_port = fields[2].parse().unwrap_or(0);
    let mut state = DeviceState {
        public_key: none_to_empty(fields[1]).to_string(),
        listen_port,
        peers: Vec::new(),
    };

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(OverlayError::TunnelDriver(format!(
                "unexpected peer line in wg dump: {line}"
            )));
        }
        let endpoint = match fields[2] {
            "(none)" => None,
            ep => ep.parse().ok(),
        };
        let allowed_ips = match fields[3] {
            "(none)" | "" => Vec::new(),
            ips => ips
                .split(',')
                .filter_map(|ip| ip.trim().parse().ok())
                .collect(),
        };
        let persistent_keepalive = match fields[7] {
            "off" | "0" => None,
            secs => secs.parse().ok().map(Duration::from_secs),
        };
        state.peers.push(PeerState {
            public_key: fields[0].to_string(),
            endpoint,
            allowed_ips,
            persistent_keepalive,
        });
    }
    Ok(state)
}

fn none_to_empty(field: &str) -> &str {
    if field == "(none)" {
        ""
    } else {
        field
    }
}

/// In-memory [`TunnelDriver`] recording every mutating call
#[derive(Default)]
pub struct MockTunnelDriver {
    devices: Mutex<HashMap<String, DeviceState>>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl MockTunnelDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail until cleared with `None`
    pub fn fail_on(&self, op: Option<&'static str>) {
        *self.fail_on.lock() = op;
    }

    /// Mutating calls so far, e.g. `configure_device wg0`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn device_state(&self, name: &str) -> Option<DeviceState> {
        self.devices.lock().get(name).cloned()
    }

    fn check(&self, op: &'static str, name: &str) -> Result<()> {
        if *self.fail_on.lock() == Some(op) {
            return Err(OverlayError::TunnelDriver(format!("{op} {name}: injected failure")));
        }
        Ok(())
    }

    fn record(&self, op: &str, name: &str) {
        self.calls.lock().push(format!("{op} {name}"));
    }
}

#[async_trait::async_trait]
impl TunnelDriver for MockTunnelDriver {
    fn generate_key_pair(&self) -> Result<KeyPair> {
        Ok(generate_keys())
    }

    async fn ensure_device(&self, name: &str) -> Result<()> {
        self.check("ensure_device", name)?;
        let mut devices = self.devices.lock();
        if !devices.contains_key(name) {
            devices.insert(name.to_string(), DeviceState::default());
            self.record("ensure_device", name);
        }
        Ok(())
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        self.check("configure_device", name)?;
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(name)
            .ok_or_else(|| OverlayError::TunnelDriver(format!("no device {name}")))?;
        device.public_key = derive_public_key(&config.private_key).unwrap_or_default();
        device.listen_port = config.listen_port;
        if config.replace_peers {
            device.peers.clear();
        }
        for peer in &config.peers {
            device.peers.retain(|p| p.public_key != peer.public_key);
            device.peers.push(PeerState {
                public_key: peer.public_key.clone(),
                endpoint: Some(peer.endpoint),
                allowed_ips: peer.allowed_ips.clone(),
                persistent_keepalive: peer.persistent_keepalive,
            });
        }
        self.record("configure_device", name);
        Ok(())
    }

    async fn device(&self, name: &str) -> Result<Option<DeviceState>> {
        self.check("device", name)?;
        Ok(self.devices.lock().get(name).cloned())
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        self.check("delete_device", name)?;
        if self.devices.lock().remove(name).is_some() {
            self.record("delete_device", name);
        }
        Ok(())
    }
}

/// Public key for a base64 private key
pub fn derive_public_key(private_key: &str) -> Result<String> {
    use x25519_dalek::{PublicKey, StaticSecret};

    let bytes = STANDARD
        .decode(private_key)
        .map_err(|e| OverlayError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| OverlayError::InvalidKey("private key must be 32 bytes".to_string()))?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}
