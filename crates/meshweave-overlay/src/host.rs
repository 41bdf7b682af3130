//! Host network configuration
//!
//! Addresses, MTU, link state and routes of the tunnel interface, behind the
//! [`HostNetwork`] trait. [`IpCommandNetwork`] shells out to `ip`;
//! [`MockHostNetwork`] records calls for tests.

use crate::cmd;
use crate::error::{OverlayError, Result};
use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Route scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteScope {
    /// Destination is directly reachable on the link
    Link,
    /// Destination is reached through a gateway
    Universe,
}

/// A route through a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub device: String,
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub scope: RouteScope,
}

impl Route {
    /// Link-scope route to a single host
    pub fn link(device: &str, destination: IpNet) -> Self {
        Self {
            device: device.to_string(),
            destination,
            gateway: None,
            scope: RouteScope::Link,
        }
    }

    /// Route to `destination` through `gateway`
    pub fn via(device: &str, destination: IpNet, gateway: IpAddr) -> Self {
        Self {
            device: device.to_string(),
            destination,
            gateway: Some(gateway),
            scope: RouteScope::Universe,
        }
    }

    /// Same destination as `other`
    pub fn matches(&self, other: &IpNet) -> bool {
        same_destination(&self.destination, other)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gateway) = self.gateway {
            write!(f, " via {gateway}")?;
        }
        write!(f, " dev {}", self.device)
    }
}

/// Two prefixes name the same destination when they have the same length
/// and one contains the other's address
pub fn same_destination(a: &IpNet, b: &IpNet) -> bool {
    a.prefix_len() == b.prefix_len() && a.contains(&b.addr())
}

/// Interface and route operations on the host
#[async_trait::async_trait]
pub trait HostNetwork: Send + Sync {
    /// Assign `addr` to the device, replacing it if present
    async fn set_address(&self, device: &str, addr: IpNet) -> Result<()>;

    async fn set_mtu(&self, device: &str, mtu: u32) -> Result<()>;

    async fn set_up(&self, device: &str) -> Result<()>;

    /// Routes through the device, both families
    async fn routes(&self, device: &str) -> Result<Vec<Route>>;

    /// Add a route; an existing identical route is not an error
    async fn add_route(&self, route: &Route) -> Result<()>;

    async fn replace_route(&self, route: &Route) -> Result<()>;

    /// Delete a route; a missing route is not an error
    async fn delete_route(&self, route: &Route) -> Result<()>;
}

/// [`HostNetwork`] backed by the `ip` command
#[derive(Debug, Default, Clone)]
pub struct IpCommandNetwork;

impl IpCommandNetwork {
    pub fn new() -> Self {
        Self
    }

    async fn ip(&self, args: &[&str], tolerated: &[&str]) -> Result<()> {
        let out = cmd::run("ip", args).await?;
        if out.success || out.failed_with(tolerated) {
            return Ok(());
        }
        Err(OverlayError::HostNetwork(format!(
            "ip {} failed: {}",
            args.join(" "),
            out.stderr
        )))
    }

    fn route_args(route: &Route) -> Vec<String> {
        let mut args = vec![route.destination.to_string()];
        if let Some(gateway) = route.gateway {
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        args.push("dev".to_string());
        args.push(route.device.clone());
        if route.scope == RouteScope::Link {
            args.push("scope".to_string());
            args.push("link".to_string());
        }
        args
    }

    async fn route_cmd(&self, verb: &str, route: &Route, tolerated: &[&str]) -> Result<()> {
        let rest = Self::route_args(route);
        let mut args = vec!["route", verb];
        args.extend(rest.iter().map(String::as_str));
        self.ip(&args, tolerated).await
    }
}

#[derive(Debug, Deserialize)]
struct IpRouteEntry {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Parse `ip -j route show dev <device>` output
fn parse_routes(device: &str, json: &str) -> Result<Vec<Route>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<IpRouteEntry> = serde_json::from_str(json)?;
    let mut routes = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.dst == "default" {
            continue;
        }
        let destination = match entry.dst.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => match entry.dst.parse::<IpAddr>() {
                Ok(addr) => IpNet::from(addr),
                Err(_) => {
                    debug!(dst = %entry.dst, "Skipping unparseable route");
                    continue;
                }
            },
        };
        let gateway = entry.gateway.as_deref().and_then(|g| g.parse().ok());
        let scope = match (entry.scope.as_deref(), gateway) {
            (Some("link"), None) => RouteScope::Link,
            (None, None) => RouteScope::Link,
            _ => RouteScope::Universe,
        };
        routes.push(Route {
            device: device.to_string(),
            destination,
            gateway,
            scope,
        });
    }
    Ok(routes)
}

#[derive(Debug, Deserialize)]
struct IpLinkEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrEntry>,
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    local: String,
}

/// First address of `device` as listed by `ip -j addr show dev <device>`
fn parse_first_address(device: &str, json: &str) -> Result<IpAddr> {
    let links: Vec<IpLinkEntry> = serde_json::from_str(json)?;
    links
        .iter()
        .flat_map(|link| &link.addr_info)
        .find_map(|info| info.local.parse().ok())
        .ok_or_else(|| OverlayError::HostNetwork(format!("interface {device} has no address")))
}

impl IpCommandNetwork {
    /// First address assigned to `device`
    pub async fn first_address(&self, device: &str) -> Result<IpAddr> {
        let out = cmd::run("ip", &["-j", "addr", "show", "dev", device]).await?;
        if !out.success {
            return Err(OverlayError::HostNetwork(format!(
                "ip addr show dev {device} failed: {}",
                out.stderr
            )));
        }
        parse_first_address(device, &out.stdout)
    }
}

#[async_trait::async_trait]
impl HostNetwork for IpCommandNetwork {
    async fn set_address(&self, device: &str, addr: IpNet) -> Result<()> {
        let addr = addr.to_string();
        self.ip(&["addr", "replace", &addr, "dev", device], &[]).await
    }

    async fn set_mtu(&self, device: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.ip(&["link", "set", "dev", device, "mtu", &mtu], &[]).await
    }

    async fn set_up(&self, device: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", device, "up"], &[]).await
    }

    async fn routes(&self, device: &str) -> Result<Vec<Route>> {
        let mut routes = Vec::new();
        for family in ["-4", "-6"] {
            let out = cmd::run("ip", &[family, "-j", "route", "show", "dev", device]).await?;
            if !out.success {
                return Err(OverlayError::HostNetwork(format!(
                    "ip {family} route show dev {device} failed: {}",
                    out.stderr
                )));
            }
            routes.extend(parse_routes(device, &out.stdout)?);
        }
        Ok(routes)
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        self.route_cmd("add", route, &["File exists"]).await
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        self.route_cmd("replace", route, &[]).await
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        self.route_cmd("del", route, &["No such process", "Cannot find device"])
            .await
    }
}

#[derive(Default)]
struct MockState {
    addresses: HashMap<String, Vec<IpNet>>,
    mtu: HashMap<String, u32>,
    up: HashSet<String>,
    routes: Vec<Route>,
}

/// In-memory [`HostNetwork`] recording every mutating call
#[derive(Default)]
pub struct MockHostNetwork {
    state: Mutex<MockState>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl MockHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail until cleared with `None`
    pub fn fail_on(&self, op: Option<&'static str>) {
        *self.fail_on.lock() = op;
    }

    /// Mutating calls so far, e.g. `add_route 10.0.0.2/32 dev wg0`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn addresses(&self, device: &str) -> Vec<IpNet> {
        self.state
            .lock()
            .addresses
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mtu(&self, device: &str) -> Option<u32> {
        self.state.lock().mtu.get(device).copied()
    }

    pub fn is_up(&self, device: &str) -> bool {
        self.state.lock().up.contains(device)
    }

    /// Current routes through `device`
    pub fn route_table(&self, device: &str) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|r| r.device == device)
            .cloned()
            .collect()
    }

    /// Install a route without recording a call, as if added by another tool
    pub fn seed_route(&self, route: Route) {
        self.state.lock().routes.push(route);
    }

    /// Forget all state of a device, as the kernel does when it is deleted
    pub fn remove_device(&self, device: &str) {
        let mut state = self.state.lock();
        state.addresses.remove(device);
        state.mtu.remove(device);
        state.up.remove(device);
        state.routes.retain(|r| r.device != device);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if *self.fail_on.lock() == Some(op) {
            return Err(OverlayError::HostNetwork(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait::async_trait]
impl HostNetwork for MockHostNetwork {
    async fn set_address(&self, device: &str, addr: IpNet) -> Result<()> {
        self.check("set_address")?;
        let mut state = self.state.lock();
        let addresses = state.addresses.entry(device.to_string()).or_default();
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
        self.record(format!("set_address {addr} dev {device}"));
        Ok(())
    }

    async fn set_mtu(&self, device: &str, mtu: u32) -> Result<()> {
        self.check("set_mtu")?;
        self.state.lock().mtu.insert(device.to_string(), mtu);
        self.record(format!("set_mtu {mtu} dev {device}"));
        Ok(())
    }

    async fn set_up(&self, device: &str) -> Result<()> {
        self.check("set_up")?;
        self.state.lock().up.insert(device.to_string());
        self.record(format!("set_up dev {device}"));
        Ok(())
    }

    async fn routes(&self, device: &str) -> Result<Vec<Route>> {
        self.check("routes")?;
        Ok(self.route_table(device))
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        self.check("add_route")?;
        let mut state = self.state.lock();
        let exists = state
            .routes
            .iter()
            .any(|r| r.device == route.device && r.matches(&route.destination));
        if !exists {
            state.routes.push(route.clone());
        }
        self.record(format!("add_route {route}"));
        Ok(())
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        self.check("replace_route")?;
        let mut state = self.state.lock();
        state
            .routes
            .retain(|r| !(r.device == route.device && r.matches(&route.destination)));
        state.routes.push(route.clone());
        self.record(format!("replace_route {route}"));
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        self.check("delete_route")?;
        self.state
            .lock()
            .routes
            .retain(|r| !(r.device == route.device && r.matches(&route.destination)));
        self.record(format!("delete_route {route}"));
        Ok(())
    }
}
