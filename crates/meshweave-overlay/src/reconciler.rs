//! Interface reconciler
//!
//! Drives the tunnel device and the host routes towards the state implied by
//! a peer-set snapshot. Every call recomputes the full desired state, so it
//! is safe to run on each membership event and on a timer. Steps run in a
//! fixed order and the first failure aborts the attempt with
//! [`OverlayError::Reconcile`](crate::error::OverlayError::Reconcile) naming
//! the step.

use crate::allocator::host_net;
use crate::config::OverlayConfig;
use crate::error::{ReconcileStep, Result};
use crate::host::{same_destination, HostNetwork, Route};
use crate::peer::{LocalIdentity, PeerSetSnapshot};
use crate::wireguard::{DeviceConfig, PeerConfig, TunnelDriver};
use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Peers configured on the device
    pub peers: usize,
    /// The device's peer set was rewritten
    pub reconfigured: bool,
    pub routes_added: usize,
    pub routes_replaced: usize,
    pub routes_removed: usize,
}

impl ReconcileReport {
    /// Nothing on the host was touched besides idempotent link settings
    pub fn is_noop(&self) -> bool {
        !self.reconfigured
            && self.routes_added == 0
            && self.routes_replaced == 0
            && self.routes_removed == 0
    }
}

/// Brings one tunnel interface in line with the cluster
pub struct Reconciler {
    config: OverlayConfig,
    private_key: String,
    driver: Arc<dyn TunnelDriver>,
    host: Arc<dyn HostNetwork>,
    /// Destinations this reconciler installed and still owns
    installed: HashSet<IpNet>,
}

impl Reconciler {
    pub fn new(
        config: OverlayConfig,
        private_key: String,
        driver: Arc<dyn TunnelDriver>,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        Self {
            config,
            private_key,
            driver,
            host,
            installed: HashSet::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    /// Apply `snapshot` to the interface
    pub async fn reconcile(
        &mut self,
        local: &LocalIdentity,
        snapshot: &PeerSetSnapshot,
    ) -> Result<ReconcileReport> {
        let device = self.config.interface.clone();
        let Plan {
            device: desired,
            routes,
        } = plan(&self.config, &self.private_key, local, snapshot);
        let mut report = ReconcileReport {
            peers: desired.peers.len(),
            ..ReconcileReport::default()
        };

        self.driver
            .ensure_device(&device)
            .await
            .map_err(|e| e.at_step(ReconcileStep::CreateDevice))?;

        let current = self
            .driver
            .device(&device)
            .await
            .map_err(|e| e.at_step(ReconcileStep::InspectDevice))?;
        let up_to_date = current.as_ref().is_some_and(|state| {
            state.public_key == local.public_key && state.matches(&desired)
        });
        if !up_to_date {
            self.driver
                .configure_device(&device, &desired)
                .await
                .map_err(|e| e.at_step(ReconcileStep::ConfigurePeers))?;
            report.reconfigured = true;
            info!(
                interface = %device,
                peers = desired.peers.len(),
                "Configured tunnel peers"
            );
        }

        self.host
            .set_address(&device, host_net(local.overlay_addr))
            .await
            .map_err(|e| e.at_step(ReconcileStep::AssignAddress))?;
        self.host
            .set_mtu(&device, self.config.mtu)
            .await
            .map_err(|e| e.at_step(ReconcileStep::SetMtu))?;
        self.host
            .set_up(&device)
            .await
            .map_err(|e| e.at_step(ReconcileStep::LinkUp))?;

        self.sync_routes(local, &routes, &mut report)
            .await
            .map_err(|e| e.at_step(ReconcileStep::Routes))?;

        if report.is_noop() {
            debug!(interface = %device, peers = report.peers, "Interface already up to date");
        } else {
            info!(
                interface = %device,
                peers = report.peers,
                reconfigured = report.reconfigured,
                routes_added = report.routes_added,
                routes_replaced = report.routes_replaced,
                routes_removed = report.routes_removed,
                "Reconciled interface"
            );
        }
        Ok(report)
    }

    /// Delete the tunnel device; an absent device is not an error
    pub async fn teardown(&mut self) -> Result<()> {
        self.driver.delete_device(&self.config.interface).await?;
        self.installed.clear();
        info!(interface = %self.config.interface, "Removed tunnel interface");
        Ok(())
    }

    async fn sync_routes(
        &mut self,
        local: &LocalIdentity,
        desired: &[Route],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let device = self.config.interface.clone();
        let current = self.host.routes(&device).await?;

        let mut installed = HashSet::new();
        for want in desired {
            let existing = current.iter().find(|r| r.matches(&want.destination));
            let result = match existing {
                None => self.host.add_route(want).await.map(|()| report.routes_added += 1),
                Some(have) if have.gateway != want.gateway => self
                    .host
                    .replace_route(want)
                    .await
                    .map(|()| report.routes_replaced += 1),
                Some(_) => Ok(()),
            };
            match result {
                Ok(()) => {
                    installed.insert(want.destination);
                }
                Err(e) => warn!(route = %want, error = %e, "Failed to install route"),
            }
        }

        let own = host_net(local.overlay_addr);
        for have in &current {
            if desired.iter().any(|want| have.matches(&want.destination))
                || same_destination(&have.destination, &own)
            {
                continue;
            }
            let owned = self
                .installed
                .iter()
                .any(|dst| same_destination(dst, &have.destination))
                || self.config.overlay_net.contains(&have.destination)
                || route_allowed(&self.config.routed_nets, &have.destination);
            if !owned {
                continue;
            }
            match self.host.delete_route(have).await {
                Ok(()) => {
                    report.routes_removed += 1;
                    debug!(route = %have, "Removed stale route");
                }
                Err(e) => {
                    warn!(route = %have, error = %e, "Failed to remove stale route");
                    installed.insert(have.destination);
                }
            }
        }

        self.installed = installed;
        Ok(())
    }
}

/// An announced route is accepted when it lies within one of `routed_nets`
fn route_allowed(routed_nets: &[IpNet], route: &IpNet) -> bool {
    routed_nets.iter().any(|net| net.contains(route))
}

/// Desired device configuration and routes for one snapshot
struct Plan {
    device: DeviceConfig,
    routes: Vec<Route>,
}

/// Work out the tunnel peers and routes `snapshot` calls for
///
/// Peers without usable metadata, peers colliding with the local address or
/// key, and duplicate keys are skipped. An announced network is accepted once,
/// from the first peer in name order, and only inside `routed_nets`.
fn plan(
    config: &OverlayConfig,
    private_key: &str,
    local: &LocalIdentity,
    snapshot: &PeerSetSnapshot,
) -> Plan {
    let device = config.interface.as_str();
    let mut peers = Vec::new();
    let mut routes = Vec::new();
    let mut seen_keys = HashSet::new();
    let mut owners: HashMap<IpNet, &str> = HashMap::new();

    for (peer, meta) in snapshot.usable() {
        if meta.overlay_addr == local.overlay_addr {
            warn!(
                peer = %peer.name,
                addr = %meta.overlay_addr,
                "Peer overlay address collides with ours, skipping"
            );
            continue;
        }
        if meta.public_key == local.public_key || !seen_keys.insert(meta.public_key.as_str()) {
            warn!(peer = %peer.name, "Duplicate tunnel public key, skipping peer");
            continue;
        }

        let overlay = host_net(meta.overlay_addr);
        let mut allowed_ips = vec![overlay];
        routes.push(Route::link(device, overlay));

        for announced in meta.routes.iter().map(IpNet::trunc) {
            if !route_allowed(&config.routed_nets, &announced) {
                debug!(
                    peer = %peer.name,
                    route = %announced,
                    "Ignoring route outside the allow-list"
                );
                continue;
            }
            if let Some(owner) = owners.get(&announced) {
                if *owner != peer.name {
                    warn!(
                        route = %announced,
                        peer = %peer.name,
                        owner = %owner,
                        "Route announced by more than one peer, keeping the first"
                    );
                }
                continue;
            }
            owners.insert(announced, peer.name.as_str());
            allowed_ips.push(announced);
            routes.push(Route::via(device, announced, meta.overlay_addr));
        }

        peers.push(PeerConfig {
            public_key: meta.public_key.clone(),
            endpoint: SocketAddr::new(peer.transport_addr, config.listen_port),
            allowed_ips,
            persistent_keepalive: config.persistent_keepalive,
        });
    }

    Plan {
        device: DeviceConfig {
            private_key: private_key.to_string(),
            listen_port: config.listen_port,
            replace_peers: true,
            peers,
        },
        routes,
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("interface", &self.config.interface)
            .field("installed", &self.installed)
            .finish_non_exhaustive()
    }
}
