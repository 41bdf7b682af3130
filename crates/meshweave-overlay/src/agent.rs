//! Agent loop
//!
//! Ties a [`MembershipDirectory`] to a [`Reconciler`]: every snapshot and
//! every refresh tick is reconciled onto the interface, joining runs in its
//! own task, and shutdown leaves the cluster and removes the interface.

use crate::allocator::{allocate, validate_overlay_net};
use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::join::{run_join, wait_for_shutdown};
use crate::membership::MembershipDirectory;
use crate::peer::{LocalIdentity, PeerSetSnapshot};
use crate::reconciler::Reconciler;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Build this node's identity from its name, key and configuration
pub fn local_identity(
    name: &str,
    public_key: &str,
    config: &OverlayConfig,
) -> Result<LocalIdentity> {
    validate_overlay_net(&config.overlay_net)?;
    let overlay_addr = allocate(&config.overlay_net, name);
    Ok(LocalIdentity {
        name: name.to_string(),
        overlay_addr,
        public_key: public_key.to_string(),
        listen_port: config.listen_port,
        routes: config.announced_routes.clone(),
    })
}

/// One node's membership-to-interface loop
pub struct Agent {
    directory: Arc<dyn MembershipDirectory>,
    reconciler: Reconciler,
    identity: LocalIdentity,
    seeds: Vec<String>,
    config: OverlayConfig,
}

impl Agent {
    pub fn new(
        directory: Arc<dyn MembershipDirectory>,
        reconciler: Reconciler,
        identity: LocalIdentity,
        seeds: Vec<String>,
        config: OverlayConfig,
    ) -> Self {
        Self {
            directory,
            reconciler,
            identity,
            seeds,
            config,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Run until `shutdown` flips to `true`
    ///
    /// Only setup failures (publishing metadata, taking the event stream) are
    /// returned. Reconciliation and join failures are logged and retried.
    /// Leave and teardown run exactly once on the way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.directory.configure(&self.identity).await?;
        let mut events = self.directory.events()?;

        info!(
            name = %self.identity.name,
            overlay_addr = %self.identity.overlay_addr,
            interface = %self.reconciler.interface(),
            seeds = self.seeds.len(),
            "Starting overlay agent"
        );

        let join_task = {
            let directory = Arc::clone(&self.directory);
            let seeds = self.seeds.clone();
            let backoff = self.config.join_backoff.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match run_join(directory.as_ref(), &seeds, &backoff, shutdown).await {
                    Ok(_) | Err(OverlayError::Cancelled) => {}
                    Err(e) => error!(error = %e, "Join controller stopped"),
                }
            })
        };

        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut latest = PeerSetSnapshot::default();
        let mut events_open = true;
        loop {
            tokio::select! {
                snapshot = events.recv(), if events_open => match snapshot {
                    Some(snapshot) => {
                        debug!(peers = snapshot.len(), "Peer set changed");
                        latest = snapshot;
                        self.reconcile(&latest).await;
                    }
                    None => {
                        warn!("Membership event stream closed, continuing on refresh only");
                        events_open = false;
                    }
                },
                _ = ticker.tick() => {
                    self.reconcile(&latest).await;
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        join_task.abort();
        let _ = join_task.await;
        self.stop().await;
        Ok(())
    }

    async fn reconcile(&mut self, snapshot: &PeerSetSnapshot) {
        if let Err(e) = self.reconciler.reconcile(&self.identity, snapshot).await {
            error!(
                step = ?e.step(),
                error = %e,
                "Reconciliation failed, tearing down until the next attempt"
            );
            if let Err(e) = self.reconciler.teardown().await {
                warn!(error = %e, "Defensive teardown failed");
            }
        }
    }

    async fn stop(&mut self) {
        info!("Shutting down overlay agent");
        if let Err(e) = self.directory.leave().await {
            warn!(error = %e, "Failed to leave cluster");
        }
        if let Err(e) = self.reconciler.teardown().await {
            warn!(error = %e, "Failed to remove tunnel interface");
        }
    }
}
