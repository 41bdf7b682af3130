//! meshweave - keeps a WireGuard interface meshed with every cluster member

mod cli;
mod config;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use meshweave_observability::init_logging;
use meshweave_overlay::{
    local_identity, Agent, GossipDirectory, IpCommandNetwork, MembershipDirectory,
    MembershipTransport, PubSubDirectory, PubSubNetwork, Reconciler, StateStore, TunnelDriver,
    UdpGossip, UdpGossipConfig, WgCommandDriver,
};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use cli::{Backend, Cli};
use config::Config;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logging(&config.log).context("Failed to initialize logging") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
    {
        Ok(rt) => match rt.block_on(run(config)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "meshweave failed");
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let host = Arc::new(IpCommandNetwork::new());
    let bind_addr = match &config.bind_iface {
        Some(iface) => host
            .first_address(iface)
            .await
            .with_context(|| format!("Failed to resolve bind interface {iface}"))?,
        None => config.static_bind_addr(),
    };
    let name = config.node_name(bind_addr)?;

    let store = StateStore::new(&config.state_dir, &config.cluster_name);
    let mut state = if config.init {
        info!(path = %store.path().display(), "Starting a fresh cluster, ignoring stored state");
        Default::default()
    } else {
        store.load().await
    };
    let generated = state
        .ensure_cluster_key(config.cluster_key_bytes()?)
        .context("Invalid cluster key")?;
    if generated {
        info!("Generated a new cluster key");
        if std::io::stdout().is_terminal() {
            println!("new cluster key generated: {}", STANDARD.encode(&state.cluster_key));
        }
    }
    if let Err(e) = store.save(&state).await {
        warn!(path = %store.path().display(), error = %e, "Failed to save cluster state");
    }

    let gossip_config = UdpGossipConfig {
        advertise_addr: config.gossip.advertise_addr,
        gossip_interval: config.gossip.gossip_interval,
        dead_timeout: config.gossip.dead_timeout,
        join_timeout: config.gossip.join_timeout,
        ..UdpGossipConfig::new(
            name.clone(),
            bind_addr,
            config.cluster_port,
            state.cluster_key.clone(),
        )
    };
    let gossip = Arc::new(
        UdpGossip::bind(gossip_config)
            .await
            .context("Failed to start membership transport")?,
    );
    let listen_addr = gossip.local_addr()?;
    info!(
        name = %name,
        addr = %listen_addr,
        backend = ?config.backend,
        "Membership transport listening"
    );

    let directory: Arc<dyn MembershipDirectory> = match config.backend {
        Backend::Gossip => Arc::new(GossipDirectory::new(
            gossip as Arc<dyn MembershipTransport>,
            store,
            state,
            config.directory.clone(),
        )),
        Backend::Pubsub => Arc::new(PubSubDirectory::new(
            gossip as Arc<dyn PubSubNetwork>,
            name.clone(),
            store,
            state,
            config.directory.clone(),
            config.pubsub.clone(),
        )),
    };

    let driver = Arc::new(WgCommandDriver::default());
    let keys = driver
        .generate_key_pair()
        .context("Failed to generate tunnel keys")?;
    let identity = local_identity(&name, &keys.public_key, &config.overlay)?;
    let reconciler = Reconciler::new(
        config.overlay.clone(),
        keys.private_key,
        driver as Arc<dyn TunnelDriver>,
        host,
    );
    let agent = Agent::new(
        directory,
        reconciler,
        identity,
        config.join.clone(),
        config.overlay.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, leaving the cluster");
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
