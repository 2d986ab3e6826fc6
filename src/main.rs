//! nzb-connect binary: load config, wire the pipeline, serve the control
//! plane until interrupted.

use clap::Parser;
use nzb_connect::api::{self, AppState};
use nzb_connect::engine::Engine;
use nzb_connect::nntp::PoolManager;
use nzb_connect::postprocess::PostProcessor;
use nzb_connect::queue::QueueStore;
use nzb_connect::vpn::VpnManager;
use nzb_connect::SharedConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// VPN-bound Usenet download agent with a SABnzbd-compatible control plane
#[derive(Parser)]
#[command(name = "nzb-connect", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> nzb_connect::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "nzb-connect starting");

    let shared = SharedConfig::load(&args.config)?;
    let config = shared.snapshot().await;
    config.paths.ensure_directories().await?;

    let store = Arc::new(QueueStore::open(&config.paths.database).await?);
    store.recover_interrupted().await?;

    // The VPN coordinator installs the real interface via its up callback;
    // until then connections dial unbound (and fail fast if the queue is
    // paused below).
    let pool_manager = Arc::new(PoolManager::new(""));
    pool_manager.update_servers(&config.servers).await;

    let engine = Engine::new(
        pool_manager.clone(),
        store.clone(),
        config.paths.incomplete.clone(),
        config.engine.workers,
    );

    let post_processor = PostProcessor::new(
        store.clone(),
        config.paths.complete.clone(),
        config.postprocess.clone(),
    );
    {
        let post_processor = post_processor.clone();
        engine.on_ready(move |download| post_processor.spawn(download));
    }

    // No built-in tunnel connectors ship with the agent; managed protocols
    // fall back to monitoring the configured interface passively.
    let vpn = VpnManager::new(shared.clone(), None);
    {
        let store = store.clone();
        let pool_manager = pool_manager.clone();
        vpn.on_down(move || {
            warn!("VPN down, pausing downloads and closing connections");
            store.set_paused(true);
            let pool_manager = pool_manager.clone();
            tokio::spawn(async move { pool_manager.close_all().await });
        });
    }
    {
        let store = store.clone();
        let pool_manager = pool_manager.clone();
        let engine = engine.clone();
        let shared = shared.clone();
        vpn.on_up(move |interface| {
            info!(interface = %interface, "VPN up, resuming downloads");
            let store = store.clone();
            let pool_manager = pool_manager.clone();
            let engine = engine.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                pool_manager.set_interface(&interface).await;
                pool_manager.update_servers(&shared.servers().await).await;
                store.set_paused(false);
                engine.notify();
            });
        });
    }

    if config.vpn.enabled {
        vpn.start().await;
        if !vpn.is_up() {
            if config.vpn.protocol.is_empty() {
                warn!(
                    interface = %config.vpn.interface,
                    "VPN interface is DOWN, downloads paused"
                );
                store.set_paused(true);
            } else {
                info!(protocol = %config.vpn.protocol, "VPN connection in progress");
            }
        }
    } else {
        info!("VPN coordination disabled, downloads run unbound");
    }

    let driver = engine.start();

    let state = AppState {
        store: store.clone(),
        engine: engine.clone(),
        pool_manager: pool_manager.clone(),
        vpn: vpn.clone(),
        config: shared,
    };
    let port = config.web.port;
    let server = tokio::spawn(async move { api::serve(state, port).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        result = server => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "control plane exited");
            }
        }
    }

    engine.stop();
    let _ = driver.await;
    vpn.stop().await;
    pool_manager.close_all().await;
    store.close().await;
    info!("nzb-connect stopped");
    Ok(())
}
